//! Command-line entry point of the infra agent.

use anyhow::Result;
use clap::{Parser, Subcommand};
use infra_agent::provider::ProviderType;
use infra_agent::runtime::{self, RuntimeOptions};
use std::path::PathBuf;

/// Infrastructure-as-code orchestration agent
#[derive(Parser)]
#[command(name = "infra-agent")]
#[command(about = "Reconciles declarative infrastructure steps against cloud build pipelines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (read from the state bucket when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cloud backend (detected from the environment when omitted)
    #[arg(long, global = true)]
    provider: Option<ProviderType>,

    /// Resource prefix (taken from the config when omitted)
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Cloud region override
    #[arg(long, global = true)]
    region: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one update loop
    Run,
    /// Run one update loop (scheduler entry point)
    Update,
    /// First-time provisioning of backend resources and the agent's own job
    Bootstrap,
    /// Destroy all steps in reverse order, then delete backend resources
    Delete {
        /// Also delete the state bucket (destroy failures become fatal)
        #[arg(long)]
        delete_bucket: bool,

        /// Also delete the agent's service account / managed identity
        #[arg(long)]
        delete_service_account: bool,
    },
    /// Regenerate every step's files without executing anything
    Pull,
    /// Store a custom parameter for the `.custom.<key>` replacement
    AddCustom { key: String, value: String },
    /// Read a custom parameter
    GetCustom { key: String },
    /// Delete a custom parameter
    DeleteCustom { key: String },
    /// List custom parameter keys
    ListCustom,
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    let cli = Cli::parse();

    let options = RuntimeOptions {
        config_path: cli.config.clone(),
        provider: cli.provider,
        prefix: cli.prefix.clone(),
        region: cli.region.clone(),
    };
    let built = runtime::build(options).await?;

    match cli.command {
        Commands::Run | Commands::Update => runtime::run(&built).await,
        Commands::Bootstrap => runtime::bootstrap(&built, cli.config.as_ref()).await,
        Commands::Delete {
            delete_bucket,
            delete_service_account,
        } => runtime::delete(&built, delete_bucket, delete_service_account).await,
        Commands::Pull => runtime::pull(&built).await,
        Commands::AddCustom { key, value } => runtime::add_custom(&built, &key, &value).await,
        Commands::GetCustom { key } => {
            let value = runtime::get_custom(&built, &key).await?;
            println!("{value}");
            Ok(())
        }
        Commands::DeleteCustom { key } => runtime::delete_custom(&built, &key).await,
        Commands::ListCustom => {
            for key in runtime::list_custom(&built).await? {
                println!("{key}");
            }
            Ok(())
        }
    }
}
