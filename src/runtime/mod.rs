//! # Runtime
//!
//! Wires the pieces together for one invocation: tracing setup, provider
//! detection, config and state loading, and the command handlers the CLI
//! dispatches to.

use crate::config;
use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::executor::Executor;
use crate::model::MessageType;
use crate::notify::Notifications;
use crate::provider::{
    detect_provider_type, new_cloud_provider, Bucket as _, Builder as _, CloudProvider,
    ParamStore as _, Pipeline as _, ProviderType, Resources,
};
use crate::state::StateStore;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Default, Clone)]
pub struct RuntimeOptions {
    pub config_path: Option<PathBuf>,
    pub provider: Option<ProviderType>,
    pub prefix: Option<String>,
    pub region: Option<String>,
}

pub struct Runtime {
    pub executor: Executor,
    pub resources: Resources,
    pub provider: Arc<dyn CloudProvider>,
    pub cancel: CancellationToken,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infra_agent=info".into()),
        )
        .init();
}

/// Build the full runtime: provider, resources, merged config, state and
/// the executor. Validation failures surface before any pipeline work.
pub async fn build(options: RuntimeOptions) -> Result<Runtime> {
    let provider_type = options.provider.unwrap_or_else(detect_provider_type);
    info!(provider = %provider_type, "starting infra agent");

    let prefix = resolve_prefix(&options).await?;
    let provider = new_cloud_provider(provider_type, &prefix, options.region.as_deref())?;
    if provider.is_running_locally() {
        info!("running outside a cloud job; interactive niceties enabled");
    }
    let resources = provider
        .setup_resources()
        .await
        .context("provisioning backend resources")?;

    let cache_root = sources_cache_root();
    let (config, sources) = config::load_config(
        options.config_path.as_deref(),
        Some(resources.bucket.as_ref()),
        &cache_root,
    )
    .await?;

    let state = Arc::new(StateStore::load(resources.bucket.clone()).await?);
    config::validate_config(&config, &state.snapshot().await)?;

    let notifier = Notifications::from_config(&config.notifications);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let executor = Executor::new(
        config,
        provider.clone(),
        resources.clone(),
        sources,
        state,
        notifier,
        cancel.clone(),
    );

    Ok(Runtime {
        executor,
        resources,
        provider,
        cancel,
    })
}

/// The prefix names every derived resource, so it must be known before the
/// bucket can be found: from the config file when one is given, else from
/// the flag or the environment the cloud job carries.
async fn resolve_prefix(options: &RuntimeOptions) -> Result<String> {
    if let Some(path) = &options.config_path {
        let doc = config::load_document(Some(path), None).await?;
        if let Some(prefix) = doc.get("prefix").and_then(|v| v.as_str()) {
            return Ok(prefix.to_string());
        }
    }
    if let Some(prefix) = &options.prefix {
        return Ok(prefix.clone());
    }
    if let Ok(prefix) = std::env::var(constants::PREFIX_ENV) {
        return Ok(prefix);
    }
    Err(AgentError::Validation(format!(
        "no prefix available; pass --config, --prefix or set {}",
        constants::PREFIX_ENV
    ))
    .into())
}

fn sources_cache_root() -> PathBuf {
    std::env::var(constants::LOCAL_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".infra-agent"))
        .join("sources")
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing the current step and stopping");
            cancel.cancel();
        }
    });
}

/// `run` and `update`: one update loop. Fatal errors reach every failure
/// sink before the process exits nonzero.
pub async fn run(runtime: &Runtime) -> Result<()> {
    match runtime.executor.run().await {
        Ok(()) => {
            info!("update loop finished");
            Ok(())
        }
        Err(e) => {
            error!("update loop failed: {e}");
            runtime
                .executor
                .notifier()
                .message(MessageType::Failure, &format!("update loop failed: {e}"))
                .await;
            Err(e.into())
        }
    }
}

/// `bootstrap`: provision backend resources, publish the config document,
/// and create the agent's own job so the cloud can re-run the loop.
pub async fn bootstrap(runtime: &Runtime, config_path: Option<&PathBuf>) -> Result<()> {
    if let Some(path) = config_path {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        runtime
            .resources
            .bucket
            .put_file(constants::CONFIG_KEY, &bytes)
            .await?;
        info!("config published to the state bucket");
    }

    let agent_job = format!("{}-agent", runtime.resources.cloud_prefix);
    let image = runtime.executor.agent_image();
    runtime
        .resources
        .builder
        .create_agent_project(&agent_job, &image)
        .await
        .or_else(swallow_already_exists)?;
    runtime
        .resources
        .pipeline
        .create_agent_pipelines(&crate::provider::JobSpec {
            name: agent_job.clone(),
            image,
            files_prefix: String::new(),
            env: vec![],
            vpc: None,
            timeout: constants::PIPELINE_TIMEOUT,
        })
        .await?;

    let cron = runtime
        .executor
        .config
        .schedule
        .as_ref()
        .and_then(|s| s.update_cron.as_deref());
    runtime.provider.setup_schedule(cron).await?;

    // In-cloud bootstrap hands the first reconcile to the agent job; a
    // workstation bootstrap is followed by a local `run` instead.
    if !runtime.provider.is_running_locally() {
        runtime
            .resources
            .pipeline
            .start_agent_execution(&agent_job)
            .await?;
    }
    info!(job = %agent_job, "bootstrap complete");
    Ok(())
}

/// `delete`: the destroyer.
pub async fn delete(
    runtime: &Runtime,
    delete_bucket: bool,
    delete_service_account: bool,
) -> Result<()> {
    match runtime
        .executor
        .destroy(delete_bucket, delete_service_account)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("delete failed: {e}");
            runtime
                .executor
                .notifier()
                .message(MessageType::Failure, &format!("delete failed: {e}"))
                .await;
            Err(e.into())
        }
    }
}

/// `pull`: regenerate artifact sets without executing anything.
pub async fn pull(runtime: &Runtime) -> Result<()> {
    runtime.executor.pull().await?;
    Ok(())
}

fn custom_parameter_name(resources: &Resources, key: &str) -> String {
    format!(
        "{}/{}/{key}",
        resources.param_root(),
        constants::CUSTOM_PARAMETERS_SEGMENT
    )
}

/// The `*-custom` side channel into the parameter store, feeding the
/// `.custom.<key>` replacement namespace.
pub async fn add_custom(runtime: &Runtime, key: &str, value: &str) -> Result<()> {
    let name = custom_parameter_name(&runtime.resources, key);
    if runtime.resources.params.parameter_exists(&name).await? {
        info!(key, "custom parameter exists, overwriting");
    }
    runtime.resources.params.put_parameter(&name, value).await?;
    info!(key, "custom parameter stored");
    Ok(())
}

pub async fn get_custom(runtime: &Runtime, key: &str) -> Result<String> {
    let name = custom_parameter_name(&runtime.resources, key);
    Ok(runtime.resources.params.get_parameter(&name).await?)
}

pub async fn delete_custom(runtime: &Runtime, key: &str) -> Result<()> {
    let name = custom_parameter_name(&runtime.resources, key);
    runtime.resources.params.delete_parameter(&name).await?;
    info!(key, "custom parameter deleted");
    Ok(())
}

pub async fn list_custom(runtime: &Runtime) -> Result<Vec<String>> {
    let prefix = format!(
        "{}/{}",
        runtime.resources.param_root(),
        constants::CUSTOM_PARAMETERS_SEGMENT
    );
    let names = runtime.resources.params.list_parameters(&prefix).await?;
    Ok(names
        .into_iter()
        .filter_map(|n| n.strip_prefix(&format!("{prefix}/")).map(str::to_string))
        .collect())
}

fn swallow_already_exists(e: AgentError) -> AgentResult<()> {
    if e.is_already_exists() {
        Ok(())
    } else {
        Err(e)
    }
}
