//! # AWS Backend
//!
//! S3 bucket, SSM parameter store, CodeBuild projects and CodePipeline
//! plan → approve → apply workflows, EventBridge Scheduler for the periodic
//! update trigger. Built on the official AWS Rust SDK with ambient
//! credentials; IAM roles are expected to exist (their ARNs can be
//! overridden through `INFRA_AGENT_*_ROLE_ARN` variables).

mod bucket;
mod build;
mod params;
mod pipeline;
mod schedule;

pub use bucket::S3Bucket;
pub use build::CodeBuildBuilder;
pub use params::SsmParams;
pub use pipeline::CodePipeline;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use crate::provider::{
    encryption_key_from_outputs, BackendKind, Bucket as _, Builder as _, CloudProvider,
    ParamStore as _, ProviderType, Resources,
};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub struct AwsProvider {
    prefix: String,
    region_override: Option<String>,
    resources: OnceCell<Resources>,
    context: OnceCell<AwsContext>,
}

/// Facts established while building the bundle, needed again by the
/// schedule and delete flows.
#[derive(Clone)]
struct AwsContext {
    sdk_config: aws_config::SdkConfig,
    roles: RoleArns,
}

/// IAM role ARNs the derived resources run under. Provisioning IAM is out
/// of the agent's hands; the ARNs default to a naming convention and can be
/// overridden through the environment.
#[derive(Debug, Clone)]
pub struct RoleArns {
    pub build: String,
    pub pipeline: String,
    pub scheduler: String,
}

impl RoleArns {
    fn resolve(account_id: &str, cloud_prefix: &str) -> RoleArns {
        let default =
            |suffix: &str| format!("arn:aws:iam::{account_id}:role/{cloud_prefix}-{suffix}");
        RoleArns {
            build: std::env::var("INFRA_AGENT_BUILD_ROLE_ARN")
                .unwrap_or_else(|_| default("build")),
            pipeline: std::env::var("INFRA_AGENT_PIPELINE_ROLE_ARN")
                .unwrap_or_else(|_| default("pipeline")),
            scheduler: std::env::var("INFRA_AGENT_SCHEDULER_ROLE_ARN")
                .unwrap_or_else(|_| default("scheduler")),
        }
    }
}

impl AwsProvider {
    pub fn new(prefix: &str, region_override: Option<String>) -> Self {
        AwsProvider {
            prefix: prefix.to_string(),
            region_override,
            resources: OnceCell::new(),
            context: OnceCell::new(),
        }
    }

    fn context(&self) -> AgentResult<&AwsContext> {
        self.context.get().ok_or_else(|| {
            AgentError::Execution("AWS context requested before resources were built".into())
        })
    }

    async fn build_resources(&self, create_missing: bool) -> AgentResult<Resources> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &self.region_override {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;
        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| {
                AgentError::Validation(
                    "no AWS region configured; set AWS_REGION or pass --region".into(),
                )
            })?;

        let sts = aws_sdk_sts::Client::new(&sdk_config);
        let identity = retry_default(|| async {
            sts.get_caller_identity()
                .send()
                .await
                .map_err(|e| classify_sdk("reading caller identity", e))
        })
        .await?;
        let account_id = identity
            .account()
            .ok_or_else(|| AgentError::Execution("caller identity has no account id".into()))?
            .to_string();

        let cloud_prefix = format!("infra-agent-{}", self.prefix);
        let bucket_name = format!("{cloud_prefix}-{account_id}-{region}");
        let roles = RoleArns::resolve(&account_id, &cloud_prefix);

        let s3 = Arc::new(S3Bucket::new(&sdk_config, &bucket_name, &region));
        if create_missing {
            s3.ensure_exists().await?;
        } else if !s3.bucket_exists().await? {
            return Err(AgentError::NotFound(format!(
                "state bucket {bucket_name}; bootstrap first"
            )));
        }

        let params = Arc::new(SsmParams::new(&sdk_config));
        let builder = Arc::new(CodeBuildBuilder::new(
            &sdk_config,
            &cloud_prefix,
            &roles.build,
        ));
        let pipeline = Arc::new(CodePipeline::new(
            &sdk_config,
            &bucket_name,
            &region,
            &roles.pipeline,
        ));

        let _ = self.context.set(AwsContext {
            sdk_config: sdk_config.clone(),
            roles,
        });

        Ok(Resources {
            bucket: s3,
            pipeline,
            builder,
            params,
            provider_type: ProviderType::Aws,
            bucket_name: bucket_name.clone(),
            region: region.clone(),
            cloud_prefix,
            backend: BackendKind::S3 {
                bucket: bucket_name,
                region,
                encrypt: true,
            },
        })
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn setup_resources(&self) -> AgentResult<Resources> {
        self.resources
            .get_or_try_init(|| self.build_resources(true))
            .await
            .cloned()
    }

    async fn get_resources(&self) -> AgentResult<Resources> {
        self.resources
            .get_or_try_init(|| self.build_resources(false))
            .await
            .cloned()
    }

    async fn delete_resources(
        &self,
        delete_bucket: bool,
        delete_service_account: bool,
    ) -> AgentResult<()> {
        let resources = self.get_resources().await?;
        let sdk_config = self.context()?.sdk_config.clone();

        schedule::delete_schedule(&sdk_config, &resources.cloud_prefix).await?;

        let agent_job = format!("{}-agent", resources.cloud_prefix);
        if let Err(e) = resources.builder.delete_project(&agent_job).await {
            if !e.is_not_found() {
                warn!("deleting agent job failed: {e}");
            }
        }

        // Log groups are best effort; losing them never blocks a delete.
        if let Err(e) = delete_log_groups(&sdk_config, &resources.cloud_prefix).await {
            warn!("deleting log groups failed: {e}");
        }

        if delete_service_account {
            info!("AWS backend uses IAM roles, no service account to delete");
        }

        if delete_bucket {
            resources.bucket.delete().await?;
            info!(bucket = %resources.bucket_name, "state bucket deleted");
        }
        Ok(())
    }

    async fn add_encryption(
        &self,
        module_name: &str,
        outputs: &HashMap<String, serde_json::Value>,
    ) -> AgentResult<()> {
        match encryption_key_from_outputs(outputs) {
            Some(key_id) => {
                info!(module = module_name, key_id, "enabling parameter encryption");
                let resources = self.get_resources().await?;
                resources.params.add_encryption_key_id(&key_id).await
            }
            None => {
                warn!(
                    module = module_name,
                    "encryption module produced no recognizable key output"
                );
                Ok(())
            }
        }
    }

    async fn setup_schedule(&self, cron: Option<&str>) -> AgentResult<()> {
        let resources = self.get_resources().await?;
        let context = self.context()?.clone();
        schedule::reconcile_schedule(
            &context.sdk_config,
            &resources.cloud_prefix,
            cron,
            &context.roles.scheduler,
        )
        .await
    }

    fn is_running_locally(&self) -> bool {
        std::env::var(constants::AWS_JOB_SENTINEL).is_err()
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
    }
}

async fn delete_log_groups(
    sdk_config: &aws_config::SdkConfig,
    cloud_prefix: &str,
) -> AgentResult<()> {
    let logs = aws_sdk_cloudwatchlogs::Client::new(sdk_config);
    let groups = retry_default(|| async {
        logs.describe_log_groups()
            .log_group_name_prefix(format!("/codebuild/{cloud_prefix}"))
            .send()
            .await
            .map_err(|e| classify_sdk("listing log groups", e))
    })
    .await?;
    for group in groups.log_groups() {
        let Some(name) = group.log_group_name() else {
            continue;
        };
        let result = retry_default(|| async {
            logs.delete_log_group()
                .log_group_name(name)
                .send()
                .await
                .map_err(|e| classify_sdk("deleting log group", e))
        })
        .await;
        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Map an AWS SDK failure onto the agent's error kinds: network and
/// throttling become `Transient`, missing and duplicate resources keep
/// their identity so create/delete paths can swallow them.
pub(crate) fn classify_sdk<E, R>(what: &str, err: SdkError<E, R>) -> AgentError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            return AgentError::Transient(format!("{what}: {}", DisplayErrorContext(&err)))
        }
        SdkError::ServiceError(_) => {}
        _ => return AgentError::Other(anyhow::anyhow!("{what}: {}", DisplayErrorContext(&err))),
    }

    let code = err.code().unwrap_or_default().to_string();
    let message = format!("{what}: {}", DisplayErrorContext(&err));
    if code.contains("Throttl")
        || code == "TooManyRequestsException"
        || code == "RequestLimitExceeded"
        || code == "SlowDown"
    {
        AgentError::Transient(message)
    } else if code.contains("NotFound")
        || code.contains("NoSuch")
        || code == "ParameterNotFound"
        || code == "ResourceNotFoundException"
    {
        AgentError::NotFound(format!("{what} ({code})"))
    } else if code.contains("AlreadyExists")
        || code.contains("AlreadyOwnedByYou")
        || code == "ConflictException"
        || code == "ParameterAlreadyExists"
    {
        AgentError::AlreadyExists(format!("{what} ({code})"))
    } else {
        AgentError::Other(anyhow::anyhow!("{message}"))
    }
}
