//! CodeBuild adapter: one project per step job, plus the agent's own
//! project so the cloud can re-run the update loop.

use super::classify_sdk;
use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use crate::provider::{Builder, JobSpec, ProjectInfo};
use async_trait::async_trait;
use aws_sdk_codebuild::types::{
    ArtifactsType, CloudWatchLogsConfig, ComputeType, EnvironmentType, EnvironmentVariable,
    LogsConfig, LogsConfigStatusType, ProjectArtifacts, ProjectEnvironment, ProjectSource,
    SourceType, VpcConfig,
};

/// The step jobs run Terraform against the artifact set CodePipeline hands
/// them; the command is selected per pipeline action.
const STEP_BUILDSPEC: &str = r#"version: 0.2
phases:
  build:
    commands:
      - cd "$CODEBUILD_SRC_DIR"
      - terraform init -input=false -no-color -backend-config=backend.conf
      - |
        case "$INFRA_AGENT_COMMAND" in
          plan)         terraform plan -input=false -no-color -out=tf.plan ;;
          plan-destroy) terraform plan -destroy -input=false -no-color -out=tf.plan ;;
          apply|apply-destroy) terraform apply -input=false -no-color tf.plan ;;
          *) echo "unknown command $INFRA_AGENT_COMMAND" && exit 1 ;;
        esac
artifacts:
  files:
    - '**/*'
"#;

/// The agent project just re-runs the update loop inside the agent image.
const AGENT_BUILDSPEC: &str = r#"version: 0.2
phases:
  build:
    commands:
      - infra-agent update
"#;

pub struct CodeBuildBuilder {
    client: aws_sdk_codebuild::Client,
    cloud_prefix: String,
    service_role: String,
}

impl CodeBuildBuilder {
    pub fn new(sdk_config: &aws_config::SdkConfig, cloud_prefix: &str, service_role: &str) -> Self {
        CodeBuildBuilder {
            client: aws_sdk_codebuild::Client::new(sdk_config),
            cloud_prefix: cloud_prefix.to_string(),
            service_role: service_role.to_string(),
        }
    }

    fn log_group(&self, name: &str) -> String {
        format!("/codebuild/{}/{name}", self.cloud_prefix)
    }

    fn environment(&self, job: &JobSpec) -> AgentResult<ProjectEnvironment> {
        let mut variables = vec![EnvironmentVariable::builder()
            .name(constants::JOB_COMMAND_ENV)
            .value("plan")
            .build()
            .map_err(build_err)?];
        for (name, value) in &job.env {
            variables.push(
                EnvironmentVariable::builder()
                    .name(name)
                    .value(value)
                    .build()
                    .map_err(build_err)?,
            );
        }
        ProjectEnvironment::builder()
            .r#type(EnvironmentType::LinuxContainer)
            .compute_type(ComputeType::BuildGeneral1Small)
            .image(&job.image)
            .set_environment_variables(Some(variables))
            .build()
            .map_err(build_err)
    }

    fn logs_config(&self, name: &str) -> AgentResult<LogsConfig> {
        Ok(LogsConfig::builder()
            .cloud_watch_logs(
                CloudWatchLogsConfig::builder()
                    .status(LogsConfigStatusType::Enabled)
                    .group_name(self.log_group(name))
                    .build()
                    .map_err(build_err)?,
            )
            .build())
    }

    fn vpc_config(job: &JobSpec) -> Option<VpcConfig> {
        job.vpc.as_ref().map(|vpc| {
            VpcConfig::builder()
                .set_vpc_id(vpc.id.clone())
                .set_subnets(Some(vpc.subnet_ids.clone()))
                .set_security_group_ids(Some(vpc.security_group_ids.clone()))
                .build()
        })
    }
}

#[async_trait]
impl Builder for CodeBuildBuilder {
    async fn create_project(&self, job: &JobSpec) -> AgentResult<()> {
        let source = ProjectSource::builder()
            .r#type(SourceType::Codepipeline)
            .buildspec(STEP_BUILDSPEC)
            .build()
            .map_err(build_err)?;
        let artifacts = ProjectArtifacts::builder()
            .r#type(ArtifactsType::Codepipeline)
            .build()
            .map_err(build_err)?;
        let environment = self.environment(job)?;
        let logs = self.logs_config(&job.name)?;

        retry_default(|| async {
            self.client
                .create_project()
                .name(&job.name)
                .source(source.clone())
                .artifacts(artifacts.clone())
                .environment(environment.clone())
                .service_role(&self.service_role)
                .timeout_in_minutes((job.timeout.as_secs() / 60).min(480) as i32)
                .logs_config(logs.clone())
                .set_vpc_config(Self::vpc_config(job))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("creating project {}", job.name), e))
        })
        .await
    }

    async fn update_project(&self, job: &JobSpec) -> AgentResult<()> {
        let environment = self.environment(job)?;
        retry_default(|| async {
            self.client
                .update_project()
                .name(&job.name)
                .environment(environment.clone())
                .set_vpc_config(Self::vpc_config(job))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("updating project {}", job.name), e))
        })
        .await
    }

    async fn delete_project(&self, name: &str) -> AgentResult<()> {
        retry_default(|| async {
            self.client
                .delete_project()
                .name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("deleting project {name}"), e))
        })
        .await
    }

    async fn get_project(&self, name: &str) -> AgentResult<Option<ProjectInfo>> {
        let output = retry_default(|| async {
            self.client
                .batch_get_projects()
                .names(name)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("reading project {name}"), e))
        })
        .await?;
        Ok(output.projects().first().map(|project| ProjectInfo {
            name: project.name().unwrap_or(name).to_string(),
            image: project
                .environment()
                .map(|e| e.image().to_string())
                .unwrap_or_default(),
        }))
    }

    async fn create_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        let source = ProjectSource::builder()
            .r#type(SourceType::NoSource)
            .buildspec(AGENT_BUILDSPEC)
            .build()
            .map_err(build_err)?;
        let artifacts = ProjectArtifacts::builder()
            .r#type(ArtifactsType::NoArtifacts)
            .build()
            .map_err(build_err)?;
        let prefix = self
            .cloud_prefix
            .strip_prefix("infra-agent-")
            .unwrap_or(&self.cloud_prefix);
        let environment = ProjectEnvironment::builder()
            .r#type(EnvironmentType::LinuxContainer)
            .compute_type(ComputeType::BuildGeneral1Small)
            .image(image)
            .environment_variables(
                EnvironmentVariable::builder()
                    .name(constants::PREFIX_ENV)
                    .value(prefix)
                    .build()
                    .map_err(build_err)?,
            )
            .build()
            .map_err(build_err)?;
        let logs = self.logs_config(name)?;

        let result = retry_default(|| async {
            self.client
                .create_project()
                .name(name)
                .source(source.clone())
                .artifacts(artifacts.clone())
                .environment(environment.clone())
                .service_role(&self.service_role)
                .logs_config(logs.clone())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("creating agent project {name}"), e))
        })
        .await;
        match result {
            Err(e) if e.is_already_exists() => self.update_agent_project(name, image).await,
            other => other,
        }
    }

    async fn update_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        let prefix = self
            .cloud_prefix
            .strip_prefix("infra-agent-")
            .unwrap_or(&self.cloud_prefix);
        let environment = ProjectEnvironment::builder()
            .r#type(EnvironmentType::LinuxContainer)
            .compute_type(ComputeType::BuildGeneral1Small)
            .image(image)
            .environment_variables(
                EnvironmentVariable::builder()
                    .name(constants::PREFIX_ENV)
                    .value(prefix)
                    .build()
                    .map_err(build_err)?,
            )
            .build()
            .map_err(build_err)?;
        retry_default(|| async {
            self.client
                .update_project()
                .name(name)
                .environment(environment.clone())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("updating agent project {name}"), e))
        })
        .await
    }
}

fn build_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Validation(format!("invalid build project spec: {e}"))
}
