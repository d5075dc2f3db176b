//! CodePipeline adapter: a Source → Plan → Approve → Apply pipeline per
//! step, plus a mirrored `-destroy` pipeline whose build actions run the
//! destroy commands. Plan summaries come out of the CodeBuild CloudWatch
//! logs; the approval gate is the pipeline's manual-approval action.

use super::classify_sdk;
use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use crate::provider::{JobSpec, Pipeline, PlanReview, PlanSummary};
use async_trait::async_trait;
use aws_sdk_codepipeline::types::{
    ActionCategory, ActionDeclaration, ActionOwner, ActionTypeId, ApprovalResult, ApprovalStatus,
    ArtifactStore, ArtifactStoreType, InputArtifact, OutputArtifact, PipelineDeclaration,
    StageDeclaration, StageExecutionStatus,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SOURCE_STAGE: &str = "Source";
const PLAN_STAGE: &str = "Plan";
const APPROVE_STAGE: &str = "Approve";
const APPLY_STAGE: &str = "Apply";
const APPROVAL_ACTION: &str = "Approval";

pub struct CodePipeline {
    client: aws_sdk_codepipeline::Client,
    codebuild: aws_sdk_codebuild::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    bucket: String,
    region: String,
    role_arn: String,
    /// Step names whose current execution runs the destroy pipeline.
    destroy_active: Mutex<HashSet<String>>,
}

struct StageSnapshot {
    status: StageExecutionStatus,
    external_execution_id: Option<String>,
    token: Option<String>,
}

impl CodePipeline {
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        bucket: &str,
        region: &str,
        role_arn: &str,
    ) -> Self {
        CodePipeline {
            client: aws_sdk_codepipeline::Client::new(sdk_config),
            codebuild: aws_sdk_codebuild::Client::new(sdk_config),
            logs: aws_sdk_cloudwatchlogs::Client::new(sdk_config),
            bucket: bucket.to_string(),
            region: region.to_string(),
            role_arn: role_arn.to_string(),
            destroy_active: Mutex::new(HashSet::new()),
        }
    }

    async fn active_pipeline_name(&self, name: &str) -> String {
        if self.destroy_active.lock().await.contains(name) {
            destroy_pipeline_name(name)
        } else {
            name.to_string()
        }
    }

    fn console_link(&self, pipeline: &str) -> String {
        format!(
            "https://{region}.console.aws.amazon.com/codesuite/codepipeline/pipelines/{pipeline}/view?region={region}",
            region = self.region
        )
    }

    fn declaration(
        &self,
        pipeline_name: &str,
        job: &JobSpec,
        destroy: bool,
    ) -> AgentResult<PipelineDeclaration> {
        let source_type = ActionTypeId::builder()
            .category(ActionCategory::Source)
            .owner(ActionOwner::Aws)
            .provider("S3")
            .version("1")
            .build()
            .map_err(build_err)?;
        let build_type = ActionTypeId::builder()
            .category(ActionCategory::Build)
            .owner(ActionOwner::Aws)
            .provider("CodeBuild")
            .version("1")
            .build()
            .map_err(build_err)?;
        let approval_type = ActionTypeId::builder()
            .category(ActionCategory::Approval)
            .owner(ActionOwner::Aws)
            .provider("Manual")
            .version("1")
            .build()
            .map_err(build_err)?;

        let source_config = HashMap::from([
            ("S3Bucket".to_string(), self.bucket.clone()),
            (
                "S3ObjectKey".to_string(),
                format!("{}/source.zip", job.files_prefix),
            ),
            ("PollForSourceChanges".to_string(), "false".to_string()),
        ]);
        let plan_command = if destroy { "plan-destroy" } else { "plan" };
        let apply_command = if destroy { "apply-destroy" } else { "apply" };

        let source_action = ActionDeclaration::builder()
            .name(SOURCE_STAGE)
            .action_type_id(source_type)
            .set_configuration(Some(source_config))
            .output_artifacts(
                OutputArtifact::builder()
                    .name("source")
                    .build()
                    .map_err(build_err)?,
            )
            .build()
            .map_err(build_err)?;
        let plan_action = ActionDeclaration::builder()
            .name(PLAN_STAGE)
            .action_type_id(build_type.clone())
            .set_configuration(Some(build_configuration(&job.name, plan_command)))
            .input_artifacts(
                InputArtifact::builder()
                    .name("source")
                    .build()
                    .map_err(build_err)?,
            )
            .output_artifacts(
                OutputArtifact::builder()
                    .name("planned")
                    .build()
                    .map_err(build_err)?,
            )
            .build()
            .map_err(build_err)?;
        let approve_action = ActionDeclaration::builder()
            .name(APPROVAL_ACTION)
            .action_type_id(approval_type)
            .set_configuration(Some(HashMap::from([(
                "CustomData".to_string(),
                format!("Review the {plan_command} output before applying"),
            )])))
            .build()
            .map_err(build_err)?;
        let apply_action = ActionDeclaration::builder()
            .name(APPLY_STAGE)
            .action_type_id(build_type)
            .set_configuration(Some(build_configuration(&job.name, apply_command)))
            .input_artifacts(
                InputArtifact::builder()
                    .name("planned")
                    .build()
                    .map_err(build_err)?,
            )
            .build()
            .map_err(build_err)?;

        PipelineDeclaration::builder()
            .name(pipeline_name)
            .role_arn(&self.role_arn)
            .artifact_store(
                ArtifactStore::builder()
                    .r#type(ArtifactStoreType::S3)
                    .location(&self.bucket)
                    .build()
                    .map_err(build_err)?,
            )
            .stages(stage(SOURCE_STAGE, source_action)?)
            .stages(stage(PLAN_STAGE, plan_action)?)
            .stages(stage(APPROVE_STAGE, approve_action)?)
            .stages(stage(APPLY_STAGE, apply_action)?)
            .build()
            .map_err(build_err)
    }

    /// Returns `true` when the pipeline was newly created (and therefore
    /// auto-started its first execution).
    async fn create_or_update(&self, declaration: PipelineDeclaration) -> AgentResult<bool> {
        let result = retry_default(|| async {
            self.client
                .create_pipeline()
                .pipeline(declaration.clone())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk("creating pipeline", e))
        })
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                retry_default(|| async {
                    self.client
                        .update_pipeline()
                        .pipeline(declaration.clone())
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| classify_sdk("updating pipeline", e))
                })
                .await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// A freshly created pipeline starts its first execution on its own;
    /// find it so the caller can wait on (or stop) it.
    async fn latest_execution_id(&self, pipeline: &str) -> AgentResult<Option<String>> {
        for _ in 0..10 {
            let output = retry_default(|| async {
                self.client
                    .list_pipeline_executions()
                    .pipeline_name(pipeline)
                    .max_results(1)
                    .send()
                    .await
                    .map_err(|e| classify_sdk(&format!("listing executions of {pipeline}"), e))
            })
            .await?;
            if let Some(summary) = output.pipeline_execution_summaries().first() {
                return Ok(summary.pipeline_execution_id().map(str::to_string));
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        Ok(None)
    }

    async fn stop_execution(&self, pipeline: &str, execution_id: &str) -> AgentResult<()> {
        let result = retry_default(|| async {
            self.client
                .stop_pipeline_execution()
                .pipeline_name(pipeline)
                .pipeline_execution_id(execution_id)
                .abandon(true)
                .reason("stopped by infra-agent")
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("stopping execution of {pipeline}"), e))
        })
        .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn stage_snapshot(
        &self,
        pipeline: &str,
        stage_name: &str,
        execution: Option<&str>,
    ) -> AgentResult<Option<StageSnapshot>> {
        let output = retry_default(|| async {
            self.client
                .get_pipeline_state()
                .name(pipeline)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("reading state of {pipeline}"), e))
        })
        .await?;

        for stage in output.stage_states() {
            if stage.stage_name() != Some(stage_name) {
                continue;
            }
            let Some(latest) = stage.latest_execution() else {
                return Ok(None);
            };
            if let Some(wanted) = execution {
                if latest.pipeline_execution_id() != wanted {
                    // The stage has not reached our execution yet.
                    return Ok(None);
                }
            }
            let action = stage.action_states().first();
            return Ok(Some(StageSnapshot {
                status: latest.status().clone(),
                external_execution_id: action
                    .and_then(|a| a.latest_execution())
                    .and_then(|e| e.external_execution_id())
                    .map(str::to_string),
                token: action
                    .and_then(|a| a.latest_execution())
                    .and_then(|e| e.token())
                    .map(str::to_string),
            }));
        }
        Ok(None)
    }

    /// Poll one stage at the 30-second cadence until it settles for our
    /// execution. Returns the final snapshot.
    async fn wait_for_stage(
        &self,
        pipeline: &str,
        stage_name: &str,
        execution: Option<&str>,
        timeout: Duration,
    ) -> AgentResult<StageSnapshot> {
        let started = std::time::Instant::now();
        loop {
            if let Some(snapshot) = self.stage_snapshot(pipeline, stage_name, execution).await? {
                match snapshot.status {
                    StageExecutionStatus::Succeeded | StageExecutionStatus::Failed => {
                        return Ok(snapshot)
                    }
                    StageExecutionStatus::Cancelled | StageExecutionStatus::Stopped => {
                        return Err(AgentError::Execution(format!(
                            "{pipeline}: stage {stage_name} was stopped"
                        )))
                    }
                    _ => {}
                }
            }
            if started.elapsed() > timeout {
                return Err(AgentError::Execution(format!(
                    "{pipeline}: stage {stage_name} did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(constants::PIPELINE_POLL_INTERVAL).await;
        }
    }

    /// Pull the CodeBuild logs of a finished build, retrying while the log
    /// stream materializes.
    async fn read_build_logs(&self, build_id: &str) -> AgentResult<String> {
        let started = std::time::Instant::now();
        loop {
            match self.try_read_build_logs(build_id).await {
                Ok(Some(text)) => return Ok(text),
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if started.elapsed() > constants::LOG_READ_TIMEOUT {
                return Err(AgentError::Execution(format!(
                    "logs of build {build_id} did not appear within {}s",
                    constants::LOG_READ_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn try_read_build_logs(&self, build_id: &str) -> AgentResult<Option<String>> {
        let builds = retry_default(|| async {
            self.codebuild
                .batch_get_builds()
                .ids(build_id)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("reading build {build_id}"), e))
        })
        .await?;
        let Some(build) = builds.builds().first() else {
            return Ok(None);
        };
        let Some(logs) = build.logs() else {
            return Ok(None);
        };
        let (Some(group), Some(stream)) = (logs.group_name(), logs.stream_name()) else {
            return Ok(None);
        };

        let mut text = String::new();
        let mut token: Option<String> = None;
        loop {
            let current = token.clone();
            let page = retry_default(|| {
                let current = current.clone();
                async {
                    self.logs
                        .get_log_events()
                        .log_group_name(group)
                        .log_stream_name(stream)
                        .start_from_head(true)
                        .set_next_token(current)
                        .send()
                        .await
                        .map_err(|e| classify_sdk("reading build logs", e))
                }
            })
            .await?;
            for event in page.events() {
                if let Some(message) = event.message() {
                    text.push_str(message);
                    if !message.ends_with('\n') {
                        text.push('\n');
                    }
                }
            }
            let next = page.next_forward_token().map(str::to_string);
            if next == token || next.is_none() {
                break;
            }
            token = next;
        }
        Ok(Some(text))
    }
}

#[async_trait]
impl Pipeline for CodePipeline {
    async fn create_pipeline(&self, name: &str, job: &JobSpec) -> AgentResult<Option<String>> {
        let created = self
            .create_or_update(self.declaration(name, job, false)?)
            .await?;

        let destroy_name = destroy_pipeline_name(name);
        let destroy_created = self
            .create_or_update(self.declaration(&destroy_name, job, true)?)
            .await?;
        // The destroy pipeline must not run on creation; abandon its
        // auto-started execution.
        if destroy_created {
            if let Some(execution) = self.latest_execution_id(&destroy_name).await? {
                self.stop_execution(&destroy_name, &execution).await?;
            }
        }

        if !created {
            return Ok(None);
        }
        let execution = self.latest_execution_id(name).await?;
        info!(pipeline = name, ?execution, "pipeline created");
        Ok(execution)
    }

    async fn update_pipeline(&self, name: &str, job: &JobSpec) -> AgentResult<()> {
        self.create_or_update(self.declaration(name, job, false)?)
            .await?;
        self.create_or_update(self.declaration(&destroy_pipeline_name(name), job, true)?)
            .await?;
        Ok(())
    }

    async fn start_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.destroy_active.lock().await.remove(name);
        let output = retry_default(|| async {
            self.client
                .start_pipeline_execution()
                .name(name)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("starting pipeline {name}"), e))
        })
        .await?;
        Ok(output.pipeline_execution_id().map(str::to_string))
    }

    async fn start_destroy_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.destroy_active.lock().await.insert(name.to_string());
        let destroy_name = destroy_pipeline_name(name);
        let output = retry_default(|| async {
            self.client
                .start_pipeline_execution()
                .name(&destroy_name)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("starting pipeline {destroy_name}"), e))
        })
        .await?;
        Ok(output.pipeline_execution_id().map(str::to_string))
    }

    async fn start_agent_execution(&self, name: &str) -> AgentResult<()> {
        retry_default(|| async {
            self.codebuild
                .start_build()
                .project_name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("starting agent job {name}"), e))
        })
        .await
    }

    async fn wait_for_plan(
        &self,
        name: &str,
        execution: Option<&str>,
        destroy: bool,
    ) -> AgentResult<PlanReview> {
        let pipeline = if destroy {
            destroy_pipeline_name(name)
        } else {
            name.to_string()
        };
        let snapshot = self
            .wait_for_stage(&pipeline, PLAN_STAGE, execution, constants::PIPELINE_TIMEOUT)
            .await?;

        if snapshot.status == StageExecutionStatus::Failed {
            let detail = match &snapshot.external_execution_id {
                Some(build_id) => self
                    .read_build_logs(build_id)
                    .await
                    .map(|logs| tail(&logs, 15))
                    .unwrap_or_default(),
                None => String::new(),
            };
            return Err(AgentError::Execution(format!(
                "{pipeline}: plan failed\n{detail}"
            )));
        }

        let build_id = snapshot.external_execution_id.ok_or_else(|| {
            AgentError::Execution(format!("{pipeline}: plan stage has no build id"))
        })?;
        let logs = self.read_build_logs(&build_id).await?;
        let summary = PlanSummary::parse_from_logs(&logs).ok_or_else(|| {
            AgentError::Execution(format!(
                "{pipeline}: no plan summary found in the build logs"
            ))
        })?;
        debug!(pipeline = %pipeline, %summary, "plan finished");
        Ok(PlanReview {
            summary,
            console_link: Some(self.console_link(&pipeline)),
        })
    }

    async fn approve(&self, name: &str, execution: Option<&str>) -> AgentResult<()> {
        let pipeline = self.active_pipeline_name(name).await;
        // The approval token only exists once the stage is in progress.
        let started = std::time::Instant::now();
        let token = loop {
            if let Some(snapshot) = self
                .stage_snapshot(&pipeline, APPROVE_STAGE, execution)
                .await?
            {
                if let Some(token) = snapshot.token {
                    break token;
                }
            }
            if started.elapsed() > constants::LOG_READ_TIMEOUT {
                return Err(AgentError::Execution(format!(
                    "{pipeline}: approval token never appeared"
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        };

        retry_default(|| async {
            self.client
                .put_approval_result()
                .pipeline_name(&pipeline)
                .stage_name(APPROVE_STAGE)
                .action_name(APPROVAL_ACTION)
                .token(&token)
                .result(
                    ApprovalResult::builder()
                        .summary("auto-approved by infra-agent")
                        .status(ApprovalStatus::Approved)
                        .build()
                        .map_err(build_err)?,
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("approving {pipeline}"), e))
        })
        .await
    }

    async fn wait_for_manual_approval(
        &self,
        name: &str,
        execution: Option<&str>,
        timeout: Duration,
    ) -> AgentResult<bool> {
        let pipeline = self.active_pipeline_name(name).await;
        match self
            .wait_for_stage(&pipeline, APPROVE_STAGE, execution, timeout)
            .await
        {
            Ok(snapshot) => Ok(snapshot.status == StageExecutionStatus::Succeeded),
            Err(AgentError::Execution(msg)) if msg.contains("did not finish") => {
                warn!(pipeline = %pipeline, "manual approval timed out");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_apply(&self, name: &str, execution: Option<&str>) -> AgentResult<()> {
        let pipeline = self.active_pipeline_name(name).await;
        let snapshot = self
            .wait_for_stage(&pipeline, APPLY_STAGE, execution, constants::PIPELINE_TIMEOUT)
            .await?;
        if snapshot.status == StageExecutionStatus::Failed {
            let detail = match &snapshot.external_execution_id {
                Some(build_id) => self
                    .read_build_logs(build_id)
                    .await
                    .map(|logs| tail(&logs, 15))
                    .unwrap_or_default(),
                None => String::new(),
            };
            return Err(AgentError::Execution(format!(
                "{pipeline}: apply failed\n{detail}"
            )));
        }
        Ok(())
    }

    async fn delete_pipeline(&self, name: &str) -> AgentResult<()> {
        for pipeline in [name.to_string(), destroy_pipeline_name(name)] {
            let result = retry_default(|| async {
                self.client
                    .delete_pipeline()
                    .name(&pipeline)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk(&format!("deleting pipeline {pipeline}"), e))
            })
            .await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_agent_pipelines(&self, update_job: &JobSpec) -> AgentResult<()> {
        // The agent re-runs through its CodeBuild project; this only
        // verifies bootstrap created it.
        let exists = retry_default(|| async {
            self.codebuild
                .batch_get_projects()
                .names(&update_job.name)
                .send()
                .await
                .map_err(|e| classify_sdk("checking agent project", e))
        })
        .await?;
        if exists.projects().is_empty() {
            return Err(AgentError::NotFound(format!(
                "agent job {}; bootstrap first",
                update_job.name
            )));
        }
        Ok(())
    }
}

fn destroy_pipeline_name(name: &str) -> String {
    format!("{name}-destroy")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn build_configuration(project: &str, command: &str) -> HashMap<String, String> {
    let env = serde_json::json!([{
        "name": constants::JOB_COMMAND_ENV,
        "value": command,
        "type": "PLAINTEXT",
    }]);
    HashMap::from([
        ("ProjectName".to_string(), project.to_string()),
        ("EnvironmentVariables".to_string(), env.to_string()),
    ])
}

fn stage(name: &str, action: ActionDeclaration) -> AgentResult<StageDeclaration> {
    StageDeclaration::builder()
        .name(name)
        .actions(action)
        .build()
        .map_err(build_err)
}

fn build_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Validation(format!("invalid pipeline declaration: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_pipelines_carry_a_suffix() {
        assert_eq!(destroy_pipeline_name("t1-net-dev"), "t1-net-dev-destroy");
    }

    #[test]
    fn build_configuration_selects_the_job_command() {
        let config = build_configuration("t1-net-dev", "plan-destroy");
        assert_eq!(config["ProjectName"], "t1-net-dev");
        assert!(config["EnvironmentVariables"].contains("plan-destroy"));
    }
}
