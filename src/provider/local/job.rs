//! Local job runner: the no-cloud stand-in for the cloud build and
//! pipeline primitives. A "project" is a persisted job spec, an execution
//! runs `terraform` as a subprocess against the step's artifact set pulled
//! from the bucket, and the approval gate is an interactive prompt when a
//! terminal is attached.

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::provider::{
    Bucket, Builder, JobSpec, ParamStore, Pipeline, PlanReview, PlanSummary, ProjectInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct LocalJobRunner {
    jobs_dir: PathBuf,
    work_dir: PathBuf,
    bucket: Arc<dyn Bucket>,
    params: Arc<dyn ParamStore>,
    param_root: String,
    executions: Mutex<HashMap<String, Execution>>,
    interactive: bool,
}

#[derive(Default)]
struct Execution {
    destroy: bool,
    approved: bool,
    summary: Option<PlanSummary>,
}

impl LocalJobRunner {
    pub fn new(
        root: &Path,
        bucket: Arc<dyn Bucket>,
        params: Arc<dyn ParamStore>,
        param_root: &str,
    ) -> AgentResult<Self> {
        let jobs_dir = root.join("jobs");
        let work_dir = root.join("work");
        std::fs::create_dir_all(&jobs_dir)?;
        std::fs::create_dir_all(&work_dir)?;
        Ok(LocalJobRunner {
            jobs_dir,
            work_dir,
            bucket,
            params,
            param_root: param_root.to_string(),
            executions: Mutex::new(HashMap::new()),
            interactive: std::io::stdin().is_terminal(),
        })
    }

    fn job_path(&self, name: &str) -> PathBuf {
        self.jobs_dir.join(format!("{name}.yaml"))
    }

    async fn load_job(&self, name: &str) -> AgentResult<JobSpec> {
        let bytes = tokio::fs::read(self.job_path(name)).await.map_err(|_| {
            AgentError::NotFound(format!("job {name}"))
        })?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    async fn save_job(&self, job: &JobSpec) -> AgentResult<()> {
        tokio::fs::write(self.job_path(&job.name), serde_yaml::to_string(job)?).await?;
        Ok(())
    }

    /// Mirror the step's artifact set from the bucket into a clean working
    /// directory.
    async fn sync_workdir(&self, job: &JobSpec) -> AgentResult<PathBuf> {
        let dir = self.work_dir.join(&job.name);
        if dir.exists() {
            // Keep .terraform between runs so providers are not re-fetched;
            // refresh everything else.
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name() == ".terraform" {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        } else {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let keys = self.bucket.list_folder_files(&job.files_prefix).await?;
        if keys.is_empty() {
            return Err(AgentError::NotFound(format!(
                "artifact set under {}",
                job.files_prefix
            )));
        }
        for key in keys {
            let relative = key
                .strip_prefix(&format!("{}/", job.files_prefix))
                .unwrap_or(&key);
            let content = self.bucket.get_file(&key).await?.ok_or_else(|| {
                AgentError::NotFound(format!("bucket object {key}"))
            })?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, content).await?;
        }
        Ok(dir)
    }

    async fn terraform(&self, dir: &Path, args: &[&str]) -> AgentResult<String> {
        debug!(?args, dir = %dir.display(), "running terraform");
        let output = Command::new("terraform")
            .current_dir(dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AgentError::Execution(format!("failed to run terraform: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            let tail: String = text
                .lines()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(AgentError::Execution(format!(
                "terraform {} failed:\n{tail}",
                args.first().unwrap_or(&"")
            )));
        }
        Ok(text)
    }

    fn is_terraform_job(dir: &Path) -> bool {
        dir.join("main.tf").is_file()
    }

    fn step_name_of(job: &JobSpec) -> String {
        job.env
            .iter()
            .find(|(k, _)| k == "INFRA_AGENT_STEP")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| job.name.clone())
    }

    /// Copy root outputs named `<module>__<output>` into the parameter
    /// store, where later steps read them back.
    async fn publish_outputs(&self, job: &JobSpec, dir: &Path) -> AgentResult<()> {
        let json = self.terraform(dir, &["output", "-json", "-no-color"]).await?;
        let outputs: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json.trim()).unwrap_or_default();
        let step = Self::step_name_of(job);
        for (key, entry) in outputs {
            let Some((module, output)) = key.split_once("__") else {
                debug!(key, "skipping output without module qualifier");
                continue;
            };
            let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
            let text = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            self.params
                .put_parameter(
                    &format!("{}/{step}/{module}/{output}", self.param_root),
                    &text,
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for LocalJobRunner {
    async fn create_project(&self, job: &JobSpec) -> AgentResult<()> {
        if self.job_path(&job.name).exists() {
            return Err(AgentError::AlreadyExists(format!("job {}", job.name)));
        }
        self.save_job(job).await
    }

    async fn update_project(&self, job: &JobSpec) -> AgentResult<()> {
        self.save_job(job).await
    }

    async fn delete_project(&self, name: &str) -> AgentResult<()> {
        match tokio::fs::remove_file(self.job_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::NotFound(format!("job {name}")))
            }
            Err(e) => return Err(e.into()),
        }
        let workdir = self.work_dir.join(name);
        if workdir.exists() {
            tokio::fs::remove_dir_all(workdir).await?;
        }
        Ok(())
    }

    async fn get_project(&self, name: &str) -> AgentResult<Option<ProjectInfo>> {
        match self.load_job(name).await {
            Ok(job) => Ok(Some(ProjectInfo {
                name: job.name,
                image: job.image,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        let job = JobSpec {
            name: name.to_string(),
            image: image.to_string(),
            files_prefix: String::new(),
            env: vec![],
            vpc: None,
            timeout: constants::PIPELINE_TIMEOUT,
        };
        self.save_job(&job).await
    }

    async fn update_agent_project(&self, name: &str, image: &str) -> AgentResult<()> {
        self.create_agent_project(name, image).await
    }
}

#[async_trait]
impl Pipeline for LocalJobRunner {
    async fn create_pipeline(&self, name: &str, _job: &JobSpec) -> AgentResult<Option<String>> {
        // Local pipelines are implicit; nothing to provision, nothing
        // auto-starts.
        debug!(pipeline = name, "local pipeline is implicit");
        Ok(None)
    }

    async fn update_pipeline(&self, _name: &str, _job: &JobSpec) -> AgentResult<()> {
        Ok(())
    }

    async fn start_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.executions
            .lock()
            .await
            .insert(name.to_string(), Execution::default());
        Ok(None)
    }

    async fn start_destroy_execution(&self, name: &str) -> AgentResult<Option<String>> {
        self.executions.lock().await.insert(
            name.to_string(),
            Execution {
                destroy: true,
                ..Execution::default()
            },
        );
        Ok(None)
    }

    async fn start_agent_execution(&self, name: &str) -> AgentResult<()> {
        info!(job = name, "local mode runs the update loop in-process; nothing to start");
        Ok(())
    }

    async fn wait_for_plan(
        &self,
        name: &str,
        _execution: Option<&str>,
        destroy: bool,
    ) -> AgentResult<PlanReview> {
        let job = self.load_job(name).await?;
        let dir = self.sync_workdir(&job).await?;

        let summary = if Self::is_terraform_job(&dir) {
            let mut init_args = vec!["init", "-input=false", "-no-color"];
            if dir.join("backend.conf").is_file() {
                init_args.push("-backend-config=backend.conf");
            }
            self.terraform(&dir, &init_args).await?;

            let mut plan_args = vec!["plan", "-input=false", "-no-color", "-out=tf.plan"];
            if destroy {
                plan_args.push("-destroy");
            }
            let logs = self.terraform(&dir, &plan_args).await?;
            PlanSummary::parse_from_logs(&logs).ok_or_else(|| {
                AgentError::Execution(format!(
                    "no plan summary found in terraform output for {name}"
                ))
            })?
        } else {
            info!(job = name, "manifest-only step, nothing to plan");
            PlanSummary::default()
        };

        let mut executions = self.executions.lock().await;
        let entry = executions.entry(name.to_string()).or_default();
        entry.destroy = destroy;
        entry.summary = Some(summary);
        Ok(PlanReview {
            summary,
            console_link: None,
        })
    }

    async fn approve(&self, name: &str, _execution: Option<&str>) -> AgentResult<()> {
        let mut executions = self.executions.lock().await;
        executions
            .get_mut(name)
            .ok_or_else(|| AgentError::NotFound(format!("execution for {name}")))?
            .approved = true;
        Ok(())
    }

    async fn wait_for_manual_approval(
        &self,
        name: &str,
        _execution: Option<&str>,
        _timeout: Duration,
    ) -> AgentResult<bool> {
        if !self.interactive {
            warn!(
                job = name,
                "manual approval required but no terminal is attached"
            );
            return Ok(false);
        }
        let prompt = format!("Apply changes for {name}? [y/N] ");
        let answer = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            print!("{prompt}");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok();
            line.trim().eq_ignore_ascii_case("y")
        })
        .await
        .map_err(|e| AgentError::Execution(format!("approval prompt failed: {e}")))?;

        if answer {
            self.approve(name, None).await?;
        }
        Ok(answer)
    }

    async fn wait_for_apply(&self, name: &str, _execution: Option<&str>) -> AgentResult<()> {
        let destroy = {
            let executions = self.executions.lock().await;
            let entry = executions
                .get(name)
                .ok_or_else(|| AgentError::NotFound(format!("execution for {name}")))?;
            if !entry.approved {
                return Err(AgentError::Execution(format!(
                    "apply for {name} requested before approval"
                )));
            }
            entry.destroy
        };

        let job = self.load_job(name).await?;
        let dir = self.work_dir.join(&job.name);
        if !Self::is_terraform_job(&dir) {
            info!(job = name, "manifest-only step staged; a GitOps agent picks it up");
            return Ok(());
        }

        self.terraform(&dir, &["apply", "-input=false", "-no-color", "tf.plan"])
            .await?;
        if !destroy {
            self.publish_outputs(&job, &dir).await?;
        }
        Ok(())
    }

    async fn delete_pipeline(&self, name: &str) -> AgentResult<()> {
        self.executions.lock().await.remove(name);
        Ok(())
    }

    async fn create_agent_pipelines(&self, _update_job: &JobSpec) -> AgentResult<()> {
        debug!("local mode has no agent pipelines");
        Ok(())
    }
}
