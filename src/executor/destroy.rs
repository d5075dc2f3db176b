//! # Destroyer
//!
//! The reverse of the update loop: walks steps in reverse order, drives
//! `plan-destroy` → approval → `apply-destroy` on each step's pipeline,
//! deletes the step's backend resources, and finally tears down the
//! provider's own resources. Destroy failures are warnings unless the
//! caller asked for a hard delete (`--delete-bucket`).

use super::{approval, Executor};
use crate::errors::{AgentError, AgentResult};
use crate::generator::Generator;
use crate::model::Step;
use crate::provider::{Bucket as _, Builder as _, ParamStore as _, Pipeline as _, StepStatus};
use tracing::{info, warn};

impl Executor {
    /// Destroy everything in reverse step order, then delete the backend
    /// resources.
    pub async fn destroy(
        &self,
        delete_bucket: bool,
        delete_service_account: bool,
    ) -> AgentResult<()> {
        self.state.acquire_run_lock().await?;
        let result = self
            .destroy_inner(delete_bucket, delete_service_account)
            .await;
        // With the bucket gone there is no lock object left to release.
        if !(delete_bucket && result.is_ok()) {
            if let Err(e) = self.state.release_run_lock().await {
                warn!("releasing the run lock failed: {e}");
            }
        }
        result
    }

    async fn destroy_inner(
        &self,
        delete_bucket: bool,
        delete_service_account: bool,
    ) -> AgentResult<()> {
        self.state.reconcile(&self.config).await?;

        for step in self.config.steps.iter().rev() {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Execution("destroy cancelled".into()));
            }
            match self.destroy_step(step).await {
                Ok(()) => self.cleanup_step(step).await?,
                Err(e) if !delete_bucket => {
                    warn!(step = %step.name, "destroy failed, skipping: {e}");
                    self.notifier
                        .step_state(
                            StepStatus::Failed,
                            &step.name,
                            &step.workspace,
                            Some(&e.to_string()),
                        )
                        .await;
                }
                Err(e) => {
                    return Err(AgentError::Destroy(format!(
                        "step '{}': {e}; aborting hard delete",
                        step.name
                    )))
                }
            }
        }

        self.provider
            .delete_resources(delete_bucket, delete_service_account)
            .await?;
        info!("backend resources deleted");
        Ok(())
    }

    /// Destroy the steps the config marks `remove: true`, in reverse config
    /// order, then elide them from state. Used by the update loop before
    /// any release work.
    pub(super) async fn process_removals(&self, hard: bool) -> AgentResult<()> {
        let state = self.state.snapshot().await;
        let removals: Vec<&Step> = self
            .config
            .steps
            .iter()
            .rev()
            .filter(|s| s.remove && state.find_step(&s.name, &s.workspace).is_some())
            .collect();

        for step in removals {
            info!(step = %step.name, "step is marked for removal, destroying first");
            self.notifier
                .step_state(StepStatus::Destroying, &step.name, &step.workspace, None)
                .await;
            match self.destroy_step(step).await {
                Ok(()) => {
                    self.cleanup_step(step).await?;
                    self.notifier
                        .step_state(StepStatus::Destroyed, &step.name, &step.workspace, None)
                        .await;
                }
                Err(e) if !hard => {
                    warn!(step = %step.name, "destroy failed, step kept for the next run: {e}");
                    self.notifier
                        .step_state(
                            StepStatus::Failed,
                            &step.name,
                            &step.workspace,
                            Some(&e.to_string()),
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drive one step's destroy pipeline through plan, approval and apply.
    pub(crate) async fn destroy_step(&self, step: &Step) -> AgentResult<()> {
        let folder = Generator::step_files_prefix(&self.config.prefix, step);
        if !self.resources.bucket.check_folder_exists(&folder).await? {
            info!(step = %step.name, "no artifact set in the bucket, nothing to destroy");
            return Ok(());
        }

        let job = self.job_spec(step);
        self.ensure_project(&job).await?;
        if let Some(execution) = self.resources.pipeline.create_pipeline(&job.name, &job).await? {
            // A brand-new pipeline auto-starts a forward run we don't want
            // during destroy; let it be superseded by the destroy execution.
            info!(step = %step.name, execution, "ignoring initial forward execution");
        }
        let execution = self
            .resources
            .pipeline
            .start_destroy_execution(&job.name)
            .await?;

        let review = self
            .guard(self.resources.pipeline.wait_for_plan(
                &job.name,
                execution.as_deref(),
                true,
            ))
            .await?;
        let decision = approval::decide_destroy(step.approve, &review.summary);
        self.pass_approval_gate(step, &job, execution.as_deref(), &review, decision)
            .await?;

        self.guard(
            self.resources
                .pipeline
                .wait_for_apply(&job.name, execution.as_deref()),
        )
        .await
        .map_err(|e| AgentError::Destroy(e.to_string()))
    }

    /// Delete the step's job, pipeline, artifact files, published secrets
    /// and state entry.
    async fn cleanup_step(&self, step: &Step) -> AgentResult<()> {
        let job_name = step.folder(&self.config.prefix);
        for result in [
            self.resources.pipeline.delete_pipeline(&job_name).await,
            self.resources.builder.delete_project(&job_name).await,
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let folder = Generator::step_files_prefix(&self.config.prefix, step);
        self.resources.bucket.delete_folder(&folder).await?;

        for module in &step.modules {
            if module.http_username.is_none() && module.http_password.is_none() {
                continue;
            }
            let base = format!(
                "{}/secrets/{}/{}",
                self.resources.param_root(),
                step.name,
                module.name
            );
            for secret in ["http_username", "http_password"] {
                match self
                    .resources
                    .params
                    .delete_secret(&format!("{base}/{secret}"))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let (name, workspace) = (step.name.clone(), step.workspace.clone());
        self.state
            .update(move |state| {
                state
                    .steps
                    .retain(|s| !(s.name == name && s.workspace == workspace));
            })
            .await
    }
}
