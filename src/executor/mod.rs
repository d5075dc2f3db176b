//! # Step Executor
//!
//! The update loop. One `run()` walks every pending release in ascending
//! order; within a release the steps execute in dependency order, each one
//! through the per-step state machine: generate files, push them, drive the
//! pipeline through plan, the approval gate and apply, read the step's
//! outputs, persist the applied version — then the next step. A failed step
//! aborts the run with state untouched for that step.

pub mod approval;
pub mod dag;
mod destroy;

use crate::constants;
use crate::errors::{AgentError, AgentResult};
use crate::generator::{FileSet, Generator, ModuleRender};
use crate::model::{Config, Step, StepType};
use crate::notify::Notifications;
use crate::provider::{
    Bucket as _, Builder as _, CloudProvider, JobSpec, ParamStore as _, Pipeline as _, PlanReview,
    Resources, StepStatus,
};
use crate::sources::{ModuleSource as _, SourceSet};
use crate::state::StateStore;
use crate::template::{ModuleOutputs, Replacer, StepOutputs};
use approval::ApprovalDecision;
use chrono::Utc;
use futures::future::join_all;
use semver::Version;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Executor {
    pub config: Config,
    provider: Arc<dyn CloudProvider>,
    resources: Resources,
    sources: SourceSet,
    state: Arc<StateStore>,
    notifier: Notifications,
    agent_version: String,
    outputs: Mutex<StepOutputs>,
    cancel: CancellationToken,
}

/// Release schedule of one step for this run.
struct StepPlan {
    step_index: usize,
    /// Ascending releases this step visits.
    releases: Vec<Version>,
    modules: Vec<PlannedModule>,
    /// Smallest applied version across the step's modules; `None` while any
    /// module is unapplied.
    base: Option<Version>,
}

struct PlannedModule {
    module_index: usize,
    repo_url: String,
    target: Version,
    /// The module's own applied version; renders never go below it.
    applied: Option<Version>,
}

impl PlannedModule {
    /// The version this module renders at for one release of the step's
    /// walk: capped by the module's target, and never below what is
    /// already applied, so a step whose modules sit at different versions
    /// cannot drag an ahead module through an older release.
    fn render_version(&self, release: &Version) -> Version {
        let mut version = self.target.clone().min(release.clone());
        if let Some(applied) = &self.applied {
            if *applied > version {
                version = applied.clone();
            }
        }
        version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Applied,
    Skipped,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        provider: Arc<dyn CloudProvider>,
        resources: Resources,
        sources: SourceSet,
        state: Arc<StateStore>,
        notifier: Notifications,
        cancel: CancellationToken,
    ) -> Self {
        let agent_version = config
            .agent_version
            .clone()
            .unwrap_or_else(|| constants::DEFAULT_AGENT_VERSION.to_string());
        Executor {
            config,
            provider,
            resources,
            sources,
            state,
            notifier,
            agent_version,
            outputs: Mutex::new(StepOutputs::default()),
            cancel,
        }
    }

    pub fn agent_image(&self) -> String {
        format!("{}:{}", constants::AGENT_IMAGE, self.agent_version)
    }

    pub fn notifier(&self) -> &Notifications {
        &self.notifier
    }

    /// One update loop: reconcile state, destroy removed steps, then walk
    /// every pending release in ascending order.
    pub async fn run(&self) -> AgentResult<()> {
        let cron = self
            .config
            .schedule
            .as_ref()
            .and_then(|s| s.update_cron.as_deref());
        self.provider.setup_schedule(cron).await?;

        self.state.acquire_run_lock().await?;
        let result = self.run_inner().await;
        if let Err(e) = self.state.release_run_lock().await {
            warn!("releasing the run lock failed: {e}");
        }
        result
    }

    async fn run_inner(&self) -> AgentResult<()> {
        self.state.reconcile(&self.config).await?;
        self.process_removals(false).await?;

        let plans = self.plan_steps().await?;
        let all_releases: BTreeSet<Version> = plans
            .iter()
            .flat_map(|p| p.releases.iter().cloned())
            .collect();

        for release in &all_releases {
            if self.cancel.is_cancelled() {
                info!("cancelled; stopping after the last completed step");
                return Err(AgentError::Execution("run cancelled".into()));
            }

            let active: Vec<usize> = plans
                .iter()
                .filter(|p| p.releases.contains(release))
                .map(|p| p.step_index)
                .collect();
            if active.is_empty() {
                continue;
            }
            info!(release = %release, steps = active.len(), "starting release iteration");

            let batches = dag::execution_batches(&self.config, &active)?;
            for batch in batches {
                self.execute_batch(&plans, &batch, release).await?;
            }
        }

        self.record_base_config().await
    }

    /// After a fully successful pass, the merged base profile's release is
    /// the applied one.
    async fn record_base_config(&self) -> AgentResult<()> {
        if self.config.base_config.is_none() {
            return Ok(());
        }
        let applied = match self.sources.release_limit() {
            Some(version) => version.clone(),
            None => {
                self.sources
                    .primary()
                    .client
                    .latest_release()
                    .await?
            }
        };
        self.state
            .update(move |state| {
                state.base_config.version = Some(applied.clone());
                state.base_config.applied_version = Some(applied);
            })
            .await
    }

    /// Generate and push every step's artifact set at its target release
    /// without starting any pipeline.
    pub async fn pull(&self) -> AgentResult<()> {
        self.state.reconcile(&self.config).await?;
        let plans = self.plan_steps().await?;
        for plan in &plans {
            let Some(release) = plan.releases.last() else {
                continue;
            };
            let step = &self.config.steps[plan.step_index];
            let files = self.generate_files(plan, release).await?;
            self.push_files(step, &files).await?;
            info!(step = %step.name, release = %release, "artifact set written");
        }
        Ok(())
    }

    async fn execute_batch(
        &self,
        plans: &[StepPlan],
        batch: &[usize],
        release: &Version,
    ) -> AgentResult<()> {
        let batch_plans: Vec<&StepPlan> = plans
            .iter()
            .filter(|p| batch.contains(&p.step_index))
            .collect();

        if self.config.allow_parallel && batch_plans.len() > 1 {
            let results = join_all(
                batch_plans
                    .iter()
                    .map(|plan| self.execute_step_reporting(plan, release)),
            )
            .await;
            for result in results {
                result?;
            }
        } else {
            for plan in batch_plans {
                self.execute_step_reporting(plan, release).await?;
            }
        }
        Ok(())
    }

    async fn execute_step_reporting(
        &self,
        plan: &StepPlan,
        release: &Version,
    ) -> AgentResult<()> {
        let step = &self.config.steps[plan.step_index];
        match self.execute_step_at(plan, release).await {
            Ok(StepOutcome::Applied) => {
                self.notifier
                    .step_state(StepStatus::Applied, &step.name, &step.workspace, None)
                    .await;
                Ok(())
            }
            Ok(StepOutcome::Skipped) => {
                info!(step = %step.name, release = %release, "no changes, skipped");
                Ok(())
            }
            Err(e) => {
                self.notifier
                    .step_state(
                        StepStatus::Failed,
                        &step.name,
                        &step.workspace,
                        Some(&e.to_string()),
                    )
                    .await;
                Err(e.context(&format!(
                    "step '{}' (workspace '{}') at release {release}",
                    step.name, step.workspace
                )))
            }
        }
    }

    /// The per-step state machine for one release.
    async fn execute_step_at(
        &self,
        plan: &StepPlan,
        release: &Version,
    ) -> AgentResult<StepOutcome> {
        let step = &self.config.steps[plan.step_index];

        // PENDING -> READY: materialize the artifact set at this release.
        let files = self.generate_files(plan, release).await?;

        if self.step_is_current(plan, release).await? && self.files_unchanged(step, &files).await? {
            return Ok(StepOutcome::Skipped);
        }

        // READY -> WAITING_PIPELINE: push files and drive the job.
        self.push_files(step, &files).await?;
        self.publish_module_secrets(step).await?;
        let job = self.job_spec(step);
        if self.ensure_project(&job).await? {
            // The job image moved; refresh the pipeline wiring with it.
            self.resources.pipeline.update_pipeline(&job.name, &job).await?;
        }
        let execution = match self.resources.pipeline.create_pipeline(&job.name, &job).await? {
            Some(execution) => Some(execution),
            None => self.resources.pipeline.start_execution(&job.name).await?,
        };

        self.notifier
            .step_state(StepStatus::Planning, &step.name, &step.workspace, None)
            .await;
        let review = self
            .guard(self.resources.pipeline.wait_for_plan(
                &job.name,
                execution.as_deref(),
                false,
            ))
            .await?;

        // APPROVAL_GATE.
        let bump = approval::bump_between(plan.base.as_ref(), release);
        let decision = approval::decide(step.approve, &review.summary, bump);
        self.pass_approval_gate(step, &job, execution.as_deref(), &review, decision)
            .await?;

        // APPLYING.
        self.notifier
            .step_state(StepStatus::Applying, &step.name, &step.workspace, None)
            .await;
        self.guard(
            self.resources
                .pipeline
                .wait_for_apply(&job.name, execution.as_deref()),
        )
        .await?;

        // POST_APPLY: read outputs, persist state before the next step.
        self.collect_outputs(step).await?;
        self.persist_applied(plan, release).await?;
        Ok(StepOutcome::Applied)
    }

    async fn pass_approval_gate(
        &self,
        step: &Step,
        job: &JobSpec,
        execution: Option<&str>,
        review: &PlanReview,
        decision: ApprovalDecision,
    ) -> AgentResult<()> {
        match decision {
            ApprovalDecision::Refuse(reason) => Err(AgentError::Execution(reason)),
            ApprovalDecision::Auto => {
                self.resources.pipeline.approve(&job.name, execution).await
            }
            ApprovalDecision::Manual => {
                self.notifier
                    .manual_approval(&step.name, &review.summary, review.console_link.as_deref())
                    .await;
                let approved = self
                    .guard(self.resources.pipeline.wait_for_manual_approval(
                        &job.name,
                        execution,
                        constants::PIPELINE_TIMEOUT,
                    ))
                    .await?;
                if !approved {
                    return Err(AgentError::Execution(format!(
                        "manual approval for step '{}' timed out or was rejected",
                        step.name
                    )));
                }
                Ok(())
            }
        }
    }

    async fn generate_files(&self, plan: &StepPlan, release: &Version) -> AgentResult<FileSet> {
        let step = &self.config.steps[plan.step_index];
        let outputs = self.outputs.lock().await.clone();
        let param_root = self.resources.param_root();
        let replacer = Replacer::new(
            &self.config,
            &self.agent_version,
            self.resources.params.as_ref(),
            &outputs,
            &param_root,
        );
        let generator = Generator {
            replacer: &replacer,
            provider_type: self.resources.provider_type,
            backend: &self.resources.backend,
            prefix: &self.config.prefix,
        };

        let renders: Vec<ModuleRender<'_>> = plan
            .modules
            .iter()
            .map(|planned| {
                let module = &step.modules[planned.module_index];
                ModuleRender {
                    module,
                    repo_url: planned.repo_url.clone(),
                    version: planned.render_version(release),
                }
            })
            .collect();
        generator.files_for_step(step, &renders).await
    }

    /// Every module already applied at (or past) what this release would
    /// render.
    async fn step_is_current(&self, plan: &StepPlan, release: &Version) -> AgentResult<bool> {
        let step = &self.config.steps[plan.step_index];
        let state = self.state.snapshot().await;
        let Some(state_step) = state.find_step(&step.name, &step.workspace) else {
            return Ok(false);
        };
        for planned in &plan.modules {
            let module = &step.modules[planned.module_index];
            let render = planned.render_version(release);
            let applied = state_step
                .find_module(&module.name)
                .and_then(|m| m.applied_version.as_ref());
            match applied {
                Some(applied) if *applied >= render => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Rendered bytes equal what is already in the bucket: a re-run with no
    /// changes starts no pipeline. A stale extra file (say, a dropped
    /// module's values document) counts as a change.
    async fn files_unchanged(&self, step: &Step, files: &FileSet) -> AgentResult<bool> {
        let folder = Generator::step_files_prefix(&self.config.prefix, step);
        let existing = self
            .resources
            .bucket
            .list_folder_files_with_exclude(&folder, &["source.zip".to_string()])
            .await?;
        if existing.len() != files.len() {
            return Ok(false);
        }
        for (path, content) in files {
            let existing = self
                .resources
                .bucket
                .get_file(&format!("{folder}/{path}"))
                .await?;
            if existing.as_deref() != Some(content.as_slice()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn push_files(&self, step: &Step, files: &FileSet) -> AgentResult<()> {
        let folder = Generator::step_files_prefix(&self.config.prefix, step);

        // Drop leftovers from a previous shape of the step.
        let stale = self
            .resources
            .bucket
            .list_folder_files_with_exclude(&folder, &["source.zip".to_string()])
            .await?;
        for key in stale {
            let kept = files
                .keys()
                .any(|path| key == format!("{folder}/{path}"));
            if !kept {
                match self.resources.bucket.delete_file(&key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for (path, content) in files {
            self.resources
                .bucket
                .put_file(&format!("{folder}/{path}"), content)
                .await?;
        }
        // Pipeline source actions consume the set as a single archive.
        let archive = zip_file_set(files)?;
        self.resources
            .bucket
            .put_file(&format!("{folder}/source.zip"), &archive)
            .await?;
        Ok(())
    }

    fn job_spec(&self, step: &Step) -> JobSpec {
        let name = step.folder(&self.config.prefix);
        JobSpec {
            files_prefix: format!("{}/{}", constants::STEPS_PREFIX, name),
            name,
            image: self.agent_image(),
            env: vec![
                ("INFRA_AGENT_STEP".to_string(), step.name.clone()),
                ("INFRA_AGENT_WORKSPACE".to_string(), step.workspace.clone()),
            ],
            vpc: step.vpc.clone(),
            timeout: constants::PIPELINE_TIMEOUT,
        }
    }

    /// Create or update the step's job. Returns `true` when an existing
    /// project had to change.
    async fn ensure_project(&self, job: &JobSpec) -> AgentResult<bool> {
        match self.resources.builder.get_project(&job.name).await? {
            Some(info) if info.image == job.image => return Ok(false),
            Some(_) => {
                self.resources.builder.update_project(job).await?;
                return Ok(true);
            }
            None => {}
        }
        match self.resources.builder.create_project(job).await {
            Ok(()) => Ok(false),
            Err(e) if e.is_already_exists() => {
                self.resources.builder.update_project(job).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Private client modules authenticate their downloads with credentials
    /// the job reads back from the secret store. Secrets live under their
    /// own `secrets/` subtree so the output reader never scans them.
    async fn publish_module_secrets(&self, step: &Step) -> AgentResult<()> {
        for module in &step.modules {
            let base = format!(
                "{}/secrets/{}/{}",
                self.resources.param_root(),
                step.name,
                module.name
            );
            if let Some(username) = &module.http_username {
                self.resources
                    .params
                    .put_secret(&format!("{base}/http_username"), username)
                    .await?;
            }
            if let Some(password) = &module.http_password {
                self.resources
                    .params
                    .put_secret(&format!("{base}/http_password"), password)
                    .await?;
            }
        }
        Ok(())
    }

    /// Read the outputs the apply job published into the parameter store
    /// and make them available to later steps.
    async fn collect_outputs(&self, step: &Step) -> AgentResult<()> {
        if step.step_type == StepType::ArgocdApps {
            return Ok(());
        }
        let prefix = format!("{}/{}", self.resources.param_root(), step.name);
        let names = self.resources.params.list_parameters(&prefix).await?;

        let mut collected: Vec<(String, ModuleOutputs)> = Vec::new();
        for name in names {
            let Some(tail) = name.strip_prefix(&format!("{prefix}/")) else {
                continue;
            };
            let Some((module, output)) = tail.split_once('/') else {
                continue;
            };
            // Credentials are never outputs, whatever subtree they sit in.
            if output == "http_username" || output == "http_password" {
                continue;
            }
            let raw = self.resources.params.get_parameter(&name).await?;
            let value = serde_json::from_str(&raw)
                .unwrap_or(serde_json::Value::String(raw));
            match collected.iter_mut().find(|(m, _)| m == module) {
                Some((_, outputs)) => {
                    outputs.insert(output.to_string(), value);
                }
                None => {
                    let mut outputs = ModuleOutputs::new();
                    outputs.insert(output.to_string(), value);
                    collected.push((module.to_string(), outputs));
                }
            }
        }

        let mut table = self.outputs.lock().await;
        for (module, outputs) in collected {
            // An encryption-key module's key becomes the store's key.
            if crate::provider::encryption_key_from_outputs(&outputs).is_some() {
                self.provider.add_encryption(&module, &outputs).await?;
            }
            table.insert_module(&step.name, &module, outputs);
        }
        Ok(())
    }

    /// Record the release into state and flush it before the next step
    /// begins.
    async fn persist_applied(&self, plan: &StepPlan, release: &Version) -> AgentResult<()> {
        let step = &self.config.steps[plan.step_index];
        let updates: Vec<(String, Version, Version)> = plan
            .modules
            .iter()
            .map(|planned| {
                let module = &step.modules[planned.module_index];
                (
                    module.name.clone(),
                    planned.render_version(release),
                    planned.target.clone(),
                )
            })
            .collect();
        let (name, workspace) = (step.name.clone(), step.workspace.clone());

        self.state
            .update(move |state| {
                let Some(state_step) = state.find_step_mut(&name, &workspace) else {
                    return;
                };
                state_step.applied_at = Some(Utc::now());
                for (module, applied, desired) in updates {
                    if let Some(state_module) = state_step.find_module_mut(&module) {
                        state_module.applied_version = Some(applied);
                        state_module.version = Some(desired);
                    }
                }
            })
            .await
    }

    /// Resolve every step against the sources and compute its release
    /// schedule for this run.
    async fn plan_steps(&self) -> AgentResult<Vec<StepPlan>> {
        let state = self.state.snapshot().await;
        let mut plans = Vec::new();

        for (step_index, step) in self.config.steps.iter().enumerate() {
            if step.remove {
                continue;
            }

            let state_step = state.find_step(&step.name, &step.workspace);
            let mut modules = Vec::new();
            let mut walk_client = None;
            let mut target: Option<Version> = None;
            let mut base: Option<Version> = None;
            let mut any_unapplied = false;

            for (module_index, module) in step.modules.iter().enumerate() {
                if module.remove {
                    continue;
                }
                let applied = state_step
                    .and_then(|s| s.find_module(&module.name))
                    .and_then(|m| m.applied_version.clone());

                if module.has_custom_source() {
                    // Resolved after the library modules settle the step
                    // target.
                    modules.push(PlannedModule {
                        module_index,
                        repo_url: String::new(),
                        target: Version::new(0, 0, 0),
                        applied,
                    });
                    continue;
                }

                let resolution = self.sources.resolve_module(step, module).await?;
                if target.as_ref().is_none_or(|t| resolution.target > *t) {
                    target = Some(resolution.target.clone());
                    walk_client = Some(resolution.client.clone());
                }
                match &applied {
                    Some(applied) => {
                        if base.as_ref().is_none_or(|b| applied < b) {
                            base = Some(applied.clone());
                        }
                    }
                    None => any_unapplied = true,
                }
                modules.push(PlannedModule {
                    module_index,
                    repo_url: resolution.repo_url,
                    target: resolution.target,
                    applied,
                });
            }

            let target = target.unwrap_or_else(|| Version::new(0, 0, 0));
            for planned in &mut modules {
                if planned.repo_url.is_empty() {
                    planned.target = target.clone();
                }
            }
            let base = if any_unapplied { None } else { base };

            let releases = match (&base, &walk_client) {
                (Some(base), Some(client)) => {
                    let walked = client.releases(Some(base), &target).await?;
                    if walked.is_empty() {
                        // Fully applied: one re-check pass so config drift
                        // still reconciles; the unchanged-files test keeps
                        // it from executing needlessly.
                        vec![target.clone()]
                    } else {
                        walked
                    }
                }
                _ => vec![target.clone()],
            };

            plans.push(StepPlan {
                step_index,
                releases,
                modules,
                base,
            });
        }
        Ok(plans)
    }

    /// Race a long-running wait against cancellation. In-flight pipelines
    /// keep running server-side; the loop just stops consuming them.
    async fn guard<T>(&self, fut: impl Future<Output = AgentResult<T>>) -> AgentResult<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(AgentError::Execution("run cancelled".into()))
            }
            result = fut => result,
        }
    }
}

fn zip_file_set(files: &FileSet) -> AgentResult<Vec<u8>> {
    use std::io::Write;

    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (path, content) in files {
            writer
                .start_file(path.as_str(), options)
                .map_err(|e| AgentError::Execution(format!("archiving {path}: {e}")))?;
            writer.write_all(content)?;
        }
        writer
            .finish()
            .map_err(|e| AgentError::Execution(format!("finishing archive: {e}")))?;
    }
    Ok(buffer.into_inner())
}
