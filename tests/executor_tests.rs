//! End-to-end scenarios for the update loop and the destroyer, driven
//! against in-memory backends and a scripted pipeline.

mod common;

use common::{harness, FakeSource};
use infra_agent::provider::{Bucket as _, PlanSummary, StepStatus};
use semver::Version;

fn source() -> FakeSource {
    FakeSource::new(
        "https://git.example/org/modules",
        &["1.0.0", "1.1.0", "1.2.0"],
        &["aws/vpc", "aws/eks", "aws/kms"],
    )
}

#[tokio::test]
async fn fresh_install_applies_the_target_release() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.executor.run().await.unwrap();

    // One execution, auto-approved, applied.
    assert_eq!(h.pipeline.events_of_kind("start"), vec!["t1-net-dev"]);
    assert_eq!(h.pipeline.events_of_kind("approve"), vec!["t1-net-dev"]);
    assert_eq!(h.pipeline.events_of_kind("apply"), vec!["t1-net-dev"]);

    // The artifact set was materialized under the step folder.
    let files = h.bucket.files.lock().unwrap();
    let main_tf = String::from_utf8(files["steps/t1-net-dev/main.tf"].clone()).unwrap();
    assert!(main_tf.contains("?ref=1.2.0"));
    assert!(files.contains_key("steps/t1-net-dev/provider.tf"));
    assert!(files.contains_key("steps/t1-net-dev/backend.conf"));
    drop(files);

    // State records the applied release.
    let state = h.state.snapshot().await;
    let module = state.find_step("net", "dev").unwrap().find_module("vpc").unwrap();
    assert_eq!(module.applied_version, Some(Version::new(1, 2, 0)));
    assert!(state.find_step("net", "dev").unwrap().applied_at.is_some());
}

#[tokio::test]
async fn release_walk_never_skips_intermediate_tags() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.state
        .update(|state| {
            state.steps.push(infra_agent::model::StateStep {
                name: "net".into(),
                workspace: "dev".into(),
                applied_at: None,
                modules: vec![infra_agent::model::StateModule {
                    name: "vpc".into(),
                    version: Some(Version::new(1, 0, 0)),
                    applied_version: Some(Version::new(1, 0, 0)),
                }],
            });
        })
        .await
        .unwrap();

    h.executor.run().await.unwrap();

    // 1.0.0 -> 1.1.0 -> 1.2.0: two executions, ascending.
    assert_eq!(
        h.pipeline.events_of_kind("start"),
        vec!["t1-net-dev", "t1-net-dev"]
    );
    let state = h.state.snapshot().await;
    let module = state.find_step("net", "dev").unwrap().find_module("vpc").unwrap();
    assert_eq!(module.applied_version, Some(Version::new(1, 2, 0)));
}

#[tokio::test]
async fn a_stale_module_never_drags_an_ahead_module_back() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
      - { name: eks, source: aws/eks }
"#;
    let h = harness(config, source()).await;
    // vpc lags at 1.0.0 while eks already applied the 1.2.0 target.
    h.state
        .update(|state| {
            state.steps.push(infra_agent::model::StateStep {
                name: "net".into(),
                workspace: "dev".into(),
                applied_at: None,
                modules: vec![
                    infra_agent::model::StateModule {
                        name: "vpc".into(),
                        version: Some(Version::new(1, 0, 0)),
                        applied_version: Some(Version::new(1, 0, 0)),
                    },
                    infra_agent::model::StateModule {
                        name: "eks".into(),
                        version: Some(Version::new(1, 2, 0)),
                        applied_version: Some(Version::new(1, 2, 0)),
                    },
                ],
            });
        })
        .await
        .unwrap();

    h.executor.run().await.unwrap();

    // The walk visits 1.1.0 for vpc, but eks stays pinned at its applied
    // version in every rendered main.tf; no release ever downgrades it.
    let snapshots = h.pipeline.plan_snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0].1.contains("aws/vpc?ref=1.1.0"));
    assert!(snapshots[0].1.contains("aws/eks?ref=1.2.0"));
    assert!(snapshots[1].1.contains("aws/vpc?ref=1.2.0"));
    assert!(snapshots[1].1.contains("aws/eks?ref=1.2.0"));
    drop(snapshots);

    let state = h.state.snapshot().await;
    let step = state.find_step("net", "dev").unwrap();
    assert_eq!(
        step.find_module("vpc").unwrap().applied_version,
        Some(Version::new(1, 2, 0))
    );
    assert_eq!(
        step.find_module("eks").unwrap().applied_version,
        Some(Version::new(1, 2, 0))
    );
}

#[tokio::test]
async fn module_credentials_stay_out_of_the_output_namespace() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc, httpPassword: hunter2 }
  - name: infra
    type: terraform
    workspace: dev
    modules:
      - name: eks
        source: aws/eks
        inputs:
          sneaky: "{{ .toutput.vpc.http_password }}"
"#;
    let h = harness(config, source()).await;
    let err = h.executor.run().await.unwrap_err();

    // The credential landed in the secrets subtree, not the output one.
    let params = h.params.values.lock().unwrap();
    assert_eq!(
        params.get("/infra-agent-t1/secrets/net/vpc/http_password"),
        Some(&"hunter2".to_string())
    );
    assert!(params
        .keys()
        .all(|k| !k.starts_with("/infra-agent-t1/net/")));
    drop(params);

    // The reference cannot resolve, so the consuming step fails instead of
    // receiving the secret.
    assert!(err.to_string().contains("http_password"));
    assert!(!h
        .pipeline
        .events_of_kind("start")
        .contains(&"t1-infra-dev".to_string()));
}

#[tokio::test]
async fn second_run_with_no_changes_starts_no_pipelines() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.executor.run().await.unwrap();
    assert_eq!(h.pipeline.events_of_kind("start").len(), 1);

    h.executor.run().await.unwrap();
    assert_eq!(h.pipeline.events_of_kind("start").len(), 1);
}

#[tokio::test]
async fn approve_never_refuses_plans_with_destroys() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    approve: never
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.pipeline.queue_summary(
        "t1-net-dev",
        PlanSummary {
            added: 5,
            changed: 0,
            destroyed: 2,
            imported: 0,
        },
    );

    let err = h.executor.run().await.unwrap_err();
    assert!(err.to_string().contains("approve=never"));

    // The step never applied and state kept no applied version.
    assert!(h.pipeline.events_of_kind("apply").is_empty());
    let state = h.state.snapshot().await;
    let module = state.find_step("net", "dev").unwrap().find_module("vpc").unwrap();
    assert_eq!(module.applied_version, None);

    // The failure reached the sinks.
    assert!(h
        .sink
        .step_states
        .lock()
        .unwrap()
        .iter()
        .any(|(status, step)| *status == StepStatus::Failed && step == "net"));
}

#[tokio::test]
async fn destroys_under_minor_policy_wait_for_a_human() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    approve: minor
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.pipeline.queue_summary(
        "t1-net-dev",
        PlanSummary {
            added: 5,
            changed: 0,
            destroyed: 2,
            imported: 0,
        },
    );
    *h.pipeline.manual_approval_answer.lock().unwrap() = true;

    h.executor.run().await.unwrap();

    // The approvals notification carried the counts and the console link.
    let approvals = h.sink.approvals.lock().unwrap();
    assert_eq!(approvals.len(), 1);
    let (step, summary, link) = &approvals[0];
    assert_eq!(step, "net");
    assert_eq!(summary.destroyed, 2);
    assert!(link.as_deref().unwrap().contains("console"));
    drop(approvals);

    // Manual gate, then apply; no programmatic approval.
    assert_eq!(h.pipeline.events_of_kind("manual-approval").len(), 1);
    assert!(h.pipeline.events_of_kind("approve").is_empty());
    assert_eq!(h.pipeline.events_of_kind("apply").len(), 1);
}

#[tokio::test]
async fn manual_approval_timeout_fails_the_run() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    approve: always
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    *h.pipeline.manual_approval_answer.lock().unwrap() = false;

    let err = h.executor.run().await.unwrap_err();
    assert!(err.to_string().contains("timed out or was rejected"));
    assert!(h.pipeline.events_of_kind("apply").is_empty());
}

#[tokio::test]
async fn outputs_flow_to_later_steps_in_dependency_order() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: infra
    type: terraform
    workspace: dev
    modules:
      - name: eks
        source: aws/eks
        inputs:
          vpc_id: "{{ .toutput.vpc.vpc_id }}"
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    // The apply job publishes outputs into the parameter store; simulate
    // the copy the net step's job would write.
    h.params.values.lock().unwrap().insert(
        "/infra-agent-t1/net/vpc/vpc_id".to_string(),
        "vpc-0a1b2c".to_string(),
    );

    h.executor.run().await.unwrap();

    // net must run before infra despite appearing later in the config.
    assert_eq!(
        h.pipeline.events_of_kind("start"),
        vec!["t1-net-dev", "t1-infra-dev"]
    );

    let files = h.bucket.files.lock().unwrap();
    let main_tf = String::from_utf8(files["steps/t1-infra-dev/main.tf"].clone()).unwrap();
    assert!(main_tf.contains("vpc_id = \"vpc-0a1b2c\""));
}

#[tokio::test]
async fn encryption_key_outputs_reach_the_provider() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: sec
    type: terraform
    workspace: dev
    modules:
      - { name: kms, source: aws/kms }
"#;
    let h = harness(config, source()).await;
    h.params.values.lock().unwrap().insert(
        "/infra-agent-t1/sec/kms/key_arn".to_string(),
        "arn:aws:kms:eu-west-1:1:key/abc".to_string(),
    );

    h.executor.run().await.unwrap();
    assert_eq!(*h.provider.encrypted_modules.lock().unwrap(), vec!["kms"]);
}

#[tokio::test]
async fn schedule_is_reconciled_on_every_run() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
schedule:
  updateCron: "0 3 * * *"
steps: []
"#;
    let h = harness(config, source()).await;
    h.executor.run().await.unwrap();
    assert_eq!(
        *h.provider.schedules.lock().unwrap(),
        vec![Some("0 3 * * *".to_string())]
    );
}

#[tokio::test]
async fn delete_destroys_in_reverse_order_then_deletes_resources() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: a
    type: terraform
    workspace: dev
    modules: [{ name: vpc, source: aws/vpc }]
  - name: b
    type: terraform
    workspace: dev
    modules: [{ name: eks, source: aws/eks }]
  - name: c
    type: terraform
    workspace: dev
    modules: [{ name: kms, source: aws/kms }]
"#;
    let h = harness(config, source()).await;
    h.executor.run().await.unwrap();

    h.executor.destroy(false, false).await.unwrap();

    assert_eq!(
        h.pipeline.events_of_kind("destroy"),
        vec!["t1-c-dev", "t1-b-dev", "t1-a-dev"]
    );
    assert_eq!(*h.provider.deleted.lock().unwrap(), Some((false, false)));
    // Without --delete-bucket the bucket survives.
    assert!(h.bucket.bucket_exists().await.unwrap());
    // Destroyed steps left the state document.
    assert!(h.state.snapshot().await.steps.is_empty());
}

#[tokio::test]
async fn hard_delete_also_removes_the_bucket() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: a
    type: terraform
    workspace: dev
    modules: [{ name: vpc, source: aws/vpc }]
"#;
    let h = harness(config, source()).await;
    h.executor.run().await.unwrap();
    h.executor.destroy(true, true).await.unwrap();

    assert_eq!(*h.provider.deleted.lock().unwrap(), Some((true, true)));
    assert!(!h.bucket.bucket_exists().await.unwrap());
}

#[tokio::test]
async fn removed_steps_are_destroyed_then_elided() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: old
    type: terraform
    workspace: dev
    remove: true
    modules: [{ name: vpc, source: aws/vpc }]
  - name: net
    type: terraform
    workspace: dev
    modules: [{ name: eks, source: aws/eks }]
"#;
    let h = harness(config, source()).await;
    // The removed step was applied by an earlier run: state entry plus an
    // artifact set in the bucket.
    h.state
        .update(|state| {
            state.steps.push(infra_agent::model::StateStep {
                name: "old".into(),
                workspace: "dev".into(),
                applied_at: None,
                modules: vec![infra_agent::model::StateModule {
                    name: "vpc".into(),
                    version: Some(Version::new(1, 2, 0)),
                    applied_version: Some(Version::new(1, 2, 0)),
                }],
            });
        })
        .await
        .unwrap();
    h.bucket
        .put_file("steps/t1-old-dev/main.tf", b"module \"vpc\" {}")
        .await
        .unwrap();

    h.executor.run().await.unwrap();

    assert_eq!(h.pipeline.events_of_kind("destroy"), vec!["t1-old-dev"]);
    let state = h.state.snapshot().await;
    assert!(state.find_step("old", "dev").is_none());
    assert!(state.find_step("net", "dev").is_some());
    // The removed step's artifacts are gone.
    assert!(!h
        .bucket
        .check_folder_exists("steps/t1-old-dev")
        .await
        .unwrap());
}

#[tokio::test]
async fn missing_module_path_names_step_and_module() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: ghost, source: aws/ghost }
"#;
    let h = harness(config, source()).await;
    let err = h.executor.run().await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("ghost"));
    assert!(text.contains("net"));
    assert!(h.pipeline.events_of_kind("start").is_empty());
}

#[tokio::test]
async fn pull_generates_files_without_executing() {
    let config = r#"
prefix: t1
sources:
  - url: https://git.example/org/modules
version: 1.2.0
steps:
  - name: net
    type: terraform
    workspace: dev
    modules:
      - { name: vpc, source: aws/vpc }
"#;
    let h = harness(config, source()).await;
    h.executor.pull().await.unwrap();

    assert!(h.pipeline.events_of_kind("start").is_empty());
    let files = h.bucket.files.lock().unwrap();
    assert!(files.contains_key("steps/t1-net-dev/main.tf"));
}
