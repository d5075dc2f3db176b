//! # Notifications
//!
//! Fan-out of lifecycle events to zero or more sinks. A sink that cannot be
//! reached never fails the run; the failure is logged and the remaining
//! sinks still receive the event.

pub mod api;
pub mod slack;
pub mod teams;

use crate::model::{MessageType, NotificationConfig, NotificationTarget};
use crate::provider::{Notifier, PlanSummary, StepStatus};
use std::sync::Arc;
use tracing::warn;

/// The registered sinks, built from the config's `notifications` list.
#[derive(Clone, Default)]
pub struct Notifications {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Notifications {
    pub fn from_config(configs: &[NotificationConfig]) -> Self {
        let sinks = configs
            .iter()
            .map(|config| -> Arc<dyn Notifier> {
                match &config.target {
                    NotificationTarget::Slack(target) => Arc::new(slack::SlackNotifier::new(
                        &config.name,
                        &target.webhook_url,
                        config.message_types.clone(),
                    )),
                    NotificationTarget::Teams(target) => Arc::new(teams::TeamsNotifier::new(
                        &config.name,
                        &target.webhook_url,
                        config.message_types.clone(),
                    )),
                    NotificationTarget::Api(target) => Arc::new(api::ApiNotifier::new(
                        &config.name,
                        &target.url,
                        target.token.as_deref(),
                        config.message_types.clone(),
                    )),
                }
            })
            .collect();
        Notifications { sinks }
    }

    /// Assemble from pre-built sinks; the config path above is the normal
    /// entry.
    pub fn with_sinks(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Notifications { sinks }
    }

    pub async fn message(&self, message_type: MessageType, message: &str) {
        for sink in self.handlers(message_type) {
            if let Err(e) = sink.message(message_type, message).await {
                warn!(sink = sink.name(), "notification failed: {e}");
            }
        }
    }

    pub async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) {
        for sink in self.handlers(MessageType::Approvals) {
            if let Err(e) = sink.manual_approval(step_name, summary, link).await {
                warn!(sink = sink.name(), "approval notification failed: {e}");
            }
        }
    }

    pub async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        workspace: &str,
        detail: Option<&str>,
    ) {
        let message_type = if status == StepStatus::Failed {
            MessageType::Failure
        } else {
            MessageType::Progress
        };
        for sink in self.handlers(message_type) {
            if let Err(e) = sink
                .step_state(status, step_name, workspace, detail)
                .await
            {
                warn!(sink = sink.name(), "step-state notification failed: {e}");
            }
        }
    }

    fn handlers(&self, message_type: MessageType) -> impl Iterator<Item = &Arc<dyn Notifier>> {
        self.sinks
            .iter()
            .filter(move |s| s.handles(message_type))
    }
}

/// Shared filter logic: an empty subscription list means every type.
pub(crate) fn handles_type(subscribed: &[MessageType], message_type: MessageType) -> bool {
    subscribed.is_empty() || subscribed.contains(&message_type)
}

/// One uniform text body for step-state events, shared by the sinks.
pub(crate) fn step_state_text(
    status: StepStatus,
    step_name: &str,
    workspace: &str,
    detail: Option<&str>,
) -> String {
    match detail {
        Some(detail) => format!("step {step_name} ({workspace}) {status}: {detail}"),
        None => format!("step {step_name} ({workspace}) {status}"),
    }
}

/// One uniform text body for manual-approval events.
pub(crate) fn manual_approval_text(
    step_name: &str,
    summary: &PlanSummary,
    link: Option<&str>,
) -> String {
    match link {
        Some(link) => format!(
            "step {step_name} needs manual approval: {summary}. Approve at {link}"
        ),
        None => format!("step {step_name} needs manual approval: {summary}"),
    }
}
