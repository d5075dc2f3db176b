//! Microsoft Teams webhook sink, posting MessageCard payloads.

use super::{handles_type, manual_approval_text, step_state_text};
use crate::errors::{AgentError, AgentResult};
use crate::model::MessageType;
use crate::provider::{Notifier, PlanSummary, StepStatus};
use async_trait::async_trait;
use serde_json::json;

pub struct TeamsNotifier {
    name: String,
    webhook_url: String,
    message_types: Vec<MessageType>,
    client: reqwest::Client,
}

impl TeamsNotifier {
    pub fn new(name: &str, webhook_url: &str, message_types: Vec<MessageType>) -> Self {
        TeamsNotifier {
            name: name.to_string(),
            webhook_url: webhook_url.to_string(),
            message_types,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, title: &str, text: &str) -> AgentResult<()> {
        let card = json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "summary": title,
            "title": title,
            "text": text,
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&card)
            .send()
            .await
            .map_err(|e| AgentError::Transient(format!("teams webhook: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Transient(format!(
                "teams webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TeamsNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, message_type: MessageType) -> bool {
        handles_type(&self.message_types, message_type)
    }

    async fn message(&self, message_type: MessageType, message: &str) -> AgentResult<()> {
        let title = match message_type {
            MessageType::Approvals => "Approval needed",
            MessageType::Progress => "Infra agent",
            MessageType::Failure => "Infra agent failure",
        };
        self.post(title, message).await
    }

    async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) -> AgentResult<()> {
        self.post(
            "Approval needed",
            &manual_approval_text(step_name, summary, link),
        )
        .await
    }

    async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        workspace: &str,
        detail: Option<&str>,
    ) -> AgentResult<()> {
        let title = if status == StepStatus::Failed {
            "Infra agent failure"
        } else {
            "Infra agent"
        };
        self.post(title, &step_state_text(status, step_name, workspace, detail))
            .await
    }
}
