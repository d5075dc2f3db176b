//! Slack incoming-webhook sink.

use super::{handles_type, manual_approval_text, step_state_text};
use crate::errors::{AgentError, AgentResult};
use crate::model::MessageType;
use crate::provider::{Notifier, PlanSummary, StepStatus};
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    name: String,
    webhook_url: String,
    message_types: Vec<MessageType>,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(name: &str, webhook_url: &str, message_types: Vec<MessageType>) -> Self {
        SlackNotifier {
            name: name.to_string(),
            webhook_url: webhook_url.to_string(),
            message_types,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, text: &str) -> AgentResult<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| AgentError::Transient(format!("slack webhook: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Transient(format!(
                "slack webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, message_type: MessageType) -> bool {
        handles_type(&self.message_types, message_type)
    }

    async fn message(&self, _message_type: MessageType, message: &str) -> AgentResult<()> {
        self.post(message).await
    }

    async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) -> AgentResult<()> {
        self.post(&manual_approval_text(step_name, summary, link))
            .await
    }

    async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        workspace: &str,
        detail: Option<&str>,
    ) -> AgentResult<()> {
        self.post(&step_state_text(status, step_name, workspace, detail))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_text_payloads_to_the_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({ "text": "step net (dev) applied" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = SlackNotifier::new("ops", &format!("{}/hook", server.uri()), vec![]);
        sink.step_state(StepStatus::Applied, "net", "dev", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_failures_surface_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = SlackNotifier::new("ops", &server.uri(), vec![]);
        let err = sink
            .message(MessageType::Progress, "hello")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
