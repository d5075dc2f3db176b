//! Generic JSON webhook sink with optional bearer auth, for in-house
//! receivers.

use super::handles_type;
use crate::errors::{AgentError, AgentResult};
use crate::model::MessageType;
use crate::provider::{Notifier, PlanSummary, StepStatus};
use async_trait::async_trait;
use serde_json::json;

pub struct ApiNotifier {
    name: String,
    url: String,
    token: Option<String>,
    message_types: Vec<MessageType>,
    client: reqwest::Client,
}

impl ApiNotifier {
    pub fn new(
        name: &str,
        url: &str,
        token: Option<&str>,
        message_types: Vec<MessageType>,
    ) -> Self {
        ApiNotifier {
            name: name.to_string(),
            url: url.to_string(),
            token: token.map(str::to_string),
            message_types,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, payload: serde_json::Value) -> AgentResult<()> {
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transient(format!("api webhook: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Transient(format!(
                "api webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for ApiNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, message_type: MessageType) -> bool {
        handles_type(&self.message_types, message_type)
    }

    async fn message(&self, message_type: MessageType, message: &str) -> AgentResult<()> {
        self.post(json!({
            "event": "message",
            "type": message_type,
            "message": message,
        }))
        .await
    }

    async fn manual_approval(
        &self,
        step_name: &str,
        summary: &PlanSummary,
        link: Option<&str>,
    ) -> AgentResult<()> {
        self.post(json!({
            "event": "manual-approval",
            "step": step_name,
            "changes": {
                "added": summary.added,
                "changed": summary.changed,
                "destroyed": summary.destroyed,
                "imported": summary.imported,
            },
            "link": link,
        }))
        .await
    }

    async fn step_state(
        &self,
        status: StepStatus,
        step_name: &str,
        workspace: &str,
        detail: Option<&str>,
    ) -> AgentResult<()> {
        self.post(json!({
            "event": "step-state",
            "status": status.to_string(),
            "step": step_name,
            "workspace": workspace,
            "detail": detail,
        }))
        .await
    }
}
