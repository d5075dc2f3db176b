//! SSM Parameter Store adapter. Secrets are SecureString parameters; once
//! an encryption-key module has applied, writes switch to its
//! customer-managed key.

use super::classify_sdk;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use crate::provider::ParamStore;
use async_trait::async_trait;
use aws_sdk_ssm::types::ParameterType;
use std::sync::Mutex;
use tracing::info;

pub struct SsmParams {
    client: aws_sdk_ssm::Client,
    encryption_key_id: Mutex<Option<String>>,
}

impl SsmParams {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        SsmParams {
            client: aws_sdk_ssm::Client::new(sdk_config),
            encryption_key_id: Mutex::new(None),
        }
    }

    fn key_id(&self) -> Option<String> {
        self.encryption_key_id.lock().unwrap().clone()
    }

    async fn put(&self, name: &str, value: &str, parameter_type: ParameterType) -> AgentResult<()> {
        let key_id = if parameter_type == ParameterType::SecureString {
            self.key_id()
        } else {
            None
        };
        retry_default(|| {
            let key_id = key_id.clone();
            let parameter_type = parameter_type.clone();
            async {
                self.client
                    .put_parameter()
                    .name(name)
                    .value(value)
                    .r#type(parameter_type)
                    .overwrite(true)
                    .set_key_id(key_id)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk(&format!("writing parameter {name}"), e))
            }
        })
        .await
    }

    async fn delete(&self, name: &str) -> AgentResult<()> {
        retry_default(|| async {
            self.client
                .delete_parameter()
                .name(name)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("deleting parameter {name}"), e))
        })
        .await
    }
}

#[async_trait]
impl ParamStore for SsmParams {
    async fn get_parameter(&self, name: &str) -> AgentResult<String> {
        let output = retry_default(|| async {
            self.client
                .get_parameter()
                .name(name)
                .with_decryption(true)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("reading parameter {name}"), e))
        })
        .await?;
        output
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| AgentError::NotFound(format!("parameter {name}")))
    }

    async fn parameter_exists(&self, name: &str) -> AgentResult<bool> {
        match self.get_parameter(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put_parameter(&self, name: &str, value: &str) -> AgentResult<()> {
        self.put(name, value, ParameterType::String).await
    }

    async fn list_parameters(&self, prefix: &str) -> AgentResult<Vec<String>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry_default(|| {
                let token = token.clone();
                async {
                    self.client
                        .get_parameters_by_path()
                        .path(prefix)
                        .recursive(true)
                        .set_next_token(token)
                        .send()
                        .await
                        .map_err(|e| classify_sdk(&format!("listing parameters under {prefix}"), e))
                }
            })
            .await?;
            for parameter in page.parameters() {
                if let Some(name) = parameter.name() {
                    names.push(name.to_string());
                }
            }
            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_parameter(&self, name: &str) -> AgentResult<()> {
        self.delete(name).await
    }

    async fn put_secret(&self, name: &str, value: &str) -> AgentResult<()> {
        self.put(name, value, ParameterType::SecureString).await
    }

    async fn delete_secret(&self, name: &str) -> AgentResult<()> {
        self.delete(name).await
    }

    async fn add_encryption_key_id(&self, key_id: &str) -> AgentResult<()> {
        info!(key_id, "secure parameters now use the customer-managed key");
        *self.encryption_key_id.lock().unwrap() = Some(key_id.to_string());
        Ok(())
    }
}
