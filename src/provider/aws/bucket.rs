//! S3-backed bucket.

use super::classify_sdk;
use crate::errors::{AgentError, AgentResult};
use crate::provider::retry::retry_default;
use crate::provider::Bucket;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use tracing::info;

pub struct S3Bucket {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
}

impl S3Bucket {
    pub fn new(sdk_config: &aws_config::SdkConfig, bucket: &str, region: &str) -> Self {
        S3Bucket {
            client: aws_sdk_s3::Client::new(sdk_config),
            bucket: bucket.to_string(),
            region: region.to_string(),
        }
    }

    /// Create the bucket when missing; an existing bucket owned by us is
    /// fine.
    pub async fn ensure_exists(&self) -> AgentResult<()> {
        if self.bucket_exists().await? {
            return Ok(());
        }
        info!(bucket = %self.bucket, "creating state bucket");
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        let result = retry_default(|| async {
            request
                .clone()
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk("creating bucket", e))
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    async fn put_file(&self, key: &str, content: &[u8]) -> AgentResult<()> {
        retry_default(|| async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(content.to_vec()))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("writing {key}"), e))
        })
        .await
    }

    async fn get_file(&self, key: &str) -> AgentResult<Option<Vec<u8>>> {
        let result = retry_default(|| async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify_sdk(&format!("reading {key}"), e))
        })
        .await;
        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AgentError::Transient(format!("reading body of {key}: {e}")))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_file(&self, key: &str) -> AgentResult<()> {
        retry_default(|| async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk(&format!("deleting {key}"), e))
        })
        .await
    }

    async fn list_folder_files(&self, prefix: &str) -> AgentResult<Vec<String>> {
        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.clone();
            let page = retry_default(|| {
                let token = token.clone();
                async {
                    self.client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(&prefix)
                        .set_continuation_token(token)
                        .send()
                        .await
                        .map_err(|e| classify_sdk(&format!("listing {prefix}"), e))
                }
            })
            .await?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn check_folder_exists(&self, prefix: &str) -> AgentResult<bool> {
        Ok(!self.list_folder_files(prefix).await?.is_empty())
    }

    async fn bucket_exists(&self) -> AgentResult<bool> {
        let result = retry_default(|| async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk("checking bucket", e))
        })
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self) -> AgentResult<()> {
        // S3 refuses to delete a non-empty bucket.
        for key in self.list_folder_files("").await? {
            self.delete_file(&key).await?;
        }
        let result = retry_default(|| async {
            self.client
                .delete_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk("deleting bucket", e))
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
