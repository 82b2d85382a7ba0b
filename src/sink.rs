use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::SinkConfig;

/// Body posted to the key storage function.
#[derive(Debug, Serialize)]
pub struct KeyUpload {
    pub file_data: Value,
    pub file_name: String,
    pub bucket_name: String,
}

/// Destination for the issued key. Errors mean the key was not delivered.
#[async_trait]
pub trait KeySink: Send + Sync {
    async fn persist(&self, file_name: &str, key: Value) -> anyhow::Result<()>;
}

/// Posts the key to an HTTP function that writes it to a storage bucket.
pub struct HttpKeySink {
    config: SinkConfig,
}

impl HttpKeySink {
    pub fn new(config: SinkConfig) -> Self {
        Self { config }
    }

    pub fn upload(&self, file_name: &str, key: Value) -> KeyUpload {
        KeyUpload {
            file_data: key,
            file_name: file_name.to_string(),
            bucket_name: self.config.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl KeySink for HttpKeySink {
    async fn persist(&self, file_name: &str, key: Value) -> anyhow::Result<()> {
        let upload = self.upload(file_name, key);
        let endpoint = self.config.endpoint.clone();
        info!(bucket = %upload.bucket_name, file = %upload.file_name, "Uploading service account key...");
        tokio::task::spawn_blocking(move || post_upload(&endpoint, &upload))
            .await
            .map_err(|err| anyhow!("key upload task failed: {err}"))?
    }
}

fn post_upload(endpoint: &str, upload: &KeyUpload) -> anyhow::Result<()> {
    match ureq::post(endpoint)
        .header("Content-Type", "application/json")
        .send_json(upload)
    {
        Ok(mut resp) => {
            let status = resp.status().as_u16();
            let raw_body = resp.body_mut().read_to_string().unwrap_or_default();
            debug!(status, body = %raw_body, "key upload response");
            Ok(())
        }
        Err(ureq::Error::StatusCode(status)) => {
            Err(anyhow!("key upload to {endpoint} returned HTTP {status}"))
        }
        Err(err) => Err(err).with_context(|| format!("key upload to {endpoint}")),
    }
}
