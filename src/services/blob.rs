use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;

use crate::core::config::BlobConfig;

/// Object storage for persona assets. Takes bytes, returns a stable
/// public URL.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    async fn upload(&self, data: &[u8], key: &str, mime_type: &str) -> Result<String>;
}

#[derive(Debug)]
pub struct HttpBlobStore {
    base_url: String,
    bucket: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(config: &BlobConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, data: &[u8], key: &str, mime_type: &str) -> Result<String> {
        let url = format!("{}/{}/{}", self.base_url, self.bucket, key);

        let resp = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(data.to_vec())
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Blob upload failed: {}", error_text));
        }

        let result: UploadResponse = resp
            .json()
            .await
            .context("Blob store returned an unexpected upload response")?;
        Ok(result.url)
    }
}

fn extension_for(mime_type: &str) -> &str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Key layout: `personas/<id>/<kind>-<timestamp>.<ext>`.
pub fn object_key(persona_id: &str, kind: &str, timestamp: u64, mime_type: &str) -> String {
    format!(
        "personas/{}/{}-{}.{}",
        persona_id,
        kind,
        timestamp,
        extension_for(mime_type)
    )
}
