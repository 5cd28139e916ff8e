//! Reasoning service client. Output is treated strictly as untrusted input:
//! callers parse it into fixed schemas and recompute every score themselves.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{with_retries, ClientError};

/// Generated text plus the knowledge-base citations the service used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

#[async_trait]
pub trait Reasoning: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Generation, ClientError>;
}

/// HTTP implementation against a completion endpoint.
pub struct HttpReasoningClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpReasoningClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    prompt: &'a str,
}

#[async_trait]
impl Reasoning for HttpReasoningClient {
    async fn complete(&self, prompt: &str) -> Result<Generation, ClientError> {
        let url = format!("{}/completions", self.base_url);
        with_retries("reasoning.complete", 3, || async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&CompletionBody { prompt })
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(ClientError::Status(resp.status().as_u16()));
            }
            resp.json::<Generation>()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))
        })
        .await
    }
}
