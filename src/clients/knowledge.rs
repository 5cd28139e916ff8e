//! Knowledge base client -- semantic lookup of runbooks and past incidents.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{with_retries, ClientError};

/// One retrieved snippet with its relevance ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Relevance in [0,1] as ranked by the retrieval backend.
    pub relevance: f64,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Top-k snippets for a query, most relevant first.
    async fn search(&self, query: &str, top_k: usize)
        -> Result<Vec<KnowledgeSnippet>, ClientError>;

    /// Append a resolution record so future diagnoses can retrieve it.
    async fn record(&self, entry: &str) -> Result<(), ClientError>;
}

/// HTTP implementation against a retrieval service.
pub struct HttpKnowledgeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKnowledgeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct SearchBody<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    snippets: Vec<KnowledgeSnippet>,
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeClient {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<KnowledgeSnippet>, ClientError> {
        let url = format!("{}/search", self.base_url);
        let body: SearchResponse = with_retries("kb.search", 3, || async {
            let resp = self
                .client
                .post(&url)
                .json(&SearchBody { query, top_k })
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(ClientError::Status(resp.status().as_u16()));
            }
            resp.json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))
        })
        .await?;
        Ok(body.snippets)
    }

    async fn record(&self, entry: &str) -> Result<(), ClientError> {
        let url = format!("{}/documents", self.base_url);
        with_retries("kb.record", 3, || async {
            let resp = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "content": entry }))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(ClientError::Status(resp.status().as_u16()));
            }
            Ok(())
        })
        .await
    }
}
