//! Cloud resource client -- list/describe the monitored fleet.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{with_retries, ClientError};
use crate::model::ResourceKind;

/// A resource as seen by the cloud provider.
#[derive(Debug, Clone)]
pub struct CloudResource {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub region: Option<String>,
    /// Provider size slug, e.g. "s-1vcpu-1gb".
    pub size_slug: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait CloudResources: Send + Sync {
    /// All resources the orchestrator should watch.
    async fn list_resources(&self) -> Result<Vec<CloudResource>, ClientError>;

    async fn get_resource(&self, id: &str) -> Result<CloudResource, ClientError>;
}

/// HTTP implementation against a DigitalOcean-style REST API.
pub struct HttpCloudClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Only resources carrying this tag are monitored.
    tag: String,
}

impl HttpCloudClient {
    pub fn new(base_url: &str, token: &str, tag: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            tag: tag.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DropletPage {
    droplets: Vec<DropletInfo>,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: DropletInfo,
}

#[derive(Debug, Deserialize)]
struct DropletInfo {
    id: serde_json::Value,
    name: String,
    status: String,
    #[serde(default)]
    region: Option<RegionInfo>,
    #[serde(default)]
    size_slug: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegionInfo {
    slug: String,
}

impl DropletInfo {
    fn into_resource(self) -> CloudResource {
        CloudResource {
            id: match self.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            },
            name: self.name,
            kind: ResourceKind::Droplet,
            region: self.region.map(|r| r.slug),
            size_slug: self.size_slug,
            status: self.status,
            tags: self.tags,
        }
    }
}

#[async_trait]
impl CloudResources for HttpCloudClient {
    async fn list_resources(&self) -> Result<Vec<CloudResource>, ClientError> {
        let url = format!("{}/v2/droplets?tag_name={}", self.base_url, self.tag);
        let page: DropletPage = with_retries("cloud.list_resources", 3, || async {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
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

        Ok(page
            .droplets
            .into_iter()
            .map(DropletInfo::into_resource)
            .collect())
    }

    async fn get_resource(&self, id: &str) -> Result<CloudResource, ClientError> {
        let url = format!("{}/v2/droplets/{}", self.base_url, id);
        let envelope: DropletEnvelope = with_retries("cloud.get_resource", 3, || async {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
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

        Ok(envelope.droplet.into_resource())
    }
}
