//! HTTP calls to the agent configuration API
//!
//! Plain request/response, no retries.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// One knowledge-base document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub content: String,
}

impl Document {
    /// Read a text file, named after its file name.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, content })
    }
}

#[derive(Debug, Deserialize)]
struct RecommendationsResponse {
    recommendations: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentTypeRequest<'a> {
    session_id: &'a str,
    agent_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsRequest<'a> {
    session_id: &'a str,
    documents: &'a [Document],
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("voxlink")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Recommended knowledge-base document categories for an agent type
    pub async fn agent_recommendations(&self, agent_type: Option<&str>) -> Result<String> {
        let body: RecommendationsResponse = self
            .post("/agent-recommendations", &json!({ "agentType": agent_type }))
            .await?;
        Ok(body.recommendations)
    }

    pub async fn update_agent_type(&self, session_id: &str, agent_type: &str) -> Result<Value> {
        info!("Setting agent type for session {}", session_id);
        self.post("/agent-type", &AgentTypeRequest { session_id, agent_type })
            .await
    }

    pub async fn upload_documents(
        &self,
        session_id: &str,
        documents: &[Document],
    ) -> Result<Value> {
        info!("Uploading {} document(s) for session {}", documents.len(), session_id);
        self.post("/documents", &DocumentsRequest { session_id, documents })
            .await
    }

    pub async fn session(&self, session_id: &str) -> Result<Value> {
        let url = format!("{}/session/{}", self.base_url, session_id);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        Self::read(response).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self.client.post(&url).json(body).send().await?;
        Self::read(response).await
    }

    async fn read<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VoiceError::Protocol(format!("HTTP {}: {}", status, text)));
        }
        Ok(response.json().await?)
    }
}
