//! Client for the external question-answering webhook.

use crate::config::AssistantConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
pub enum AssistantError {
    EmptyQuery,
    Config(String),
    Transport(String),
    NotJson(String),
    MissingReply,
}

impl fmt::Display for AssistantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssistantError::EmptyQuery => write!(f, "empty query"),
            AssistantError::Config(msg) => write!(f, "assistant endpoint not configured: {}", msg),
            AssistantError::Transport(msg) => write!(f, "assistant request failed: {}", msg),
            AssistantError::NotJson(body) => write!(f, "assistant returned a non-JSON body: {}", body),
            AssistantError::MissingReply => write!(f, "assistant response has no reply"),
        }
    }
}

impl std::error::Error for AssistantError {}

impl AssistantError {
    /// Text to show the person who asked.
    pub fn user_message(&self) -> &'static str {
        match self {
            AssistantError::EmptyQuery => "Por favor escribe una pregunta.",
            AssistantError::Config(_) => "El asistente no está configurado.",
            AssistantError::Transport(_) => "Error al conectar con el asistente.",
            AssistantError::NotJson(_) => "Error: el servidor devolvió una respuesta no válida.",
            AssistantError::MissingReply => "No se obtuvo respuesta del asistente.",
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndpointFile {
    ai_endpoint: String,
}

#[derive(Serialize)]
struct AskRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct AskResponse {
    reply: Option<String>,
}

pub struct Assistant {
    endpoint: String,
    client: reqwest::Client,
}

impl Assistant {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssistantError::Config(e.to_string()))?;
        Ok(Self { endpoint: endpoint.into(), client })
    }

    /// Read the endpoint from `{"ai_endpoint": "<url>"}`.
    pub fn from_endpoint_file(path: &Path, timeout: Duration) -> Result<Self, AssistantError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AssistantError::Config(format!("{:?}: {}", path, e)))?;
        let file: EndpointFile = serde_json::from_str(&content)
            .map_err(|e| AssistantError::Config(format!("{:?}: {}", path, e)))?;
        if file.ai_endpoint.trim().is_empty() {
            return Err(AssistantError::Config(format!("{:?}: empty ai_endpoint", path)));
        }
        Self::new(file.ai_endpoint.trim(), timeout)
    }

    pub fn from_config(config: &AssistantConfig) -> Result<Self, AssistantError> {
        Self::from_endpoint_file(&config.endpoint_file, Duration::from_secs(config.timeout_secs.max(1)))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn ask(&self, query: &str) -> Result<String, AssistantError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AssistantError::EmptyQuery);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&AskRequest { query })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "assistant request failed");
                AssistantError::Transport(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AssistantError::Transport(e.to_string()))?;

        let parsed: AskResponse = serde_json::from_str(&body).map_err(|_| {
            warn!(%status, "assistant returned a non-JSON body");
            AssistantError::NotJson(body.chars().take(200).collect())
        })?;

        let reply = parsed
            .reply
            .filter(|r| !r.trim().is_empty())
            .ok_or(AssistantError::MissingReply)?;
        info!(chars = reply.len(), "assistant replied");
        Ok(reply)
    }
}
