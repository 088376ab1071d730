//! AI generation collaborator: submit-then-poll media generation.
//!
//! Used when a pool template asks for a generated background instead of a
//! library pick, and available for generated audio. Quota exhaustion is a
//! distinct, surfaced condition: operators act on it differently than on a
//! generic provider failure.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Background,
    Audio,
}

#[derive(Debug)]
pub enum ProviderError {
    Http(reqwest::Error),
    Api(String),
    /// Insufficient credits/quota at the provider. Surfaced separately so
    /// the operator can top up instead of chasing a phantom bug.
    QuotaExceeded(String),
    /// Task did not reach a terminal state within the polling budget.
    Timeout,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Http(e) => write!(f, "HTTP error: {}", e),
            ProviderError::Api(s) => write!(f, "provider error: {}", s),
            ProviderError::QuotaExceeded(s) => write!(f, "provider quota exceeded: {}", s),
            ProviderError::Timeout => write!(f, "generation task timed out"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e)
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    kind: GenerationKind,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct TaskStatusResponse {
    status: String,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

#[derive(Clone)]
pub struct GenerationClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;
const REQUEST_TIMEOUT_SECS: u64 = 30;

impl GenerationClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }

    /// Submit a generation task, returning its provider task id.
    pub async fn submit(
        &self,
        kind: GenerationKind,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/tasks", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&SubmitRequest { kind, prompt })
            .send()
            .await?;

        if resp.status().as_u16() == 402 {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::QuotaExceeded(text));
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api(text));
        }

        let submit: SubmitResponse = resp.json().await?;
        Ok(submit.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatusResponse, ProviderError> {
        let url = format!("{}/v1/tasks/{}", self.base_url, task_id);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api(text));
        }
        Ok(resp.json().await?)
    }

    /// Submit and poll to a terminal state, up to the attempt budget.
    /// Returns the generated media URL.
    pub async fn generate(
        &self,
        kind: GenerationKind,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let task_id = self.submit(kind, prompt).await?;

        for _ in 0..self.max_poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            let status = self.poll(&task_id).await?;
            match status.status.as_str() {
                "completed" => {
                    return status.media_url.ok_or_else(|| {
                        ProviderError::Api("completed task carried no media url".to_string())
                    });
                }
                "failed" => {
                    let message = status.error.unwrap_or_else(|| "unknown".to_string());
                    if status.error_code.as_deref() == Some("insufficient_credits") {
                        return Err(ProviderError::QuotaExceeded(message));
                    }
                    return Err(ProviderError::Api(message));
                }
                _ => continue,
            }
        }
        Err(ProviderError::Timeout)
    }
}
