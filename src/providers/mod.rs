//! Provider adapters
//!
//! One adapter per upstream family. The adapter owns every piece of
//! upstream-specific wire knowledge (URL shape, auth headers, request and
//! response field names) so the dispatcher and poller stay generic.
//! `do_request` never fails on a non-2xx status: the raw status and body
//! come back so the caller can classify the failure.

mod custom;
mod openai;
mod sora;

pub use custom::CustomAdapter;
pub use openai::OpenAiAdapter;
pub use sora::SoraAdapter;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, ProviderKind};
use crate::error::AppError;

/// Provider-agnostic generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
    /// Provider-specific extension fields, forwarded as-is
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Provider-agnostic generation response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub task_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Raw upstream reply: HTTP status plus the body as-is
#[derive(Debug, Clone)]
pub struct RawUpstream {
    pub status: u16,
    pub body: Value,
}

impl RawUpstream {
    /// Error-shaped: non-2xx status, an `error` field, or a failed status
    /// reported inside a 2xx body.
    pub fn is_error(&self) -> bool {
        if self.status >= 400 {
            return true;
        }
        if self.body.get("error").is_some_and(|e| !e.is_null()) {
            return true;
        }
        self.body.get("status").and_then(Value::as_str) == Some("failed")
    }

    pub fn error_message(&self) -> String {
        self.body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.body
                    .get("error")
                    .filter(|e| !e.is_null())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("upstream returned HTTP {}", self.status))
            })
    }

    pub fn error_code(&self) -> Option<String> {
        self.body
            .pointer("/error/type")
            .or_else(|| self.body.get("error_code"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn channel(&self) -> &Arc<Channel>;

    fn request_headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.channel().api_key),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    fn full_url(&self, path: &str) -> String {
        format!("{}{}", self.channel().base_url, path)
    }

    fn submit_path(&self) -> String {
        "/v1/videos".to_string()
    }

    fn status_path(&self, task_id: &str) -> String {
        format!("/v1/videos/{}", task_id)
    }

    /// Translate the generic request into this provider's payload shape
    fn convert_request(&self, request: &GenerationRequest) -> Value;

    /// Translate the provider's body into the generic response shape
    fn convert_response(&self, body: &Value) -> GenerationResponse;

    /// POST with a bounded timeout. Non-2xx is NOT an error here; the
    /// caller classifies via [`RawUpstream::is_error`].
    async fn do_request(
        &self,
        client: &Client,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<RawUpstream, AppError> {
        let mut builder = client.post(url).timeout(timeout);
        for (name, value) in self.request_headers() {
            builder = builder.header(name, value);
        }

        let response = builder.json(payload).send().await?;
        let status = response.status().as_u16();
        let body = read_body_lenient(response).await;

        Ok(RawUpstream { status, body })
    }

    /// GET the upstream job status with a (shorter) bounded timeout
    async fn query_status(
        &self,
        client: &Client,
        task_id: &str,
        timeout: Duration,
    ) -> Result<RawUpstream, AppError> {
        let url = self.full_url(&self.status_path(task_id));
        let mut builder = client.get(url.as_str()).timeout(timeout);
        for (name, value) in self.request_headers() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = read_body_lenient(response).await;

        Ok(RawUpstream { status, body })
    }
}

/// Body as JSON when possible, otherwise the raw text wrapped in a string
async fn read_body_lenient(response: reqwest::Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Resolve the adapter for a channel's provider kind.
///
/// The match is exhaustive over [`ProviderKind`]: adding a provider means
/// adding a variant and an arm, never a string comparison.
pub fn make_adapter(channel: Arc<Channel>) -> Box<dyn ProviderAdapter> {
    match channel.provider {
        ProviderKind::Sora => Box::new(SoraAdapter::new(channel)),
        ProviderKind::OpenAi => Box::new(OpenAiAdapter::new(channel)),
        ProviderKind::Custom => Box::new(CustomAdapter::new(channel)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_shape_detection() {
        let ok = RawUpstream {
            status: 200,
            body: json!({"id": "task-1", "status": "queued"}),
        };
        assert!(!ok.is_error());

        let http_error = RawUpstream {
            status: 500,
            body: json!({"error": {"message": "boom"}}),
        };
        assert!(http_error.is_error());
        assert_eq!(http_error.error_message(), "boom");

        let soft_failure = RawUpstream {
            status: 200,
            body: json!({"status": "failed", "error": {"message": "nsfw", "type": "moderation"}}),
        };
        assert!(soft_failure.is_error());
        assert_eq!(soft_failure.error_code().as_deref(), Some("moderation"));
    }

    #[test]
    fn test_null_error_field_is_not_error() {
        let raw = RawUpstream {
            status: 200,
            body: json!({"id": "t", "status": "completed", "error": null}),
        };
        assert!(!raw.is_error());
    }

    #[test]
    fn test_factory_is_exhaustive() {
        for kind in [ProviderKind::Sora, ProviderKind::OpenAi, ProviderKind::Custom] {
            let channel = test_support::channel_with(kind, "https://api.example.com");
            let adapter = make_adapter(channel);
            assert_eq!(
                adapter.full_url("/v1/videos"),
                "https://api.example.com/v1/videos"
            );
        }
    }
}
