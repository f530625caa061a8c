use serde_json::{json, Value};
use std::sync::Arc;

use super::{GenerationRequest, GenerationResponse, ProviderAdapter};
use crate::channel::Channel;

/// OpenAI-compatible generation endpoints (also used for Azure-hosted ones)
pub struct OpenAiAdapter {
    channel: Arc<Channel>,
}

impl OpenAiAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn convert_request(&self, request: &GenerationRequest) -> Value {
        let mut payload = json!({
            "prompt": request.prompt,
            "model": request.model,
        });

        if let Some(size) = &request.size {
            payload["size"] = json!(size);
        }
        if let Some(duration) = request.duration {
            payload["duration"] = json!(duration);
        }
        if let Some(aspect_ratio) = &request.aspect_ratio {
            payload["aspect_ratio"] = json!(aspect_ratio);
        }
        if let Some(reference_image) = &request.reference_image {
            payload["reference_image"] = json!(reference_image);
        }
        for (key, value) in &request.extra {
            payload[key] = value.clone();
        }

        payload
    }

    fn convert_response(&self, body: &Value) -> GenerationResponse {
        GenerationResponse {
            task_id: body
                .get("id")
                .or_else(|| body.get("task_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_string(),
            video_url: body
                .get("video_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            image_url: body
                .pointer("/data/0/url")
                .or_else(|| body.get("image_url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            progress: body
                .get("progress")
                .and_then(Value::as_u64)
                .map(|p| p.min(100) as u8),
            cost: body.get("cost").and_then(Value::as_f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProviderKind;
    use crate::providers::test_support;

    #[test]
    fn test_image_url_from_data_array() {
        let adapter = OpenAiAdapter::new(test_support::channel_with(
            ProviderKind::OpenAi,
            "https://api.openai.com",
        ));

        let response = adapter.convert_response(&serde_json::json!({
            "id": "gen-1",
            "status": "completed",
            "data": [{"url": "https://cdn.example.com/img.png"}]
        }));
        assert_eq!(
            response.image_url.as_deref(),
            Some("https://cdn.example.com/img.png")
        );
    }
}
