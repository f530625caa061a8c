use serde_json::{json, Value};
use std::sync::Arc;

use super::{GenerationRequest, GenerationResponse, ProviderAdapter};
use crate::channel::Channel;

/// Sora-style video generation API
pub struct SoraAdapter {
    channel: Arc<Channel>,
}

impl SoraAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

impl ProviderAdapter for SoraAdapter {
    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn submit_path(&self) -> String {
        "/sora/v1/videos".to_string()
    }

    fn status_path(&self, task_id: &str) -> String {
        format!("/sora/v1/videos/{}", task_id)
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
            payload["seconds"] = json!(duration);
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
                .get("image_url")
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

    fn adapter() -> SoraAdapter {
        SoraAdapter::new(test_support::channel_with(
            ProviderKind::Sora,
            "https://api.example.com",
        ))
    }

    #[test]
    fn test_convert_request_maps_field_names() {
        let mut request = test_support::request("a red fox", "sora-1.0");
        request.size = Some("1080p".to_string());
        request.duration = Some(10);
        request.aspect_ratio = Some("16:9".to_string());

        let payload = adapter().convert_request(&request);
        assert_eq!(payload["prompt"], "a red fox");
        assert_eq!(payload["seconds"], 10);
        assert_eq!(payload["aspect_ratio"], "16:9");
        assert!(payload.get("reference_image").is_none());
    }

    #[test]
    fn test_convert_response_accepts_both_id_fields() {
        let adapter = adapter();

        let by_id = adapter.convert_response(&serde_json::json!({
            "id": "task-1", "status": "in_progress", "progress": 40
        }));
        assert_eq!(by_id.task_id, "task-1");
        assert_eq!(by_id.progress, Some(40));

        let by_task_id = adapter.convert_response(&serde_json::json!({
            "task_id": "task-2", "status": "completed",
            "video_url": "https://cdn.example.com/v.mp4"
        }));
        assert_eq!(by_task_id.task_id, "task-2");
        assert_eq!(
            by_task_id.video_url.as_deref(),
            Some("https://cdn.example.com/v.mp4")
        );
    }

    #[test]
    fn test_urls() {
        let adapter = adapter();
        assert_eq!(
            adapter.full_url(&adapter.submit_path()),
            "https://api.example.com/sora/v1/videos"
        );
        assert_eq!(
            adapter.full_url(&adapter.status_path("t-9")),
            "https://api.example.com/sora/v1/videos/t-9"
        );
    }
}
