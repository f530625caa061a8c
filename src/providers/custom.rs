use serde_json::Value;
use std::sync::Arc;

use super::{GenerationRequest, GenerationResponse, ProviderAdapter};
use crate::channel::Channel;

/// Passthrough adapter for endpoints that already speak the gateway's
/// generic request shape. Only auth and base URL are applied.
pub struct CustomAdapter {
    channel: Arc<Channel>,
}

impl CustomAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

impl ProviderAdapter for CustomAdapter {
    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn convert_request(&self, request: &GenerationRequest) -> Value {
        serde_json::to_value(request).unwrap_or(Value::Null)
    }

    fn convert_response(&self, body: &Value) -> GenerationResponse {
        serde_json::from_value(body.clone()).unwrap_or_else(|_| GenerationResponse {
            task_id: body
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProviderKind;
    use crate::providers::test_support;

    #[test]
    fn test_passthrough_roundtrip() {
        let adapter = CustomAdapter::new(test_support::channel_with(
            ProviderKind::Custom,
            "https://relay.internal",
        ));

        let request = test_support::request("hello", "custom-model");
        let payload = adapter.convert_request(&request);
        assert_eq!(payload["prompt"], "hello");
        assert_eq!(payload["model"], "custom-model");

        let response = adapter.convert_response(&serde_json::json!({
            "task_id": "t-1", "status": "queued"
        }));
        assert_eq!(response.task_id, "t-1");
    }
}
