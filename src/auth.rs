//! API key authentication
//!
//! Keys are static configuration; each maps to a tenant whose channels the
//! caller may relay through. Comparison is constant-time per candidate key.
//! Regular routes present the key as a bearer token or `X-Api-Key` header;
//! the SSE stream passes it as a query parameter because EventSource
//! clients cannot set headers.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::ApiKeyConfig;
use crate::error::AppError;

/// Who an authenticated request is acting as
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key_name: String,
    pub tenant: String,
}

pub struct ApiKeyAuth {
    keys: Vec<ApiKeyConfig>,
}

impl ApiKeyAuth {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| k.enabled).collect(),
        }
    }

    /// Constant-time key lookup; None for unknown or disabled keys
    pub fn verify(&self, presented: &str) -> Option<AuthContext> {
        let presented = presented.as_bytes();
        self.keys
            .iter()
            .find(|candidate| {
                let key = candidate.key.as_bytes();
                key.len() == presented.len() && key.ct_eq(presented).into()
            })
            .map(|matched| AuthContext {
                key_name: matched.name.clone(),
                tenant: matched.tenant.clone(),
            })
    }
}

fn presented_key(request: &Request) -> Option<&str> {
    if let Some(value) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
}

/// Middleware for header-authenticated routes; the resolved [`AuthContext`]
/// lands in request extensions.
pub async fn require_api_key(
    State(auth): State<Arc<ApiKeyAuth>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let context = presented_key(&request)
        .and_then(|key| auth.verify(key))
        .ok_or_else(|| AppError::Unauthorized("invalid or missing API key".to_string()))?;

    tracing::debug!(key = %context.key_name, tenant = %context.tenant, "Request authenticated");
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
