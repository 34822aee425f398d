use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const SERVICE_KEY_HEADER: &str = "X-Service-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AuthContext>>,
}

/// Caller identity attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub client: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("SERVICE_API_KEYS").unwrap_or_default();
        Self::from_keys(&raw)
    }

    /// Parse `client:key` pairs separated by commas.
    pub fn from_keys(raw: &str) -> Self {
        let mut records = HashMap::new();
        for (idx, entry) in raw.split(',').enumerate() {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.split_once(':').map(|(c, k)| (c.trim(), k.trim())) {
                Some((client, key)) if !client.is_empty() && !key.is_empty() => {
                    records.insert(
                        key.to_string(),
                        AuthContext {
                            client: client.to_string(),
                            api_key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "logistics_watch.api",
                    "ignored malformed SERVICE_API_KEYS entry at position {}",
                    idx + 1
                ),
            }
        }

        if records.is_empty() {
            warn!(
                target = "logistics_watch.api",
                "SERVICE_API_KEYS produced no keys; accepting the local development key"
            );
            records.insert(
                "dev-key".to_string(),
                AuthContext {
                    client: "local".to_string(),
                    api_key_id: "key-01".to_string(),
                },
            );
        } else {
            info!(
                target = "logistics_watch.api",
                key_count = records.len(),
                "loaded service API keys"
            );
        }
        Self {
            records: Arc::new(records),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Service-Key or Bearer token",
        ));
    };
    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(SERVICE_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn parses_client_key_pairs() {
        let state = AuthState::from_keys("bot:k1, ops:k2,broken,:k3");
        assert_eq!(
            state.authenticate("k2").map(|ctx| ctx.client),
            Some("ops".to_string())
        );
        assert!(state.authenticate("k3").is_none());
        assert!(state.authenticate("dev-key").is_none());
    }

    #[test]
    fn empty_spec_falls_back_to_dev_key() {
        let state = AuthState::from_keys("");
        assert!(state.authenticate("dev-key").is_some());
    }

    #[test]
    fn reads_bearer_or_service_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVICE_KEY_HEADER, HeaderValue::from_static(" k1 "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("k1"));
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer k2"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("k2"));
        assert!(extract_api_key(&HeaderMap::new()).is_none());
    }
}
