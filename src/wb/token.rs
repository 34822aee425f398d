//! Marketplace API token inspection.
//!
//! Tokens are three-segment signed JWTs. Only the payload is read; the
//! signature is the marketplace's business, the probe in `WbClient` tells
//! whether the token is actually accepted.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not a three-segment JWT")]
    Malformed,
    #[error("token payload could not be decoded: {0}")]
    Decode(String),
    #[error("legacy token type is not supported")]
    LegacyToken,
    #[error("token expiry is out of range")]
    InvalidExpiry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Content,
    Analytics,
    PricesDiscounts,
    Marketplace,
    Statistics,
    Promotion,
    FeedbacksQuestions,
    Recommendations,
    ReadOnly,
}

impl TokenScope {
    const ALL: [TokenScope; 9] = [
        TokenScope::Content,
        TokenScope::Analytics,
        TokenScope::PricesDiscounts,
        TokenScope::Marketplace,
        TokenScope::Statistics,
        TokenScope::Promotion,
        TokenScope::FeedbacksQuestions,
        TokenScope::Recommendations,
        TokenScope::ReadOnly,
    ];

    fn bit(self) -> u32 {
        match self {
            TokenScope::Content => 1,
            TokenScope::Analytics => 2,
            TokenScope::PricesDiscounts => 3,
            TokenScope::Marketplace => 4,
            TokenScope::Statistics => 5,
            TokenScope::Promotion => 6,
            TokenScope::FeedbacksQuestions => 7,
            TokenScope::Recommendations => 8,
            TokenScope::ReadOnly => 30,
        }
    }

    fn from_mask(mask: u64) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|scope| mask & (1 << scope.bit()) != 0)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    id: Option<String>,
    exp: i64,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    uid: Option<i64>,
    #[serde(default)]
    s: u64,
    #[serde(rename = "acsessID", default)]
    legacy_access_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ApiToken {
    pub id: Option<String>,
    pub supplier_id: Option<String>,
    pub user_id: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<TokenScope>,
}

impl ApiToken {
    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        let mut segments = raw.trim().split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| TokenError::Decode(err.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&bytes).map_err(|err| TokenError::Decode(err.to_string()))?;
        if claims.legacy_access_id.is_some() {
            return Err(TokenError::LegacyToken);
        }
        let expires_at =
            DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or(TokenError::InvalidExpiry)?;

        Ok(Self {
            id: claims.id,
            supplier_id: claims.sid,
            user_id: claims.uid,
            expires_at,
            scopes: TokenScope::from_mask(claims.s),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.contains(&scope)
    }

    pub fn is_read_only(&self) -> bool {
        self.has_scope(TokenScope::ReadOnly)
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn decodes_expiry_and_scopes() {
        let exp = Utc::now() + Duration::days(30);
        let token = encode_test_token(&json!({
            "id": "abc",
            "exp": exp.timestamp(),
            "sid": "supplier-1",
            "iid": 42,
            "uid": 7,
            "s": (1 << 1) | (1 << 5) | (1 << 30)
        }));
        let decoded = ApiToken::decode(&token).expect("token");
        assert_eq!(decoded.supplier_id.as_deref(), Some("supplier-1"));
        assert!(!decoded.is_expired(Utc::now()));
        assert!(decoded.has_scope(TokenScope::Content));
        assert!(decoded.has_scope(TokenScope::Statistics));
        assert!(!decoded.has_scope(TokenScope::Marketplace));
        assert!(decoded.is_read_only());
    }

    #[test]
    fn past_expiry_is_expired() {
        let token = encode_test_token(&json!({ "exp": 1_600_000_000 }));
        let decoded = ApiToken::decode(&token).expect("token");
        assert!(decoded.is_expired(Utc::now()));
    }

    #[test]
    fn legacy_tokens_are_rejected() {
        let token = encode_test_token(&json!({ "exp": 4_000_000_000i64, "acsessID": "x" }));
        assert_eq!(ApiToken::decode(&token).unwrap_err(), TokenError::LegacyToken);
    }

    #[test]
    fn malformed_tokens_fail_to_decode() {
        assert_eq!(ApiToken::decode("not-a-token").unwrap_err(), TokenError::Malformed);
        assert_eq!(ApiToken::decode("a.b.c.d").unwrap_err(), TokenError::Malformed);
        assert!(matches!(
            ApiToken::decode("aaa.%%%.ccc").unwrap_err(),
            TokenError::Decode(_)
        ));
        let no_exp = encode_test_token(&json!({ "id": "x" }));
        assert!(matches!(ApiToken::decode(&no_exp).unwrap_err(), TokenError::Decode(_)));
    }
}
