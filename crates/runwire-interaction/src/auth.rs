//! Bearer credentials.
//!
//! Every request and the push hub need a bearer token obtained out of band.
//! A missing token is `AuthRequired`; a JWT whose `exp` claim lies in the
//! past is `AuthExpired`. Opaque (non-JWT) tokens are passed through as-is.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use runwire_core::{ClientError, ClientSettings, Result};
use serde::Deserialize;
use std::sync::RwLock;

/// Source of the current bearer token.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A token held in memory; replaceable after re-authentication.
#[derive(Debug, Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.token.clone())
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|token| token.clone())
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT. `None` for opaque tokens or tokens
/// without an expiry.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    jwt_expiry(token).is_some_and(|exp| exp <= now)
}

/// Returns a usable bearer token or the matching auth error.
pub fn require_token(provider: &dyn CredentialProvider) -> Result<String> {
    let token = provider
        .bearer_token()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(ClientError::AuthRequired)?;

    if is_expired(&token, Utc::now()) {
        tracing::warn!("[Auth] Bearer token has expired");
        return Err(ClientError::AuthExpired(
            "Session expired. Please sign in again.".to_string(),
        ));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_missing_token_is_auth_required() {
        let provider = StaticToken::new(None);
        assert_eq!(require_token(&provider), Err(ClientError::AuthRequired));

        provider.set(Some("   ".into()));
        assert_eq!(require_token(&provider), Err(ClientError::AuthRequired));
    }

    #[test]
    fn test_expired_jwt() {
        let past = Utc::now().timestamp() - 60;
        let provider = StaticToken::new(Some(jwt(past)));
        assert!(matches!(require_token(&provider), Err(ClientError::AuthExpired(_))));

        let future = Utc::now().timestamp() + 3600;
        provider.set(Some(jwt(future)));
        assert!(require_token(&provider).is_ok());
        assert_eq!(jwt_expiry(&jwt(future)).unwrap().timestamp(), future);
    }

    #[test]
    fn test_opaque_token_passes() {
        let provider = StaticToken::new(Some("opaque-token".into()));
        assert_eq!(require_token(&provider).unwrap(), "opaque-token");
        assert!(jwt_expiry("a.b").is_none());
    }
}
