// =============================================================================
// Bearer Token Authentication — HMAC-signed tokens
// =============================================================================
//
// Tokens are `<client_id>.<expiry_unix_ms>.<hex hmac-sha256>`, signed with
// `AUTH_SECRET` (falling back to `ENGINE_WS_JWT_SECRET` for compatibility
// with deployments that set the older name). The signature covers
// `client_id.expiry_unix_ms`; comparison of the provided signature against
// the recomputed one is constant-time to avoid a timing side-channel.
// =============================================================================

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};

type HmacSha256 = Hmac<Sha256>;

/// Compare two byte slices in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn auth_secret() -> String {
    std::env::var("AUTH_SECRET")
        .or_else(|_| std::env::var("ENGINE_WS_JWT_SECRET"))
        .unwrap_or_default()
}

/// Sign a token for `client_id`, valid until `expiry_unix_ms`.
pub fn sign_token(client_id: &str, expiry_unix_ms: i64) -> Option<String> {
    let secret = auth_secret();
    if secret.is_empty() {
        return None;
    }
    let payload = format!("{client_id}.{expiry_unix_ms}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    Some(format!("{payload}.{sig}"))
}

/// Validate a signed token, checking both the HMAC and expiry.
pub fn validate_token(token: &str) -> bool {
    let secret = auth_secret();
    if secret.is_empty() {
        warn!("AUTH_SECRET is not set — rejecting all tokens");
        return false;
    }

    let parts: Vec<&str> = token.splitn(3, '.').collect();
    let [client_id, expiry_str, sig_hex] = parts.as_slice() else {
        return false;
    };

    let expiry_unix_ms: i64 = match expiry_str.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    if now_ms > expiry_unix_ms {
        return false;
    }

    let payload = format!("{client_id}.{expiry_str}");
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload.as_bytes());
    let expected_sig = hex::encode(mac.finalize().into_bytes());

    constant_time_eq(sig_hex.as_bytes(), expected_sig.as_bytes())
}

/// Axum extractor validating `Authorization: Bearer <token>` against the
/// signed-token scheme above.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !validate_token(token) {
            warn!("invalid or expired bearer token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret<F: FnOnce()>(f: F) {
        std::env::set_var("AUTH_SECRET", "test-secret");
        f();
        std::env::remove_var("AUTH_SECRET");
    }

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn signed_token_validates() {
        with_secret(|| {
            let token = sign_token("client-1", chrono::Utc::now().timestamp_millis() + 60_000)
                .unwrap();
            assert!(validate_token(&token));
        });
    }

    #[test]
    fn expired_token_is_rejected() {
        with_secret(|| {
            let token = sign_token("client-1", chrono::Utc::now().timestamp_millis() - 1).unwrap();
            assert!(!validate_token(&token));
        });
    }

    #[test]
    fn tampered_signature_is_rejected() {
        with_secret(|| {
            let token = sign_token("client-1", chrono::Utc::now().timestamp_millis() + 60_000)
                .unwrap();
            let mut tampered = token.clone();
            tampered.push('f');
            assert!(!validate_token(&tampered));
        });
    }

    #[test]
    fn missing_secret_rejects_everything() {
        assert!(!validate_token("whatever"));
    }
}
