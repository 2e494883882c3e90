//! Two token schemes: bcrypt-hashed static operator tokens, and short-lived
//! HS256 transfer tokens scoped to one job and one audience.

use std::collections::HashMap;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

pub const AUD_STORAGE: &str = "storage";
pub const AUD_MANAGER: &str = "manager";

/// Claims carried by a transfer token. `extra` holds the mode-specific claims
/// (`download_url`, `filename`, `mod_id`, `callback_context`, ...) that aren't
/// fixed across every job kind; `callback_context` in particular must be
/// returned verbatim, so it is preserved as opaque JSON rather than typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferClaims {
    pub job_id: String,
    pub aud: String,
    #[serde(default)]
    pub iss: Option<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl TransferClaims {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_i64())
    }
}

/// Verify and decode a transfer token. Fails closed (`token_invalid`) on bad
/// signature, wrong audience, or expiry. If no secret is configured, ingress
/// decoding fails closed too (the caller maps this the same as any other
/// `token_invalid`).
pub fn decode_transfer_token(
    token: &str,
    expected_aud: &str,
    secret: Option<&str>,
) -> Result<TransferClaims, AppError> {
    let secret = secret.ok_or_else(|| AppError::TokenInvalid("signing secret unconfigured".into()))?;

    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[expected_aud]);
    validation.validate_exp = true;

    let data = decode::<TransferClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| AppError::TokenInvalid(e.to_string()))?;

    if data.claims.aud != expected_aud {
        return Err(AppError::TokenInvalid("audience mismatch".into()));
    }

    Ok(data.claims)
}

/// Sign a transfer token for `job_id`/`aud`, embedding `extra` mode-specific
/// claims, expiring `ttl_seconds` from now. Used by tests and by the
/// callback dispatcher (C8) to mint the outbound manager-audience token.
pub fn encode_transfer_token(
    job_id: &str,
    aud: &str,
    iss: Option<&str>,
    ttl_seconds: i64,
    extra: HashMap<String, Value>,
    secret: &str,
) -> Result<String, AppError> {
    let now = chrono::Utc::now().timestamp();
    let claims = TransferClaims {
        job_id: job_id.to_string(),
        aud: aud.to_string(),
        iss: iss.map(|s| s.to_string()),
        iat: now,
        exp: now + ttl_seconds,
        extra,
    };

    encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token signing failed: {e}")))
}

/// Constant-time bcrypt comparison against a named static operator token.
pub fn check_static_token(
    static_tokens: &HashMap<String, String>,
    name: &str,
    presented: &str,
) -> Result<(), AppError> {
    let hash = static_tokens
        .get(name)
        .ok_or_else(|| AppError::TokenInvalid(format!("no hash configured for {name}")))?;

    let matches = bcrypt::verify(presented, hash)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("bcrypt verify failed: {e}")))?;

    if matches {
        Ok(())
    } else {
        Err(AppError::TokenInvalid(format!("static token mismatch for {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claims() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("download_url".to_string(), Value::String("http://host/a.zip".into()));
        m.insert("filename".to_string(), Value::String("a.zip".into()));
        m
    }

    #[test]
    fn round_trip_within_ttl() {
        let secret = "test-secret";
        let token = encode_transfer_token("job_abcdef01", AUD_STORAGE, None, 600, sample_claims(), secret).unwrap();
        let claims = decode_transfer_token(&token, AUD_STORAGE, Some(secret)).unwrap();
        assert_eq!(claims.job_id, "job_abcdef01");
        assert_eq!(claims.get_str("download_url"), Some("http://host/a.zip"));
    }

    #[test]
    fn wrong_audience_fails() {
        let secret = "test-secret";
        let token = encode_transfer_token("job_abcdef01", AUD_STORAGE, None, 600, sample_claims(), secret).unwrap();
        assert!(decode_transfer_token(&token, AUD_MANAGER, Some(secret)).is_err());
    }

    #[test]
    fn expired_token_fails() {
        let secret = "test-secret";
        let token = encode_transfer_token("job_abcdef01", AUD_STORAGE, None, -1, sample_claims(), secret).unwrap();
        assert!(decode_transfer_token(&token, AUD_STORAGE, Some(secret)).is_err());
    }

    #[test]
    fn tampered_signature_fails() {
        let secret = "test-secret";
        let token = encode_transfer_token("job_abcdef01", AUD_STORAGE, None, 600, sample_claims(), secret).unwrap();
        let tampered = format!("{}x", token);
        assert!(decode_transfer_token(&tampered, AUD_STORAGE, Some(secret)).is_err());
    }

    #[test]
    fn missing_secret_fails_closed() {
        assert!(decode_transfer_token("anything", AUD_STORAGE, None).is_err());
    }

    #[test]
    fn static_token_checks() {
        let mut tokens = HashMap::new();
        tokens.insert("storage_manage_token".to_string(), bcrypt::hash("secret123", 4).unwrap());
        assert!(check_static_token(&tokens, "storage_manage_token", "secret123").is_ok());
        assert!(check_static_token(&tokens, "storage_manage_token", "wrong").is_err());
        assert!(check_static_token(&tokens, "unknown_name", "secret123").is_err());
    }
}
