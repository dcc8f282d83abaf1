//! Bearer token verification for administrative actions.
//!
//! Tokens are issued by the account service (or the `bulk-sender-token`
//! binary) and have the form `subject.issued_at.signature`, where the
//! signature is the hex HMAC-SHA256 of `subject.issued_at` under the shared
//! signing key.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization required")]
    Missing,

    #[error("malformed token")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    BadSignature,

    #[error("authorization is not configured")]
    NotConfigured,
}

fn sign(signing_key: &str, payload: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Issue a token for `subject`, stamped with `issued_at` (unix seconds).
pub fn issue_token(signing_key: &str, subject: &str, issued_at: u64) -> Option<String> {
    if signing_key.is_empty() || subject.is_empty() {
        return None;
    }
    let payload = format!("{}.{}", subject, issued_at);
    let signature = sign(signing_key, &payload)?;
    Some(format!("{}.{}", payload, signature))
}

/// Issue a token stamped with the current time.
pub fn issue_token_now(signing_key: &str, subject: &str) -> Option<String> {
    issue_token(signing_key, subject, now_secs())
}

/// Verify a token and return its subject.
///
/// # Arguments
///
/// * `signing_key` - Shared HMAC key
/// * `token` - The raw token (without the `Bearer ` prefix)
/// * `max_age_seconds` - Maximum allowed token age (clock skew is tolerated
///   symmetrically)
pub fn verify_token(
    signing_key: &str,
    token: &str,
    max_age_seconds: u64,
) -> Result<String, AuthError> {
    if signing_key.is_empty() {
        return Err(AuthError::NotConfigured);
    }
    if token.is_empty() {
        return Err(AuthError::Missing);
    }

    let mut parts = token.rsplitn(3, '.');
    let (signature, issued_at, subject) = match (parts.next(), parts.next(), parts.next()) {
        (Some(sig), Some(ts), Some(sub)) if !sub.is_empty() => (sig, ts, sub),
        _ => return Err(AuthError::Malformed),
    };

    let issued_at: u64 = issued_at.parse().map_err(|_| AuthError::Malformed)?;

    let current_time = now_secs();
    let age = current_time.abs_diff(issued_at);
    if age > max_age_seconds {
        warn!(
            issued_at = issued_at,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "auth_token_stale"
        );
        return Err(AuthError::Expired);
    }

    let expected = sign(signing_key, &format!("{}.{}", subject, issued_at))
        .ok_or(AuthError::NotConfigured)?;

    if !constant_time_compare(&expected, signature) {
        warn!(subject = %subject, "auth_token_signature_mismatch");
        return Err(AuthError::BadSignature);
    }

    Ok(subject.to_string())
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?.trim_start();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::Malformed)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
