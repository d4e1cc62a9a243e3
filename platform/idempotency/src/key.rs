use axum::http::Method;
use sha2::{Digest, Sha256};

use crate::KeyError;

/// Trim surrounding whitespace from a raw header value
pub fn normalize_key(raw: &str) -> &str {
    raw.trim()
}

/// Keys are 1..=`max_length` characters of `[A-Za-z0-9_-]`
pub fn validate_key(key: &str, max_length: usize) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Required);
    }
    if key.chars().count() > max_length {
        return Err(KeyError::TooLong { max: max_length });
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(KeyError::InvalidCharacters);
    }
    Ok(())
}

/// Lowercase hex SHA-256 of `METHOD \n PATH \n BODY`
pub fn fingerprint(method: &Method, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// [`fingerprint`] bound to the calling user, so one user's key never
/// matches another user's request
pub fn scoped_fingerprint(method: &Method, path: &str, user: Option<&str>, body: &[u8]) -> String {
    let Some(user) = user else {
        return fingerprint(method, path, body);
    };
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\nuser:");
    hasher.update(user.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Methods that change state and therefore go through the gate
pub fn is_mutating(method: &Method) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}
