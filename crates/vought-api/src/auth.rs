//! Socket credential check.
//!
//! Browsers cannot set headers on a WebSocket handshake, so the credential
//! rides in a cookie: `Authorization=Basic%20<base64(user:password)>`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

/// Cookie carrying the socket credential.
pub const AUTH_COOKIE: &str = "Authorization";

const SCHEME_PREFIX: &str = "Basic ";

/// Decoded `user:password` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Decode the raw cookie value.
pub fn decode_credentials(cookie_value: &str) -> ApiResult<Credentials> {
    let value = urlencoding::decode(cookie_value)
        .map_err(|_| ApiError::unauthorized("Credential is not valid percent-encoding"))?;
    let encoded = value
        .strip_prefix(SCHEME_PREFIX)
        .ok_or_else(|| ApiError::unauthorized("Unsupported credential scheme"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::unauthorized(format!("Invalid base64 credential: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ApiError::unauthorized("Credential is not UTF-8"))?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or_else(|| ApiError::unauthorized("Credential has no password part"))?;

    Ok(Credentials {
        user: user.to_string(),
        password: password.to_string(),
    })
}

/// Check the cookie value against the configured socket credential.
pub fn authorize(cookie_value: Option<&str>, config: &ApiConfig) -> ApiResult<()> {
    let cookie_value =
        cookie_value.ok_or_else(|| ApiError::unauthorized("Missing Authorization cookie"))?;
    let credentials = decode_credentials(cookie_value)?;

    if credentials.user == config.user_auth && credentials.password == config.pwd_auth {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Credential mismatch"))
    }
}

/// Cookie value a client sends for `user:password`.
pub fn encode_cookie_value(user: &str, password: &str) -> String {
    let encoded = STANDARD.encode(format!("{}:{}", user, password));
    format!("Basic%20{}", encoded)
}
