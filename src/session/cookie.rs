//! Session cookie and bearer header handling.

use crate::config::GateConfig;
use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};

pub const SESSION_COOKIE_NAME: &str = "access_token";

/// Build the `HttpOnly` session cookie carrying `token`.
///
/// # Errors
/// Returns an error if the token contains characters not allowed in a header.
pub fn session_cookie(config: &GateConfig, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    push_attributes(config, &mut cookie);
    HeaderValue::from_str(&cookie)
}

/// Expire the session cookie. Domain and path must match the issuing cookie.
///
/// # Errors
/// Returns an error if the configured domain is not a valid header value.
pub fn clear_session_cookie(config: &GateConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    push_attributes(config, &mut cookie);
    HeaderValue::from_str(&cookie)
}

fn push_attributes(config: &GateConfig, cookie: &mut String) {
    if let Some(domain) = config.cookie_domain() {
        cookie.push_str("; Domain=.");
        cookie.push_str(domain);
    }
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
}

/// Bearer header first, then the session cookie.
#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            let val = val.trim();
            if key.trim() == SESSION_COOKIE_NAME && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
