pub mod auth;
pub mod gate;
pub mod health;
pub mod invite;
pub mod profile;
pub mod root;
pub mod sso;

// common functions for the handlers
use crate::{
    api::AppState,
    error::GateError,
    session::{cookie, Identity, IssuedSession},
};
use axum::http::{header::SET_COOKIE, HeaderMap};
use chrono::Utc;
use tracing::error;

/// Resolve the caller's session from the bearer header or cookie.
pub async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Identity, GateError> {
    let token = cookie::extract_session_token(headers);
    state
        .validator()
        .validate(token.as_deref())
        .await
        .map(|session| session.user)
}

/// Sign a fresh session for `identity` and the `Set-Cookie` header carrying it.
pub fn issue_session(
    state: &AppState,
    identity: &Identity,
) -> Result<(HeaderMap, IssuedSession), GateError> {
    let issued = state.signer().issue(identity, Utc::now()).map_err(|err| {
        error!("Failed to sign session: {err}");
        GateError::unavailable(err)
    })?;
    let value = cookie::session_cookie(state.config(), &issued.token).map_err(|err| {
        error!("Failed to build session cookie: {err}");
        GateError::unavailable(err)
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, value);
    Ok((headers, issued))
}
