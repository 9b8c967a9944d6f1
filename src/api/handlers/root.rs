use crate::{api::AppState, error::GateError};
use axum::{
    http::{header::LOCATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

/// 302 to the caller's destination, or to the login page for anonymous
/// visitors. An outage is a 503, never a login redirect.
pub async fn role_redirect(state: &AppState, headers: &HeaderMap) -> Response {
    let mode = state.config().routing_mode();
    match super::require_session(state, headers).await {
        Ok(identity) => found(&mode.destination(identity.role)),
        Err(GateError::Unauthenticated) => found(&mode.login_destination()),
        Err(err) => {
            debug!("Role redirect unavailable: {err}");
            err.into_response()
        }
    }
}

pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}
