//! Sign-in through the identity provider, sign-out and refresh.

use super::issue_session;
use crate::{
    api::AppState,
    error::{ErrorBody, GateError},
    identity::ProviderUser,
    profile::{normalize_email, validate_nickname},
    roles::Role,
    session::{cookie, Identity},
    store::{bounded, NewUser},
};
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

#[derive(ToSchema, Deserialize, Debug)]
pub struct CallbackRequest {
    code: String,
    /// Checked by the browser before posting; accepted for compatibility.
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user: Identity,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub redirect_url: String,
}

#[utoipa::path(
    post,
    path= "/auth/callback",
    request_body = CallbackRequest,
    responses (
        (status = 200, description = "Signed in, session cookie set", body = SessionResponse),
        (status = 400, description = "Missing code", body = ErrorBody),
        (status = 401, description = "Code rejected by the identity provider", body = ErrorBody),
        (status = 409, description = "Email already bound to another account", body = ErrorBody),
        (status = 503, description = "Identity provider or store unavailable", body = ErrorBody),
    ),
    tag = "auth",
)]
#[instrument(skip_all)]
pub async fn callback(
    state: Extension<Arc<AppState>>,
    payload: Json<CallbackRequest>,
) -> Result<Response, GateError> {
    let code = payload.code.trim();
    if code.is_empty() {
        return Err(GateError::Validation("missing authorization code".to_string()));
    }
    if payload.state.is_none() {
        debug!("Callback without state parameter");
    }

    let user = state
        .provider()
        .exchange_code(
            code,
            payload.code_verifier.as_deref(),
            payload.redirect_uri.as_deref(),
        )
        .await?;
    let identity = establish_session(&state, user).await?;
    session_response(&state, &identity)
}

#[utoipa::path(
    post,
    path= "/auth/logout",
    responses (
        (status = 204, description = "Session cookie cleared"),
    ),
    tag = "auth",
)]
pub async fn logout(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    match cookie::clear_session_cookie(state.config()) {
        Ok(value) => {
            headers.insert(SET_COOKIE, value);
        }
        Err(err) => error!("Failed to build logout cookie: {err}"),
    }
    (StatusCode::NO_CONTENT, headers)
}

#[utoipa::path(
    post,
    path= "/auth/refresh",
    responses (
        (status = 200, description = "New session issued", body = SessionResponse),
        (status = 401, description = "No session, or expired beyond the grace window", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "auth",
)]
#[instrument(skip_all)]
pub async fn refresh(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, GateError> {
    let token = cookie::extract_session_token(&headers).ok_or(GateError::Unauthenticated)?;
    let claims = state
        .signer()
        .verify_for_refresh(&token, Utc::now(), state.config().refresh_grace_seconds())
        .map_err(|err| {
            debug!("Refusing refresh: {err}");
            GateError::Unauthenticated
        })?;

    let profile = bounded(
        state.config().upstream_timeout(),
        "session.refresh",
        state.users().find_user(claims.sub),
    )
    .await?
    .ok_or(GateError::Unauthenticated)?;

    session_response(&state, &Identity::from(&profile))
}

/// Create or load the profile behind a provider identity. The stored role
/// wins over the provider's hint once the profile exists.
pub(crate) async fn establish_session(
    state: &AppState,
    user: ProviderUser,
) -> Result<Identity, GateError> {
    let nickname = user
        .nickname
        .as_deref()
        .and_then(|nickname| validate_nickname(nickname).ok());
    let new_user = NewUser {
        id: user.id,
        email: normalize_email(&user.email),
        role: Role::from_claim(user.role_claim.as_deref()),
        nickname,
    };
    let outcome = bounded(
        state.config().upstream_timeout(),
        "profile.ensure",
        state.users().ensure_user(&new_user),
    )
    .await?;
    let Some(profile) = outcome.into_profile() else {
        warn!(user = %new_user.id, "Sign-in email is bound to another profile");
        return Err(GateError::EmailConflict);
    };

    info!(user = %profile.id, role = %profile.role, "Signed in");
    Ok(Identity::from(&profile))
}

pub(crate) fn session_response(state: &AppState, identity: &Identity) -> Result<Response, GateError> {
    let (headers, issued) = issue_session(state, identity)?;
    let body = SessionResponse {
        user: identity.clone(),
        access_token: issued.token,
        expires_at: issued.expires_at,
        redirect_url: state.config().routing_mode().destination(identity.role),
    };
    Ok((headers, Json(body)).into_response())
}
