//! Session checks used by the role sections.

use super::{
    auth::{establish_session, session_response, SessionResponse},
    require_session,
    root::role_redirect,
};
use crate::{
    api::AppState,
    error::{ErrorBody, GateError},
    guard::Navigation,
    roles::Role,
    session::{cookie, Identity, ValidatedSession},
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Debug)]
pub struct SessionEnvelope {
    pub session: Option<ValidatedSession>,
}

#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct ValidateRequest {
    #[serde(default)]
    expected_role: Option<String>,
    #[serde(default)]
    current_path: Option<String>,
    #[serde(default)]
    current_host: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct SetSessionRequest {
    access_token: String,
}

#[utoipa::path(
    get,
    path= "/sso/session",
    responses (
        (status = 200, description = "Current session, or null when signed out", body = SessionEnvelope),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "sso",
)]
pub async fn session(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionEnvelope>, GateError> {
    let token = cookie::extract_session_token(&headers);
    match state.validator().validate(token.as_deref()).await {
        Ok(session) => Ok(Json(SessionEnvelope {
            session: Some(session),
        })),
        Err(GateError::Unauthenticated) => Ok(Json(SessionEnvelope { session: None })),
        Err(err) => Err(err),
    }
}

#[utoipa::path(
    post,
    path= "/sso/validate",
    request_body = ValidateRequest,
    responses (
        (status = 200, description = "Session may access the location", body = ValidateResponse),
        (status = 400, description = "Unknown expected role", body = ErrorBody),
        (status = 401, description = "No session", body = ValidateResponse),
        (status = 403, description = "Wrong role, redirect_url points at the caller's own section", body = ValidateResponse),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "sso",
)]
#[instrument(skip_all)]
pub async fn validate(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Option<Json<ValidateRequest>>,
) -> Result<Response, GateError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let expected_role = request
        .expected_role
        .as_deref()
        .map(str::parse::<Role>)
        .transpose()
        .map_err(|err| GateError::Validation(err.to_string()))?;

    let mode = state.guard().mode();
    let identity = match require_session(&state, &headers).await {
        Ok(identity) => identity,
        Err(GateError::Unauthenticated) => {
            let body = ValidateResponse {
                valid: false,
                user: None,
                redirect_url: Some(mode.login_destination()),
            };
            return Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response());
        }
        Err(err) => return Err(err),
    };

    let own_destination = mode.destination(identity.role);
    let checked = match expected_role {
        Some(role) if role != identity.role => Err(GateError::WrongRole {
            actual: identity.role,
            redirect_to: own_destination.clone(),
        }),
        _ => match request.current_path {
            Some(path) => {
                let navigation = Navigation::new(path).with_host(request.current_host);
                if state.guard().section(&navigation).is_some() {
                    state.guard().authorize(identity.clone(), &navigation)
                } else {
                    Ok(identity.clone())
                }
            }
            None => Ok(identity.clone()),
        },
    };

    let (status, redirect_url) = match checked {
        Ok(_) => (StatusCode::OK, own_destination),
        Err(GateError::WrongRole { redirect_to, .. }) => (StatusCode::FORBIDDEN, redirect_to),
        Err(err) => return Err(err),
    };
    let allowed = status == StatusCode::OK;
    debug!(user = %identity.id, allowed, "Session validated");

    let body = ValidateResponse {
        valid: allowed,
        user: Some(identity),
        redirect_url: Some(redirect_url),
    };
    Ok((status, Json(body)).into_response())
}

#[utoipa::path(
    post,
    path= "/sso/set-session",
    request_body = SetSessionRequest,
    responses (
        (status = 200, description = "Session cookie set from a provider access token", body = SessionResponse),
        (status = 401, description = "Token rejected by the identity provider", body = ErrorBody),
        (status = 409, description = "Email already bound to another account", body = ErrorBody),
        (status = 503, description = "Identity provider or store unavailable", body = ErrorBody),
    ),
    tag = "sso",
)]
#[instrument(skip_all)]
pub async fn set_session(
    state: Extension<Arc<AppState>>,
    payload: Json<SetSessionRequest>,
) -> Result<Response, GateError> {
    let access_token = payload.access_token.trim();
    if access_token.is_empty() {
        return Err(GateError::Unauthenticated);
    }
    let user = state.provider().fetch_user(access_token).await?;
    let identity = establish_session(&state, user).await?;
    session_response(&state, &identity)
}

#[utoipa::path(
    get,
    path= "/sso/redirect-to-role",
    responses (
        (status = 302, description = "To the caller's section, or to the login page"),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "sso",
)]
pub async fn redirect_to_role(state: Extension<Arc<AppState>>, headers: HeaderMap) -> Response {
    role_redirect(&state, &headers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn envelope_serializes_signed_out_as_null() -> Result<()> {
        let body = serde_json::to_value(SessionEnvelope { session: None })?;
        assert_eq!(body, json!({ "session": null }));
        Ok(())
    }

    #[test]
    fn envelope_carries_user_and_expiry() -> Result<()> {
        let id = Uuid::new_v4();
        let expires_at = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("invalid timestamp"))?;
        let envelope = SessionEnvelope {
            session: Some(ValidatedSession {
                user: Identity {
                    id,
                    email: "member@example.com".to_string(),
                    role: Role::Member,
                    nickname: None,
                },
                expires_at,
            }),
        };
        let body = serde_json::to_value(&envelope)?;
        assert_eq!(body["session"]["user"]["role"], "Member");
        assert_eq!(body["session"]["user"]["id"], id.to_string());
        assert_eq!(body["session"]["expires_at"], "2023-11-14T22:13:20Z");
        Ok(())
    }
}
