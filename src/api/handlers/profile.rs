use super::{issue_session, require_session};
use crate::{
    api::AppState,
    error::{ErrorBody, GateError},
    profile::validate_nickname,
    roles::{Role, UnknownRole},
    session::Identity,
    store::{bounded, NicknameUpdate},
};
use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NicknameQuery {
    nickname: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct NicknameCheck {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct NicknameRequest {
    nickname: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UserResponse {
    pub user: Identity,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RoleRequest {
    role: String,
}

#[utoipa::path(
    get,
    path= "/profile/nickname/check",
    params(NicknameQuery),
    responses (
        (status = 200, description = "Whether the nickname can be claimed", body = NicknameCheck),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "profile",
)]
pub async fn check_nickname(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    query: Query<NicknameQuery>,
) -> Result<Json<NicknameCheck>, GateError> {
    let nickname = match validate_nickname(query.nickname.as_deref().unwrap_or_default()) {
        Ok(nickname) => nickname,
        Err(err) => {
            return Ok(Json(NicknameCheck {
                available: false,
                reason: Some(err.to_string()),
            }))
        }
    };

    // The caller's own nickname counts as available.
    let caller = match require_session(&state, &headers).await {
        Ok(identity) => Some(identity.id),
        Err(GateError::Unauthenticated) => None,
        Err(err) => return Err(err),
    };

    let taken = bounded(
        state.config().upstream_timeout(),
        "profile.nickname_taken",
        state.users().nickname_taken(&nickname, caller),
    )
    .await?;

    Ok(Json(NicknameCheck {
        available: !taken,
        reason: taken.then(|| "nickname already taken".to_string()),
    }))
}

#[utoipa::path(
    post,
    path= "/profile/nickname",
    request_body = NicknameRequest,
    responses (
        (status = 200, description = "Nickname saved, session cookie refreshed", body = UserResponse),
        (status = 400, description = "Nickname breaks the naming rules", body = ErrorBody),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 409, description = "Nickname already taken", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "profile",
)]
pub async fn update_nickname(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Json<NicknameRequest>,
) -> Result<Response, GateError> {
    let identity = require_session(&state, &headers).await?;
    let nickname = validate_nickname(&payload.nickname)?;

    let update = bounded(
        state.config().upstream_timeout(),
        "profile.update_nickname",
        state.users().update_nickname(identity.id, &nickname),
    )
    .await?;

    match update {
        NicknameUpdate::Updated(profile) => {
            let user = Identity::from(&profile);
            let (cookie_headers, _) = issue_session(&state, &user)?;
            Ok((cookie_headers, Json(UserResponse { user })).into_response())
        }
        NicknameUpdate::Conflict => Err(GateError::NicknameConflict),
        NicknameUpdate::NotFound => Err(GateError::Unauthenticated),
    }
}

#[utoipa::path(
    post,
    path= "/admin/users/{id}/role",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = RoleRequest,
    responses (
        (status = 200, description = "Role changed", body = UserResponse),
        (status = 400, description = "Unknown role", body = ErrorBody),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 403, description = "Only the Master may change roles", body = ErrorBody),
        (status = 404, description = "Unknown user", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "profile",
)]
pub async fn set_role(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Json<RoleRequest>,
) -> Result<Json<UserResponse>, GateError> {
    let admin = require_session(&state, &headers).await?;
    if admin.role != Role::Master {
        warn!(user = %admin.id, role = %admin.role, "Role change refused");
        return Err(GateError::Forbidden);
    }
    let role: Role = payload
        .role
        .parse()
        .map_err(|err: UnknownRole| GateError::Validation(err.to_string()))?;

    let profile = bounded(
        state.config().upstream_timeout(),
        "profile.set_role",
        state.users().set_role(id, role),
    )
    .await?
    .ok_or(GateError::UserNotFound)?;

    info!(user = %id, %role, by = %admin.id, "Role changed");
    Ok(Json(UserResponse {
        user: Identity::from(&profile),
    }))
}
