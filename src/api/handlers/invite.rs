use super::{issue_session, require_session};
use crate::{
    api::AppState,
    error::{ErrorBody, GateError},
    invite::{CreateInvite, Invite, InviteFilter, InviteKind, InvitePage, InviteStatus},
    roles::Role,
    session::Identity,
};
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct GeneratedInvite {
    pub invite: Invite,
    pub url: String,
}

/// What an anonymous visitor may learn about an invite.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct InviteSummary {
    #[serde(rename = "type")]
    pub kind: InviteKind,
    pub status: InviteStatus,
    pub expires_at: DateTime<Utc>,
    pub remaining_uses: u32,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConsumeResponse {
    pub role: Role,
    pub previous_role: Role,
    pub redirect_url: String,
    pub user: Identity,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TokenQuery {
    token: Option<String>,
}

#[utoipa::path(
    post,
    path= "/invite/generate",
    request_body = CreateInvite,
    responses (
        (status = 201, description = "Invite created", body = GeneratedInvite),
        (status = 400, description = "Options out of range", body = ErrorBody),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 403, description = "Only staff may create invites", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "invite",
)]
pub async fn generate(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Json<CreateInvite>,
) -> Result<Response, GateError> {
    let creator = require_session(&state, &headers).await?;
    let invite = state.invites().create(&creator, &payload, Utc::now()).await?;
    let url = state.config().invite_url(&invite.token);
    Ok((StatusCode::CREATED, Json(GeneratedInvite { invite, url })).into_response())
}

#[utoipa::path(
    get,
    path= "/invite/validate",
    params(TokenQuery),
    responses (
        (status = 200, description = "Invite can be redeemed", body = InviteSummary),
        (status = 404, description = "Unknown or deactivated invite", body = ErrorBody),
        (status = 410, description = "Invite expired or used up", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "invite",
)]
pub async fn validate(
    state: Extension<Arc<AppState>>,
    query: Query<TokenQuery>,
) -> Result<Json<InviteSummary>, GateError> {
    let now = Utc::now();
    let token = query.token.as_deref().unwrap_or_default();
    let invite = state.invites().inspect(token, now).await?;
    Ok(Json(InviteSummary {
        kind: invite.kind,
        status: invite.status(now),
        expires_at: invite.expires_at,
        remaining_uses: invite.remaining_uses(),
    }))
}

#[utoipa::path(
    post,
    path= "/invite/consume/{token}",
    params(("token" = String, Path, description = "Invite token")),
    responses (
        (status = 200, description = "Role granted, session cookie refreshed", body = ConsumeResponse),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 404, description = "Unknown or deactivated invite", body = ErrorBody),
        (status = 409, description = "Role already active", body = ErrorBody),
        (status = 410, description = "Invite expired or used up", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "invite",
)]
pub async fn consume(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Response, GateError> {
    let identity = require_session(&state, &headers).await?;
    let redemption = state.invites().redeem(&token, &identity, Utc::now()).await?;

    let user = Identity::from(&redemption.profile);
    // The old cookie still names the old role.
    let (cookie_headers, _) = issue_session(&state, &user)?;
    let body = ConsumeResponse {
        role: redemption.new_role,
        previous_role: redemption.previous_role,
        redirect_url: state.config().routing_mode().destination(redemption.new_role),
        user,
    };
    Ok((cookie_headers, Json(body)).into_response())
}

#[utoipa::path(
    get,
    path= "/invite/list",
    params(InviteFilter),
    responses (
        (status = 200, description = "Page of invites", body = InvitePage),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 403, description = "Only staff may list invites", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "invite",
)]
pub async fn list(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    filter: Query<InviteFilter>,
) -> Result<Json<InvitePage>, GateError> {
    let viewer = require_session(&state, &headers).await?;
    let page = state.invites().list(&viewer, &filter, Utc::now()).await?;
    Ok(Json(page))
}

#[utoipa::path(
    post,
    path= "/invite/deactivate/{id}",
    params(("id" = Uuid, Path, description = "Invite id")),
    responses (
        (status = 204, description = "Invite deactivated"),
        (status = 401, description = "No session", body = ErrorBody),
        (status = 403, description = "Only staff may deactivate invites", body = ErrorBody),
        (status = 404, description = "Unknown invite", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody),
    ),
    tag = "invite",
)]
pub async fn deactivate(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, GateError> {
    let viewer = require_session(&state, &headers).await?;
    state.invites().deactivate(&viewer, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
