//! Error taxonomy shared by the session, guard and invite layers.

use crate::roles::Role;
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("role {actual} may not access this location")]
    WrongRole { actual: Role, redirect_to: String },
    #[error("upstream service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invite not found")]
    InviteNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("invite expired")]
    InviteExpired,
    #[error("invite has no uses left")]
    InviteExhausted,
    #[error("role {0} is already active")]
    AlreadyActiveRole(Role),
    #[error("nickname already taken")]
    NicknameConflict,
    #[error("email already bound to another account")]
    EmailConflict,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    Validation(String),
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl GateError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::WrongRole { .. } | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InviteNotFound | Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::InviteExpired | Self::InviteExhausted => StatusCode::GONE,
            Self::AlreadyActiveRole(_) | Self::NicknameConflict | Self::EmailConflict => {
                StatusCode::CONFLICT
            }
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine readable code for API clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::WrongRole { .. } => "wrong_role",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InviteNotFound => "invite_not_found",
            Self::UserNotFound => "user_not_found",
            Self::InviteExpired => "invite_expired",
            Self::InviteExhausted => "invite_exhausted",
            Self::AlreadyActiveRole(_) => "already_active_role",
            Self::NicknameConflict => "nickname_conflict",
            Self::EmailConflict => "email_conflict",
            Self::Forbidden => "forbidden",
            Self::Validation(_) => "validation_error",
        }
    }

    pub fn unavailable(source: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable(source.to_string())
    }
}

impl From<&GateError> for ErrorBody {
    fn from(err: &GateError) -> Self {
        let redirect_url = match err {
            GateError::WrongRole { redirect_to, .. } => Some(redirect_to.clone()),
            _ => None,
        };
        // Upstream details stay in the logs.
        let message = match err {
            GateError::ServiceUnavailable(_) => {
                "service temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };
        Self {
            error: err.code().to_string(),
            message,
            redirect_url,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorBody::from(&self))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(GateError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GateError::InviteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(GateError::InviteExpired.status(), StatusCode::GONE);
        assert_eq!(GateError::InviteExhausted.status(), StatusCode::GONE);
        assert_eq!(
            GateError::AlreadyActiveRole(Role::Member).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(GateError::NicknameConflict.status(), StatusCode::CONFLICT);
        assert_eq!(GateError::EmailConflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            GateError::unavailable("timeout").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn unavailable_response_carries_retry_after() {
        let response = GateError::unavailable("db down").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from_static("5"))
        );
    }

    #[test]
    fn wrong_role_body_points_home() {
        let body = ErrorBody::from(&GateError::WrongRole {
            actual: Role::Fan,
            redirect_to: "/fan".to_string(),
        });
        assert_eq!(body.error, "wrong_role");
        assert_eq!(body.redirect_url.as_deref(), Some("/fan"));
        assert_eq!(ErrorBody::from(&GateError::EmailConflict).error, "email_conflict");
    }

    #[test]
    fn other_responses_have_no_retry_after() {
        let response = GateError::InviteExpired.into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
