//! Session validation.
//!
//! A session is a signed token held by the browser (cookie) or an API client
//! (bearer header). The token only proves who the caller is: role and
//! nickname always come from the stored profile, so a role change takes
//! effect on the next request even while an older token is still in use.
//!
//! Validation is read-only and distinguishes a caller without a usable
//! session ([`GateError::Unauthenticated`]) from a backing store that could
//! not answer in time ([`GateError::ServiceUnavailable`]).

pub mod cookie;
mod token;

pub use token::{IssuedSession, SessionClaims, SessionSigner, TokenError};

use crate::{
    error::GateError,
    roles::Role,
    store::{bounded, UserProfile, UserStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// The signed-in user as seen by handlers and the route guard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub nickname: Option<String>,
}

impl From<&UserProfile> for Identity {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: profile.id,
            email: profile.email.clone(),
            role: profile.role,
            nickname: profile.nickname.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct ValidatedSession {
    pub user: Identity,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn resolve(&self, token: Option<&str>) -> Result<ValidatedSession, GateError>;
}

pub struct SessionValidator {
    signer: Arc<SessionSigner>,
    users: Arc<dyn UserStore>,
    timeout: Duration,
}

impl SessionValidator {
    #[must_use]
    pub fn new(signer: Arc<SessionSigner>, users: Arc<dyn UserStore>, timeout: Duration) -> Self {
        Self {
            signer,
            users,
            timeout,
        }
    }

    /// # Errors
    /// [`GateError::Unauthenticated`] for a missing, invalid or expired token
    /// or a deleted profile; [`GateError::ServiceUnavailable`] when the
    /// profile lookup fails twice.
    #[instrument(skip_all)]
    pub async fn validate(&self, token: Option<&str>) -> Result<ValidatedSession, GateError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(GateError::Unauthenticated)?;

        let claims = self.signer.verify(token, Utc::now()).map_err(|err| {
            debug!("Rejecting session token: {err}");
            GateError::Unauthenticated
        })?;

        let profile = self
            .load_profile(claims.sub)
            .await?
            .ok_or(GateError::Unauthenticated)?;
        if claims.role() != profile.role {
            debug!(
                user = %profile.id,
                claimed = %claims.role(),
                stored = %profile.role,
                "Stale role claim in session token"
            );
        }
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(GateError::Unauthenticated)?;

        Ok(ValidatedSession {
            user: Identity::from(&profile),
            expires_at,
        })
    }

    /// Profile lookup with a single retry. Reads are idempotent.
    async fn load_profile(&self, id: Uuid) -> Result<Option<UserProfile>, GateError> {
        match bounded(self.timeout, "session.profile", self.users.find_user(id)).await {
            Err(GateError::ServiceUnavailable(reason)) => {
                debug!("Retrying profile lookup after: {reason}");
                bounded(self.timeout, "session.profile", self.users.find_user(id)).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl SessionSource for SessionValidator {
    async fn resolve(&self, token: Option<&str>) -> Result<ValidatedSession, GateError> {
        self.validate(token).await
    }
}
