//! Persistence seams for profiles and invites.
//!
//! [`PgStore`] backs production; [`MemoryStore`] serves tests and local runs.
//! Store methods return `anyhow::Result` and callers wrap them in [`bounded`],
//! which turns slow or failing calls into [`GateError::ServiceUnavailable`].

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    error::GateError,
    invite::{Invite, InviteFilter, InviteKind, InvitePage, Redemption},
    roles::Role,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub nickname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile data taken from the identity provider on first sign-in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub nickname: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Ready(UserProfile),
    /// Another profile already holds this email, typically after the provider
    /// account was deleted and created again.
    EmailTaken,
}

impl EnsureOutcome {
    #[must_use]
    pub fn into_profile(self) -> Option<UserProfile> {
        match self {
            Self::Ready(profile) => Some(profile),
            Self::EmailTaken => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NicknameUpdate {
    Updated(UserProfile),
    Conflict,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed(Redemption),
    NotFound,
    Expired,
    Exhausted,
    NotEligible(Role),
    UnknownUser,
}

/// Decides the role granted by an invite, see [`crate::invite::elevate`].
pub type Elevation = fn(Role, InviteKind) -> Option<Role>;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn find_user(&self, id: Uuid) -> Result<Option<UserProfile>>;

    /// Return the stored profile, creating it on first sign-in. A nickname that
    /// is already taken is dropped rather than failing the sign-in; an email
    /// bound to another profile is reported as [`EnsureOutcome::EmailTaken`].
    async fn ensure_user(&self, user: &NewUser) -> Result<EnsureOutcome>;

    async fn nickname_taken(&self, nickname: &str, except: Option<Uuid>) -> Result<bool>;

    async fn update_nickname(&self, id: Uuid, nickname: &str) -> Result<NicknameUpdate>;

    async fn set_role(&self, id: Uuid, role: Role) -> Result<Option<UserProfile>>;
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    /// Returns `false` when the token already exists.
    async fn insert_invite(&self, invite: &Invite) -> Result<bool>;

    async fn find_invite(&self, token: &str) -> Result<Option<Invite>>;

    async fn list_invites(&self, filter: &InviteFilter, now: DateTime<Utc>) -> Result<InvitePage>;

    /// Returns `false` when no invite has this id.
    async fn deactivate_invite(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// Flip a single expired, still active invite. Returns whether it flipped.
    async fn expire_invite(&self, token: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn expire_all(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Check availability, eligibility, and apply the redemption atomically.
    ///
    /// Checks run in this order: unknown token, expiry (which also flips the
    /// invite inactive), exhaustion, manual deactivation, eligibility.
    async fn redeem_invite(
        &self,
        token: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
        elevate: Elevation,
    ) -> Result<RedeemOutcome>;
}

/// Run a store call under `timeout`. Errors and timeouts both become
/// [`GateError::ServiceUnavailable`].
///
/// # Errors
/// See above.
pub async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> Result<T, GateError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!(operation, "Store call failed: {err:#}");
            Err(GateError::unavailable(format!("{operation} failed")))
        }
        Err(_) => {
            warn!(operation, ?timeout, "Store call timed out");
            Err(GateError::unavailable(format!("{operation} timed out")))
        }
    }
}
