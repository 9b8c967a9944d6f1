//! Invite tokens and their redemption.
//!
//! Staff (Master and Firstmate) mint invites. A member invite lifts a Fan to
//! Member; a seller invite grants the Seller role. Redemption is exactly once
//! per use: the counter increment, the usage record and the role change commit
//! together or not at all, and concurrent redeemers of the last use see
//! [`GateError::InviteExhausted`].

mod token;

pub use token::generate_invite_token;

use crate::{
    error::GateError,
    notify::WelcomeNotifier,
    roles::Role,
    session::Identity,
    store::{bounded, InviteStore, RedeemOutcome, UserProfile},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

pub const MEMBER_VALID_HOURS: (u32, u32) = (1, 48);
pub const MEMBER_DEFAULT_HOURS: u32 = 24;
pub const MEMBER_MAX_USES: (u32, u32) = (1, 100);
pub const MEMBER_DEFAULT_USES: u32 = 1;
pub const SELLER_VALID_HOURS: (u32, u32) = (1, 720);
pub const SELLER_DEFAULT_HOURS: u32 = 720;

const MINT_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InviteKind {
    Member,
    Seller,
}

impl InviteKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Seller => "seller",
        }
    }

    #[must_use]
    pub const fn target_role(self) -> Role {
        match self {
            Self::Member => Role::Member,
            Self::Seller => Role::Seller,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "member" => Some(Self::Member),
            "seller" => Some(Self::Seller),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Active,
    Expired,
    UsedUp,
    Deactivated,
}

impl InviteStatus {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "used_up" => Some(Self::UsedUp),
            "deactivated" => Some(Self::Deactivated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InviteUse {
    pub user_id: Uuid,
    pub previous_role: Role,
    pub used_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Invite {
    pub id: Uuid,
    pub token: String,
    pub kind: InviteKind,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub max_use: u32,
    pub used_count: u32,
    pub used_by: Vec<InviteUse>,
    pub active: bool,
    pub deactivated_reason: Option<String>,
}

impl Invite {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.used_count >= self.max_use
    }

    #[must_use]
    pub const fn remaining_uses(&self) -> u32 {
        self.max_use.saturating_sub(self.used_count)
    }

    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> InviteStatus {
        if self.is_exhausted() {
            InviteStatus::UsedUp
        } else if self.is_expired(now) {
            InviteStatus::Expired
        } else if self.active {
            InviteStatus::Active
        } else {
            InviteStatus::Deactivated
        }
    }
}

/// Role a user ends up with after redeeming an invite of `kind`, or `None`
/// when the invite would not change anything for them.
///
/// Member invites only lift lower ranked roles, so a Seller is never turned
/// into a Member. Seller invites also take Members across to Seller. Staff
/// keep their role.
#[must_use]
pub fn elevate(current: Role, kind: InviteKind) -> Option<Role> {
    let target = kind.target_role();
    let lifts = match kind {
        InviteKind::Member => current.rank() < target.rank(),
        InviteKind::Seller => current.rank() <= target.rank() && current != target,
    };
    lifts.then_some(target)
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct CreateInvite {
    #[serde(rename = "type")]
    pub kind: InviteKind,
    #[serde(default, alias = "validHours")]
    pub valid_hours: Option<u32>,
    #[serde(default, alias = "maxUses")]
    pub max_uses: Option<u32>,
}

impl CreateInvite {
    /// Resolve defaults and check ranges. Returns `(valid_hours, max_use)`.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when a value is out of range.
    pub fn resolve(&self) -> Result<(u32, u32), GateError> {
        match self.kind {
            InviteKind::Member => {
                let hours = self.valid_hours.unwrap_or(MEMBER_DEFAULT_HOURS);
                let uses = self.max_uses.unwrap_or(MEMBER_DEFAULT_USES);
                check_range("valid_hours", hours, MEMBER_VALID_HOURS)?;
                check_range("max_uses", uses, MEMBER_MAX_USES)?;
                Ok((hours, uses))
            }
            InviteKind::Seller => {
                let hours = self.valid_hours.unwrap_or(SELLER_DEFAULT_HOURS);
                check_range("valid_hours", hours, SELLER_VALID_HOURS)?;
                if self.max_uses.is_some_and(|uses| uses != 1) {
                    return Err(GateError::Validation(
                        "seller invites are single use".to_string(),
                    ));
                }
                Ok((hours, 1))
            }
        }
    }
}

fn check_range(field: &str, value: u32, (min, max): (u32, u32)) -> Result<(), GateError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(GateError::Validation(format!(
            "{field} must be between {min} and {max}"
        )))
    }
}

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct InviteFilter {
    #[serde(default, rename = "type")]
    #[param(value_type = Option<String>)]
    pub kind: Option<InviteKind>,
    #[param(value_type = Option<String>)]
    pub status: Option<InviteStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl InviteFilter {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct InvitePage {
    pub invites: Vec<Invite>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Outcome of a committed redemption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redemption {
    pub invite_id: Uuid,
    pub kind: InviteKind,
    pub previous_role: Role,
    pub new_role: Role,
    pub used_count: u32,
    pub max_use: u32,
    pub active: bool,
    pub profile: UserProfile,
}

pub struct InviteService {
    store: Arc<dyn InviteStore>,
    notifier: Arc<dyn WelcomeNotifier>,
    timeout: Duration,
}

impl InviteService {
    #[must_use]
    pub fn new(
        store: Arc<dyn InviteStore>,
        notifier: Arc<dyn WelcomeNotifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            timeout,
        }
    }

    /// Mint a new invite on behalf of a staff member.
    ///
    /// # Errors
    /// [`GateError::Forbidden`] for non-staff, [`GateError::Validation`] for
    /// out of range options, [`GateError::ServiceUnavailable`] when the store fails.
    #[instrument(skip(self, creator), fields(creator = %creator.id, kind = request.kind.as_str()))]
    pub async fn create(
        &self,
        creator: &Identity,
        request: &CreateInvite,
        now: DateTime<Utc>,
    ) -> Result<Invite, GateError> {
        if !creator.role.is_staff() {
            return Err(GateError::Forbidden);
        }
        let (hours, max_use) = request.resolve()?;

        for _ in 0..MINT_ATTEMPTS {
            let invite = Invite {
                id: Uuid::now_v7(),
                token: generate_invite_token(),
                kind: request.kind,
                created_by: creator.id,
                created_at: now,
                expires_at: now + ChronoDuration::hours(i64::from(hours)),
                max_use,
                used_count: 0,
                used_by: Vec::new(),
                active: true,
                deactivated_reason: None,
            };
            if bounded(self.timeout, "invite.insert", self.store.insert_invite(&invite)).await? {
                info!(invite = %invite.id, max_use, hours, "Invite created");
                return Ok(invite);
            }
            warn!("Invite token collision, minting again");
        }

        Err(GateError::unavailable("could not mint a unique invite token"))
    }

    /// Public lookup used before sign-in. Expired tokens are flipped inactive.
    ///
    /// # Errors
    /// [`GateError::InviteNotFound`], [`GateError::InviteExpired`],
    /// [`GateError::InviteExhausted`] or [`GateError::ServiceUnavailable`].
    pub async fn inspect(&self, token: &str, now: DateTime<Utc>) -> Result<Invite, GateError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GateError::InviteNotFound);
        }
        let invite = bounded(self.timeout, "invite.find", self.store.find_invite(token))
            .await?
            .ok_or(GateError::InviteNotFound)?;

        if invite.is_expired(now) {
            if invite.active {
                if let Err(err) =
                    bounded(self.timeout, "invite.expire", self.store.expire_invite(token, now))
                        .await
                {
                    warn!("Failed to deactivate expired invite: {err}");
                }
            }
            return Err(GateError::InviteExpired);
        }
        if invite.is_exhausted() {
            return Err(GateError::InviteExhausted);
        }
        if !invite.active {
            return Err(GateError::InviteNotFound);
        }
        Ok(invite)
    }

    /// Redeem `token` for the signed-in `identity`. Never retried: a timeout
    /// surfaces as [`GateError::ServiceUnavailable`].
    ///
    /// # Errors
    /// [`GateError::InviteNotFound`], [`GateError::InviteExpired`],
    /// [`GateError::InviteExhausted`], [`GateError::AlreadyActiveRole`],
    /// [`GateError::Unauthenticated`] when the profile is gone, or
    /// [`GateError::ServiceUnavailable`].
    #[instrument(skip(self, token, identity), fields(user = %identity.id))]
    pub async fn redeem(
        &self,
        token: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Redemption, GateError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GateError::InviteNotFound);
        }

        let outcome = bounded(
            self.timeout,
            "invite.redeem",
            self.store.redeem_invite(token, identity.id, now, elevate),
        )
        .await?;

        let redemption = match outcome {
            RedeemOutcome::Redeemed(redemption) => redemption,
            RedeemOutcome::NotFound => return Err(GateError::InviteNotFound),
            RedeemOutcome::Expired => return Err(GateError::InviteExpired),
            RedeemOutcome::Exhausted => return Err(GateError::InviteExhausted),
            RedeemOutcome::NotEligible(role) => return Err(GateError::AlreadyActiveRole(role)),
            RedeemOutcome::UnknownUser => return Err(GateError::Unauthenticated),
        };

        info!(
            invite = %redemption.invite_id,
            from = %redemption.previous_role,
            to = %redemption.new_role,
            used = redemption.used_count,
            max = redemption.max_use,
            "Invite redeemed"
        );

        // The role change is committed; a failed notification is only logged.
        let user = Identity::from(&redemption.profile);
        if let Err(err) = self.notifier.role_granted(&user, redemption.new_role).await {
            warn!("Welcome notification failed: {err:#}");
        }

        Ok(redemption)
    }

    /// # Errors
    /// [`GateError::Forbidden`] for non-staff or [`GateError::ServiceUnavailable`].
    pub async fn list(
        &self,
        viewer: &Identity,
        filter: &InviteFilter,
        now: DateTime<Utc>,
    ) -> Result<InvitePage, GateError> {
        if !viewer.role.is_staff() {
            return Err(GateError::Forbidden);
        }
        bounded(
            self.timeout,
            "invite.list",
            self.store.list_invites(filter, now),
        )
        .await
    }

    /// # Errors
    /// [`GateError::Forbidden`] for non-staff, [`GateError::InviteNotFound`] for
    /// an unknown id, or [`GateError::ServiceUnavailable`].
    pub async fn deactivate(&self, viewer: &Identity, id: Uuid) -> Result<(), GateError> {
        if !viewer.role.is_staff() {
            return Err(GateError::Forbidden);
        }
        let found = bounded(
            self.timeout,
            "invite.deactivate",
            self.store.deactivate_invite(id, "deactivated"),
        )
        .await?;
        if found {
            info!(invite = %id, by = %viewer.id, "Invite deactivated");
            Ok(())
        } else {
            Err(GateError::InviteNotFound)
        }
    }

    /// Flip every expired, still active invite to inactive.
    ///
    /// # Errors
    /// [`GateError::ServiceUnavailable`] when the store fails.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, GateError> {
        let flipped = bounded(self.timeout, "invite.sweep", self.store.expire_all(now)).await?;
        info!(flipped, "Expired invites deactivated");
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests;
