use super::{
    Elevation, EnsureOutcome, InviteStore, NewUser, NicknameUpdate, RedeemOutcome, UserProfile,
    UserStore,
};
use crate::{
    invite::{Invite, InviteFilter, InvitePage, InviteUse, Redemption},
    roles::Role,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, UserProfile>,
    invites: HashMap<String, Invite>,
}

impl State {
    fn nickname_owner(&self, nickname: &str) -> Option<Uuid> {
        self.users
            .values()
            .find(|user| user.nickname.as_deref() == Some(nickname))
            .map(|user| user.id)
    }
}

/// In-process store. One lock covers users and invites, so a redemption is a
/// single critical section.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile as-is. Used to seed fixtures.
    pub async fn put_user(&self, profile: UserProfile) {
        self.state.lock().await.users.insert(profile.id, profile);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn ensure_user(&self, user: &NewUser) -> Result<EnsureOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.users.get(&user.id) {
            return Ok(EnsureOutcome::Ready(existing.clone()));
        }
        if state.users.values().any(|other| other.email == user.email) {
            return Ok(EnsureOutcome::EmailTaken);
        }

        let nickname = user
            .nickname
            .clone()
            .filter(|nickname| state.nickname_owner(nickname).is_none());
        let now = Utc::now();
        let profile = UserProfile {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            nickname,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(profile.id, profile.clone());
        Ok(EnsureOutcome::Ready(profile))
    }

    async fn nickname_taken(&self, nickname: &str, except: Option<Uuid>) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .nickname_owner(nickname)
            .is_some_and(|owner| Some(owner) != except))
    }

    async fn update_nickname(&self, id: Uuid, nickname: &str) -> Result<NicknameUpdate> {
        let mut state = self.state.lock().await;
        if state
            .nickname_owner(nickname)
            .is_some_and(|owner| owner != id)
        {
            return Ok(NicknameUpdate::Conflict);
        }
        let Some(profile) = state.users.get_mut(&id) else {
            return Ok(NicknameUpdate::NotFound);
        };
        profile.nickname = Some(nickname.to_string());
        profile.updated_at = Utc::now();
        Ok(NicknameUpdate::Updated(profile.clone()))
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<Option<UserProfile>> {
        let mut state = self.state.lock().await;
        Ok(state.users.get_mut(&id).map(|profile| {
            profile.role = role;
            profile.updated_at = Utc::now();
            profile.clone()
        }))
    }
}

#[async_trait]
impl InviteStore for MemoryStore {
    async fn insert_invite(&self, invite: &Invite) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.invites.contains_key(&invite.token) {
            return Ok(false);
        }
        state.invites.insert(invite.token.clone(), invite.clone());
        Ok(true)
    }

    async fn find_invite(&self, token: &str) -> Result<Option<Invite>> {
        Ok(self.state.lock().await.invites.get(token).cloned())
    }

    async fn list_invites(&self, filter: &InviteFilter, now: DateTime<Utc>) -> Result<InvitePage> {
        let state = self.state.lock().await;
        let mut matching: Vec<Invite> = state
            .invites
            .values()
            .filter(|invite| filter.kind.map_or(true, |kind| invite.kind == kind))
            .filter(|invite| filter.status.map_or(true, |status| invite.status(now) == status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
        let limit = filter.limit() as usize;
        let invites = matching.into_iter().skip(offset).take(limit).collect();

        Ok(InvitePage {
            invites,
            total,
            page: filter.page(),
            limit: filter.limit(),
        })
    }

    async fn deactivate_invite(&self, id: Uuid, reason: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(invite) = state.invites.values_mut().find(|invite| invite.id == id) else {
            return Ok(false);
        };
        if invite.active {
            invite.active = false;
            invite.deactivated_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn expire_invite(&self, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .invites
            .get_mut(token)
            .is_some_and(|invite| expire(invite, now)))
    }

    async fn expire_all(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let flipped = state
            .invites
            .values_mut()
            .map(|invite| expire(invite, now))
            .filter(|flipped| *flipped)
            .count();
        Ok(flipped as u64)
    }

    async fn redeem_invite(
        &self,
        token: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
        elevate: Elevation,
    ) -> Result<RedeemOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(invite) = state.invites.get_mut(token) else {
            return Ok(RedeemOutcome::NotFound);
        };
        if invite.is_expired(now) {
            expire(invite, now);
            return Ok(RedeemOutcome::Expired);
        }
        if invite.is_exhausted() {
            return Ok(RedeemOutcome::Exhausted);
        }
        if !invite.active {
            return Ok(RedeemOutcome::NotFound);
        }

        let Some(profile) = state.users.get_mut(&user_id) else {
            return Ok(RedeemOutcome::UnknownUser);
        };
        let previous_role = profile.role;
        let Some(new_role) = elevate(previous_role, invite.kind) else {
            return Ok(RedeemOutcome::NotEligible(previous_role));
        };

        invite.used_count += 1;
        invite.used_by.push(InviteUse {
            user_id,
            previous_role,
            used_at: now,
        });
        if invite.is_exhausted() {
            invite.active = false;
            invite.deactivated_reason = Some("used_up".to_string());
        }
        profile.role = new_role;
        profile.updated_at = now;

        Ok(RedeemOutcome::Redeemed(Redemption {
            invite_id: invite.id,
            kind: invite.kind,
            previous_role,
            new_role,
            used_count: invite.used_count,
            max_use: invite.max_use,
            active: invite.active,
            profile: profile.clone(),
        }))
    }
}

fn expire(invite: &mut Invite, now: DateTime<Utc>) -> bool {
    if invite.active && invite.is_expired(now) {
        invite.active = false;
        invite.deactivated_reason = Some("expired".to_string());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn new_user(email: &str, nickname: Option<&str>) -> NewUser {
        NewUser {
            id: Uuid::new_v4(),
            email: email.to_string(),
            role: Role::Fan,
            nickname: nickname.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent_per_id() -> Result<()> {
        let store = MemoryStore::new();
        let user = new_user("fan@example.com", Some("刀客"));
        let first = store.ensure_user(&user).await?.into_profile().context("created")?;
        let again = store.ensure_user(&user).await?.into_profile().context("loaded")?;
        assert_eq!(first, again);
        Ok(())
    }

    #[tokio::test]
    async fn recreated_provider_account_reports_taken_email() -> Result<()> {
        let store = MemoryStore::new();
        store.ensure_user(&new_user("fan@example.com", None)).await?;

        let recreated = new_user("fan@example.com", None);
        assert_eq!(
            store.ensure_user(&recreated).await?,
            EnsureOutcome::EmailTaken
        );
        assert_eq!(store.find_user(recreated.id).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn taken_nickname_is_dropped_on_first_sign_in() -> Result<()> {
        let store = MemoryStore::new();
        store.ensure_user(&new_user("a@example.com", Some("刀客"))).await?;
        let late = store
            .ensure_user(&new_user("b@example.com", Some("刀客")))
            .await?
            .into_profile()
            .context("created")?;
        assert_eq!(late.nickname, None);
        Ok(())
    }
}
