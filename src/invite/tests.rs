//! Invite service tests against the in-memory store.

use super::*;
use crate::store::{MemoryStore, NewUser, UserStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

struct FailingNotifier {
    calls: AtomicUsize,
}

#[async_trait]
impl WelcomeNotifier for FailingNotifier {
    async fn role_granted(&self, _user: &Identity, _role: Role) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("mail worker down"))
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    service: InviteService,
    notifier: Arc<FailingNotifier>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(FailingNotifier {
        calls: AtomicUsize::new(0),
    });
    let service = InviteService::new(store.clone(), notifier.clone(), Duration::from_secs(2));
    Fixture {
        store,
        service,
        notifier,
    }
}

async fn user(store: &MemoryStore, role: Role) -> Result<Identity> {
    let id = Uuid::new_v4();
    let profile = store
        .ensure_user(&NewUser {
            id,
            email: format!("{id}@example.com"),
            role,
            nickname: None,
        })
        .await?
        .into_profile()
        .context("seed email already taken")?;
    Ok(Identity::from(&profile))
}

fn member_invite(valid_hours: u32, max_uses: u32) -> CreateInvite {
    CreateInvite {
        kind: InviteKind::Member,
        valid_hours: Some(valid_hours),
        max_uses: Some(max_uses),
    }
}

#[test]
fn elevation_rules() {
    assert_eq!(elevate(Role::Fan, InviteKind::Member), Some(Role::Member));
    assert_eq!(elevate(Role::Member, InviteKind::Member), None);
    assert_eq!(elevate(Role::Seller, InviteKind::Member), None);
    assert_eq!(elevate(Role::Master, InviteKind::Member), None);
    assert_eq!(elevate(Role::Fan, InviteKind::Seller), Some(Role::Seller));
    assert_eq!(elevate(Role::Member, InviteKind::Seller), Some(Role::Seller));
    assert_eq!(elevate(Role::Seller, InviteKind::Seller), None);
    assert_eq!(elevate(Role::Firstmate, InviteKind::Seller), None);
}

#[test]
fn create_request_ranges() {
    assert_eq!(
        CreateInvite {
            kind: InviteKind::Member,
            valid_hours: None,
            max_uses: None
        }
        .resolve(),
        Ok((24, 1))
    );
    assert!(member_invite(0, 1).resolve().is_err());
    assert!(member_invite(49, 1).resolve().is_err());
    assert!(member_invite(48, 101).resolve().is_err());
    assert_eq!(member_invite(48, 100).resolve(), Ok((48, 100)));

    let seller = CreateInvite {
        kind: InviteKind::Seller,
        valid_hours: None,
        max_uses: Some(3),
    };
    assert!(seller.resolve().is_err());
    let seller = CreateInvite {
        max_uses: None,
        ..seller
    };
    assert_eq!(seller.resolve(), Ok((720, 1)));
}

#[test]
fn create_request_accepts_camel_case() -> Result<()> {
    let request: CreateInvite =
        serde_json::from_str(r#"{"type":"member","validHours":12,"maxUses":5}"#)?;
    assert_eq!(request.kind, InviteKind::Member);
    assert_eq!(request.resolve(), Ok((12, 5)));
    Ok(())
}

#[test]
fn filter_paging_is_clamped() {
    let filter = InviteFilter {
        page: Some(0),
        limit: Some(1000),
        ..InviteFilter::default()
    };
    assert_eq!(filter.page(), 1);
    assert_eq!(filter.limit(), InviteFilter::MAX_LIMIT);
    assert_eq!(filter.offset(), 0);
    let filter = InviteFilter {
        page: Some(3),
        limit: Some(10),
        ..InviteFilter::default()
    };
    assert_eq!(filter.offset(), 20);
}

#[tokio::test]
async fn only_staff_create_invites() -> Result<()> {
    let f = fixture();
    let fan = user(&f.store, Role::Fan).await?;
    let seller = user(&f.store, Role::Seller).await?;
    let firstmate = user(&f.store, Role::Firstmate).await?;
    let now = Utc::now();

    assert_eq!(
        f.service.create(&fan, &member_invite(24, 1), now).await,
        Err(GateError::Forbidden)
    );
    assert_eq!(
        f.service.create(&seller, &member_invite(24, 1), now).await,
        Err(GateError::Forbidden)
    );
    let invite = f
        .service
        .create(&firstmate, &member_invite(24, 1), now)
        .await?;
    assert_eq!(invite.created_by, firstmate.id);
    assert_eq!(invite.expires_at - invite.created_at, ChronoDuration::hours(24));
    Ok(())
}

#[tokio::test]
async fn master_invite_with_three_uses() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let now = Utc::now();
    let invite = f.service.create(&master, &member_invite(24, 3), now).await?;

    let mut fans = Vec::new();
    for _ in 0..4 {
        fans.push(user(&f.store, Role::Fan).await?);
    }

    for fan in &fans[..3] {
        let redemption = f.service.redeem(&invite.token, fan, now).await?;
        assert_eq!(redemption.previous_role, Role::Fan);
        assert_eq!(redemption.new_role, Role::Member);
    }
    assert_eq!(
        f.service.redeem(&invite.token, &fans[3], now).await,
        Err(GateError::InviteExhausted)
    );

    let stored = f
        .store
        .find_invite(&invite.token)
        .await?
        .ok_or_else(|| anyhow!("invite vanished"))?;
    assert_eq!(stored.used_count, 3);
    assert!(!stored.active);
    assert_eq!(
        stored.used_by.iter().map(|u| u.user_id).collect::<Vec<_>>(),
        fans[..3].iter().map(|fan| fan.id).collect::<Vec<_>>()
    );
    for fan in &fans[..3] {
        let profile = f.store.find_user(fan.id).await?;
        assert_eq!(profile.map(|p| p.role), Some(Role::Member));
    }
    let last = f.store.find_user(fans[3].id).await?;
    assert_eq!(last.map(|p| p.role), Some(Role::Fan));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redeemers_of_single_use_invite() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let now = Utc::now();
    let invite = f.service.create(&master, &member_invite(24, 1), now).await?;
    let service = Arc::new(f.service);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let fan = user(&f.store, Role::Fan).await?;
        let service = service.clone();
        let token = invite.token.clone();
        handles.push(tokio::spawn(async move {
            service.redeem(&token, &fan, now).await
        }));
    }

    let mut successes = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => successes += 1,
            Err(GateError::InviteExhausted) => exhausted += 1,
            Err(other) => return Err(anyhow!("unexpected outcome: {other}")),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(exhausted, 15);
    Ok(())
}

#[tokio::test]
async fn expired_invite_is_rejected_and_deactivated() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let fan = user(&f.store, Role::Fan).await?;
    let created = Utc::now();
    let invite = f.service.create(&master, &member_invite(1, 5), created).await?;
    let later = created + ChronoDuration::hours(2);

    assert_eq!(
        f.service.redeem(&invite.token, &fan, later).await,
        Err(GateError::InviteExpired)
    );
    let stored = f.store.find_invite(&invite.token).await?;
    assert_eq!(stored.as_ref().map(|i| i.active), Some(false));
    assert_eq!(stored.map(|i| i.used_count), Some(0));
    assert_eq!(
        f.store.find_user(fan.id).await?.map(|p| p.role),
        Some(Role::Fan)
    );
    Ok(())
}

#[tokio::test]
async fn already_member_conflicts_without_consuming() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let member = user(&f.store, Role::Member).await?;
    let now = Utc::now();
    let invite = f.service.create(&master, &member_invite(24, 2), now).await?;

    assert_eq!(
        f.service.redeem(&invite.token, &member, now).await,
        Err(GateError::AlreadyActiveRole(Role::Member))
    );
    let stored = f.store.find_invite(&invite.token).await?;
    assert_eq!(stored.map(|i| i.used_count), Some(0));
    Ok(())
}

#[tokio::test]
async fn unknown_and_revoked_tokens_are_not_found() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let fan = user(&f.store, Role::Fan).await?;
    let now = Utc::now();

    assert_eq!(
        f.service.redeem("nope", &fan, now).await,
        Err(GateError::InviteNotFound)
    );
    assert_eq!(
        f.service.redeem("  ", &fan, now).await,
        Err(GateError::InviteNotFound)
    );

    let invite = f.service.create(&master, &member_invite(24, 1), now).await?;
    f.service.deactivate(&master, invite.id).await?;
    assert_eq!(
        f.service.redeem(&invite.token, &fan, now).await,
        Err(GateError::InviteNotFound)
    );
    assert_eq!(
        f.service.deactivate(&master, Uuid::new_v4()).await,
        Err(GateError::InviteNotFound)
    );
    assert_eq!(
        f.service.deactivate(&fan, invite.id).await,
        Err(GateError::Forbidden)
    );
    Ok(())
}

#[tokio::test]
async fn notification_failure_keeps_the_grant() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let fan = user(&f.store, Role::Fan).await?;
    let now = Utc::now();
    let invite = f
        .service
        .create(
            &master,
            &CreateInvite {
                kind: InviteKind::Seller,
                valid_hours: None,
                max_uses: None,
            },
            now,
        )
        .await?;

    let redemption = f.service.redeem(&invite.token, &fan, now).await?;
    assert_eq!(redemption.new_role, Role::Seller);
    assert!(!redemption.active);
    assert_eq!(f.notifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        f.store.find_user(fan.id).await?.map(|p| p.role),
        Some(Role::Seller)
    );
    Ok(())
}

#[tokio::test]
async fn inspect_reports_availability() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let fan = user(&f.store, Role::Fan).await?;
    let now = Utc::now();
    let invite = f.service.create(&master, &member_invite(1, 1), now).await?;

    let seen = f.service.inspect(&invite.token, now).await?;
    assert_eq!(seen.remaining_uses(), 1);
    assert_eq!(seen.status(now), InviteStatus::Active);

    f.service.redeem(&invite.token, &fan, now).await?;
    assert_eq!(
        f.service.inspect(&invite.token, now).await,
        Err(GateError::InviteExhausted)
    );

    let other = f.service.create(&master, &member_invite(1, 1), now).await?;
    let later = now + ChronoDuration::hours(1);
    assert_eq!(
        f.service.inspect(&other.token, later).await,
        Err(GateError::InviteExpired)
    );
    let stored = f.store.find_invite(&other.token).await?;
    assert_eq!(stored.map(|i| i.active), Some(false));
    Ok(())
}

#[tokio::test]
async fn list_filters_by_status_and_kind() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let fan = user(&f.store, Role::Fan).await?;
    let now = Utc::now();

    let used = f.service.create(&master, &member_invite(24, 1), now).await?;
    f.service.redeem(&used.token, &fan, now).await?;
    f.service.create(&master, &member_invite(24, 1), now).await?;
    f.service
        .create(
            &master,
            &CreateInvite {
                kind: InviteKind::Seller,
                valid_hours: Some(1),
                max_uses: None,
            },
            now,
        )
        .await?;

    let all = f.service.list(&master, &InviteFilter::default(), now).await?;
    assert_eq!(all.total, 3);

    let used_up = InviteFilter {
        status: Some(InviteStatus::UsedUp),
        ..InviteFilter::default()
    };
    let page = f.service.list(&master, &used_up, now).await?;
    assert_eq!(page.total, 1);
    assert_eq!(page.invites[0].token, used.token);
    assert_eq!(page.invites[0].used_by.len(), 1);

    let sellers = InviteFilter {
        kind: Some(InviteKind::Seller),
        ..InviteFilter::default()
    };
    assert_eq!(f.service.list(&master, &sellers, now).await?.total, 1);

    let expired = InviteFilter {
        status: Some(InviteStatus::Expired),
        ..InviteFilter::default()
    };
    let later = now + ChronoDuration::hours(2);
    assert_eq!(f.service.list(&master, &expired, later).await?.total, 1);

    assert!(matches!(
        f.service.list(&fan, &InviteFilter::default(), now).await,
        Err(GateError::Forbidden)
    ));
    Ok(())
}

#[tokio::test]
async fn sweep_flips_only_expired_invites() -> Result<()> {
    let f = fixture();
    let master = user(&f.store, Role::Master).await?;
    let now = Utc::now();
    let short = f.service.create(&master, &member_invite(1, 1), now).await?;
    let long = f.service.create(&master, &member_invite(48, 1), now).await?;

    let later = now + ChronoDuration::hours(3);
    assert_eq!(f.service.sweep_expired(later).await?, 1);
    assert_eq!(f.service.sweep_expired(later).await?, 0);

    let short = f.store.find_invite(&short.token).await?;
    let long = f.store.find_invite(&long.token).await?;
    assert_eq!(short.map(|i| i.active), Some(false));
    assert_eq!(long.map(|i| i.active), Some(true));
    Ok(())
}
