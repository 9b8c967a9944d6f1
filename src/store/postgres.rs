use super::{
    Elevation, EnsureOutcome, InviteStore, NewUser, NicknameUpdate, RedeemOutcome, UserProfile,
    UserStore,
};
use crate::{
    invite::{
        Invite, InviteFilter, InviteKind, InvitePage, InviteStatus, InviteUse, Redemption,
    },
    roles::Role,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Connection, PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use tracing::{info_span, Instrument};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const EMAIL_CONSTRAINT: &str = "profiles_email_key";

const PROFILE_COLUMNS: &str = "id, email, role, nickname, created_at, updated_at";
const INVITE_COLUMNS: &str = "id, token, kind, created_by, created_at, expires_at, max_use, used_count, active, deactivated_reason";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create missing tables and indexes from `sql/schema.sql`.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn apply_schema(&self) -> Result<()> {
        for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DDL",
                db.statement = statement.as_str()
            );
            sqlx::query(statement)
                .execute(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
        }
        Ok(())
    }

    async fn load_uses(&self, invite_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<InviteUse>>> {
        let mut uses: HashMap<Uuid, Vec<InviteUse>> = HashMap::new();
        if invite_ids.is_empty() {
            return Ok(uses);
        }

        let query = r"
            SELECT invite_id, user_id, previous_role, used_at
            FROM invite_uses
            WHERE invite_id = ANY($1)
            ORDER BY used_at, id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(invite_ids)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load invite uses")?;

        for row in rows {
            let invite_id: Uuid = row.try_get("invite_id")?;
            let previous_role: String = row.try_get("previous_role")?;
            uses.entry(invite_id).or_default().push(InviteUse {
                user_id: row.try_get("user_id")?,
                previous_role: Role::from_claim(Some(&previous_role)),
                used_at: row.try_get("used_at")?,
            });
        }
        Ok(uses)
    }
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_error) => db_error.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_error) => {
            is_unique_violation(err) && db_error.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile> {
    let role: String = row.try_get("role")?;
    Ok(UserProfile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        role: Role::from_claim(Some(&role)),
        nickname: row.try_get("nickname")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn invite_from_row(row: &PgRow) -> Result<Invite> {
    let kind: String = row.try_get("kind")?;
    let max_use: i32 = row.try_get("max_use")?;
    let used_count: i32 = row.try_get("used_count")?;
    Ok(Invite {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        kind: InviteKind::parse(&kind).ok_or_else(|| anyhow!("unknown invite kind: {kind}"))?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        max_use: u32::try_from(max_use).context("negative max_use")?,
        used_count: u32::try_from(used_count).context("negative used_count")?,
        used_by: Vec::new(),
        active: row.try_get("active")?,
        deactivated_reason: row.try_get("deactivated_reason")?,
    })
}

fn push_filters<'args>(
    builder: &mut QueryBuilder<'args, Postgres>,
    filter: &InviteFilter,
    now: DateTime<Utc>,
) {
    builder.push(" WHERE TRUE");
    if let Some(kind) = filter.kind {
        builder.push(" AND kind = ").push_bind(kind.as_str());
    }
    match filter.status {
        Some(InviteStatus::Active) => {
            builder
                .push(" AND active AND used_count < max_use AND expires_at > ")
                .push_bind(now);
        }
        Some(InviteStatus::Expired) => {
            builder
                .push(" AND used_count < max_use AND expires_at <= ")
                .push_bind(now);
        }
        Some(InviteStatus::UsedUp) => {
            builder.push(" AND used_count >= max_use");
        }
        Some(InviteStatus::Deactivated) => {
            builder
                .push(" AND NOT active AND used_count < max_use AND expires_at > ")
                .push_bind(now);
        }
        None => {}
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn ping(&self) -> Result<()> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load profile")?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn ensure_user(&self, user: &NewUser) -> Result<EnsureOutcome> {
        if let Some(existing) = self.find_user(user.id).await? {
            return Ok(EnsureOutcome::Ready(existing));
        }

        let query = r"
            INSERT INTO profiles (id, email, role, nickname)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
        ";
        let mut nickname = user.nickname.as_deref();
        loop {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(user.id)
                .bind(&user.email)
                .bind(user.role.as_str())
                .bind(nickname)
                .execute(&self.pool)
                .instrument(span)
                .await;
            match result {
                Ok(_) => break,
                Err(err) if violates(&err, EMAIL_CONSTRAINT) => {
                    return Ok(EnsureOutcome::EmailTaken);
                }
                // Provider nickname already taken: sign in without one.
                Err(err) if nickname.is_some() && is_unique_violation(&err) => nickname = None,
                Err(err) => return Err(err).context("failed to create profile"),
            }
        }

        self.find_user(user.id)
            .await?
            .map(EnsureOutcome::Ready)
            .ok_or_else(|| anyhow!("profile {} missing after insert", user.id))
    }

    async fn nickname_taken(&self, nickname: &str, except: Option<Uuid>) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM profiles
                WHERE nickname = $1 AND ($2::uuid IS NULL OR id <> $2)
            )
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(nickname)
            .bind(except)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check nickname")?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn update_nickname(&self, id: Uuid, nickname: &str) -> Result<NicknameUpdate> {
        let query = format!(
            "UPDATE profiles SET nickname = $2, updated_at = NOW() WHERE id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(nickname)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await;
        match result {
            Ok(Some(row)) => Ok(NicknameUpdate::Updated(profile_from_row(&row)?)),
            Ok(None) => Ok(NicknameUpdate::NotFound),
            Err(err) if is_unique_violation(&err) => Ok(NicknameUpdate::Conflict),
            Err(err) => Err(err).context("failed to update nickname"),
        }
    }

    async fn set_role(&self, id: Uuid, role: Role) -> Result<Option<UserProfile>> {
        let query = format!(
            "UPDATE profiles SET role = $2, updated_at = NOW() WHERE id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to update role")?;
        row.as_ref().map(profile_from_row).transpose()
    }
}

#[async_trait]
impl InviteStore for PgStore {
    async fn insert_invite(&self, invite: &Invite) -> Result<bool> {
        let query = r"
            INSERT INTO invites
                (id, token, kind, created_by, created_at, expires_at, max_use, used_count, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (token) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(invite.id)
            .bind(&invite.token)
            .bind(invite.kind.as_str())
            .bind(invite.created_by)
            .bind(invite.created_at)
            .bind(invite.expires_at)
            .bind(i32::try_from(invite.max_use).context("max_use out of range")?)
            .bind(i32::try_from(invite.used_count).context("used_count out of range")?)
            .bind(invite.active)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert invite")?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_invite(&self, token: &str) -> Result<Option<Invite>> {
        let query = format!("SELECT {INVITE_COLUMNS} FROM invites WHERE token = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load invite")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut invite = invite_from_row(&row)?;
        invite.used_by = self
            .load_uses(&[invite.id])
            .await?
            .remove(&invite.id)
            .unwrap_or_default();
        Ok(Some(invite))
    }

    async fn list_invites(&self, filter: &InviteFilter, now: DateTime<Utc>) -> Result<InvitePage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM invites");
        push_filters(&mut count, filter, now);
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = count.sql()
        );
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to count invites")?
            .try_get(0)?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {INVITE_COLUMNS} FROM invites"));
        push_filters(&mut select, filter, now);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.limit()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset()).context("offset out of range")?);
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = select.sql()
        );
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list invites")?;

        let mut invites = rows
            .iter()
            .map(invite_from_row)
            .collect::<Result<Vec<_>>>()?;
        let ids: Vec<Uuid> = invites.iter().map(|invite| invite.id).collect();
        let mut uses = self.load_uses(&ids).await?;
        for invite in &mut invites {
            invite.used_by = uses.remove(&invite.id).unwrap_or_default();
        }

        Ok(InvitePage {
            invites,
            total: u64::try_from(total).unwrap_or_default(),
            page: filter.page(),
            limit: filter.limit(),
        })
    }

    async fn deactivate_invite(&self, id: Uuid, reason: &str) -> Result<bool> {
        let query = r"
            UPDATE invites
            SET active = FALSE, deactivated_reason = COALESCE(deactivated_reason, $2)
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to deactivate invite")?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_invite(&self, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let query = r"
            UPDATE invites
            SET active = FALSE, deactivated_reason = 'expired'
            WHERE token = $1 AND active AND expires_at <= $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to expire invite")?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_all(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = r"
            UPDATE invites
            SET active = FALSE, deactivated_reason = 'expired'
            WHERE active AND expires_at <= $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to expire invites")?;
        Ok(result.rows_affected())
    }

    async fn redeem_invite(
        &self,
        token: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
        elevate: Elevation,
    ) -> Result<RedeemOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin redeem transaction")?;

        // The row lock serializes concurrent redeemers of the same token.
        let query = format!("SELECT {INVITE_COLUMNS} FROM invites WHERE token = $1 FOR UPDATE");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(token)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock invite")?;
        let Some(row) = row else {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::NotFound);
        };
        let invite = invite_from_row(&row)?;

        if invite.is_expired(now) {
            if invite.active {
                let query = "UPDATE invites SET active = FALSE, deactivated_reason = 'expired' WHERE id = $1";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(invite.id)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to expire invite")?;
            }
            tx.commit().await.context("failed to commit expiry")?;
            return Ok(RedeemOutcome::Expired);
        }
        if invite.is_exhausted() {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::Exhausted);
        }
        if !invite.active {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::NotFound);
        }

        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1 FOR UPDATE");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock profile")?;
        let Some(row) = row else {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::UnknownUser);
        };
        let previous_role = profile_from_row(&row)?.role;
        let Some(new_role) = elevate(previous_role, invite.kind) else {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::NotEligible(previous_role));
        };

        let query = r"
            UPDATE invites
            SET used_count = used_count + 1,
                active = (used_count + 1 < max_use),
                deactivated_reason = CASE
                    WHEN used_count + 1 >= max_use THEN 'used_up'
                    ELSE deactivated_reason
                END
            WHERE id = $1 AND active AND expires_at > $2 AND used_count < max_use
            RETURNING used_count, max_use, active
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let counter = sqlx::query(query)
            .bind(invite.id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to increment invite usage")?;
        let Some(counter) = counter else {
            tx.rollback().await.context("failed to rollback")?;
            return Ok(RedeemOutcome::Exhausted);
        };
        let used_count: i32 = counter.try_get("used_count")?;
        let max_use: i32 = counter.try_get("max_use")?;
        let active: bool = counter.try_get("active")?;

        let query = r"
            INSERT INTO invite_uses (id, invite_id, user_id, previous_role, used_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(Uuid::now_v7())
            .bind(invite.id)
            .bind(user_id)
            .bind(previous_role.as_str())
            .bind(now)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to record invite use")?;

        let query = format!(
            "UPDATE profiles SET role = $2, updated_at = $3 WHERE id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(new_role.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to update role")?;
        let profile = profile_from_row(&row)?;

        tx.commit().await.context("failed to commit redemption")?;

        Ok(RedeemOutcome::Redeemed(Redemption {
            invite_id: invite.id,
            kind: invite.kind,
            previous_role,
            new_role,
            used_count: u32::try_from(used_count).context("negative used_count")?,
            max_use: u32::try_from(max_use).context("negative max_use")?,
            active,
            profile,
        }))
    }
}
