//! # Baidaohui role gateway
//!
//! Authentication, session and role routing for the 百刀会 community site.
//! People sign in through an external OAuth identity provider; this service
//! keeps the authoritative profile (role and nickname), issues the session
//! cookie, and decides which section of the site a session may enter.
//!
//! ## Roles and sections
//!
//! Every role owns one section of the site: `/fan`, `/member`, `/master`,
//! `/firstmate` and `/seller`. The legacy deployment served the same sections
//! from `<role>.<base_domain>` subdomains; both layouts are a single
//! [`roles::RoutingMode`] value chosen at startup.
//!
//! ## Guarding navigations
//!
//! Requests for the site pass through [`guard::RouteGuard`]. A visitor without
//! a session is sent to the login page, a session in the wrong section is sent
//! to its own section, and a backing store outage answers with a retry page
//! instead of signing anyone out.
//!
//! ## Invites
//!
//! Staff (Master and Firstmate) mint invite tokens that lift a Fan to Member
//! or grant the Seller role. Redemption is atomic per token: a single use
//! invite redeemed concurrently succeeds exactly once.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod invite;
pub mod notify;
pub mod profile;
pub mod roles;
pub mod session;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{ensure, Context, Result};
    use std::{fs, path::PathBuf};

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    // Normalize SQL to avoid brittle formatting checks in schema tests.
    fn canonicalize_sql(sql: &str) -> String {
        sql.chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_lowercase())
            .collect()
    }

    #[test]
    fn schema_sql_enforces_role_and_use_limits() -> Result<()> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("sql/schema.sql");
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read SQL file at {}", path.display()))?;
        let canonical = canonicalize_sql(&sql);
        for role in roles::ALL_ROLES {
            ensure!(
                canonical.contains(&format!("'{}'", role.as_str().to_ascii_lowercase())),
                "role {role} missing from the profiles CHECK constraint"
            );
        }
        ensure!(
            canonical.contains("used_count<=max_use"),
            "invites must not allow more uses than max_use"
        );
        ensure!(
            canonical.contains("nicknametextunique"),
            "nicknames must be unique"
        );
        ensure!(
            canonical.contains("emailtextnotnullconstraintprofiles_email_keyunique"),
            "the email constraint name is matched when a sign-in hits a taken email"
        );
        Ok(())
    }
}
