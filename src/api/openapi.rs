use crate::{
    api::handlers::{auth, health, invite, profile, sso},
    error::ErrorBody,
    invite::{CreateInvite, Invite, InviteKind, InvitePage, InviteStatus, InviteUse},
    roles::Role,
    session::{Identity, ValidatedSession},
    store::UserProfile,
};
use utoipa::{
    openapi::{Contact, Info, InfoBuilder, License},
    OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::callback,
        auth::logout,
        auth::refresh,
        sso::session,
        sso::validate,
        sso::set_session,
        sso::redirect_to_role,
        invite::generate,
        invite::validate,
        invite::consume,
        invite::list,
        invite::deactivate,
        profile::check_nickname,
        profile::update_nickname,
        profile::set_role,
    ),
    components(schemas(
        ErrorBody,
        Role,
        Identity,
        ValidatedSession,
        UserProfile,
        Invite,
        InviteKind,
        InviteStatus,
        InviteUse,
        InvitePage,
        CreateInvite,
        health::Health,
        auth::CallbackRequest,
        auth::SessionResponse,
        sso::SessionEnvelope,
        sso::ValidateRequest,
        sso::ValidateResponse,
        sso::SetSessionRequest,
        invite::GeneratedInvite,
        invite::InviteSummary,
        invite::ConsumeResponse,
        profile::NicknameCheck,
        profile::NicknameRequest,
        profile::UserResponse,
        profile::RoleRequest,
    )),
    tags(
        (name = "auth", description = "Sign-in, sign-out and session refresh"),
        (name = "sso", description = "Session checks for the role sections"),
        (name = "invite", description = "Member and seller invites"),
        (name = "profile", description = "Nicknames and role administration"),
        (name = "health", description = "Store connectivity"),
    )
)]
struct ApiDoc;

/// The `OpenAPI` document served under `/api-docs/openapi.json`.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.info = cargo_info();
    doc
}

fn cargo_info() -> Info {
    // Cargo.toml metadata instead of utoipa's crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();
    info
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (
            optional_str(name),
            optional_str(email.trim_end_matches('>')),
        ),
        None => (optional_str(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_with_email() {
        assert_eq!(
            parse_author("Baidaohui Team <dev@baidaohui.com>"),
            (Some("Baidaohui Team"), Some("dev@baidaohui.com"))
        );
        assert_eq!(parse_author("solo"), (Some("solo"), None));
        assert_eq!(parse_author("  "), (None, None));
    }

    #[test]
    fn document_lists_gateway_paths() {
        let doc = openapi();
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        for path in [
            "/auth/callback",
            "/sso/validate",
            "/invite/consume/{token}",
            "/profile/nickname",
            "/admin/users/{id}/role",
            "/health",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
