//! Roles and the role to destination mapping.
//!
//! Every signed-in user holds exactly one [`Role`]. Each role owns a site
//! section: in subdirectory mode that is a path prefix (`/fan`, `/member`, ...),
//! in the legacy subdomain mode it is a host (`fan.baidaohui.com`, ...). Both
//! layouts go through [`RoutingMode`] so callers never branch on the layout
//! themselves.
//!
//! Unknown or missing role claims always resolve to [`Role::Fan`], the least
//! privileged role.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum Role {
    #[default]
    Fan,
    Member,
    Master,
    Firstmate,
    Seller,
}

pub const ALL_ROLES: [Role; 5] = [
    Role::Fan,
    Role::Member,
    Role::Master,
    Role::Firstmate,
    Role::Seller,
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fan => "Fan",
            Self::Member => "Member",
            Self::Master => "Master",
            Self::Firstmate => "Firstmate",
            Self::Seller => "Seller",
        }
    }

    /// Lenient parse used for claims coming from tokens or provider metadata.
    #[must_use]
    pub fn from_claim(claim: Option<&str>) -> Self {
        claim
            .and_then(|value| value.parse::<Self>().ok())
            .unwrap_or_default()
    }

    /// Fan 0, Member/Seller 1, Master/Firstmate 2.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Fan => 0,
            Self::Member | Self::Seller => 1,
            Self::Master | Self::Firstmate => 2,
        }
    }

    #[must_use]
    pub const fn is_staff(self) -> bool {
        matches!(self, Self::Master | Self::Firstmate)
    }

    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Fan => "/fan",
            Self::Member => "/member",
            Self::Master => "/master",
            Self::Firstmate => "/firstmate",
            Self::Seller => "/seller",
        }
    }

    #[must_use]
    pub const fn subdomain_label(self) -> &'static str {
        match self {
            Self::Fan => "fan",
            Self::Member => "member",
            Self::Master => "master",
            Self::Firstmate => "firstmate",
            Self::Seller => "seller",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fan" => Ok(Self::Fan),
            "member" => Ok(Self::Member),
            "master" => Ok(Self::Master),
            "firstmate" => Ok(Self::Firstmate),
            "seller" => Ok(Self::Seller),
            _ => Err(UnknownRole(value.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base path for a raw role claim. Unknown claims map to the Fan path.
#[must_use]
pub fn role_path(claim: &str) -> &'static str {
    Role::from_claim(Some(claim)).path()
}

/// True when `path` is `prefix` itself or lies below it (`/fan`, `/fan/x`, not `/fanclub`).
/// The section segment is matched ignoring ASCII case.
#[must_use]
pub fn path_within(prefix: &str, path: &str) -> bool {
    let (Some(head), Some(rest)) = (path.get(..prefix.len()), path.get(prefix.len()..)) else {
        return false;
    };
    head.eq_ignore_ascii_case(prefix) && (rest.is_empty() || rest.starts_with('/'))
}

/// Everything but unreserved characters, sub-delims, `:`, `@` and `/` is
/// escaped, so any request path reaches its encoded form in one redirect.
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b':')
    .remove(b'@')
    .remove(b'/');

/// Decoded path the way the static file service resolves it: percent escapes
/// decoded, empty and `.` segments dropped, a trailing slash kept.
///
/// Returns `None` for `..` segments and for escapes that are not UTF-8.
#[must_use]
pub fn canonical_path(raw: &str) -> Option<String> {
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => segments.push(other),
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if !segments.is_empty() && decoded.ends_with('/') {
        path.push('/');
    }
    Some(path)
}

/// `path` (already canonical) escaped for use in a URI or `Location` header.
#[must_use]
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ESCAPE).to_string()
}

/// The role whose section contains `path`, if any.
#[must_use]
pub fn role_for_path(path: &str) -> Option<Role> {
    ALL_ROLES
        .into_iter()
        .find(|role| path_within(role.path(), path))
}

/// Site layout. Subdomain mode is kept for deployments that have not moved to
/// path-based sections yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RoutingMode {
    #[default]
    Subdirectory,
    Subdomain {
        base_domain: String,
    },
}

impl RoutingMode {
    /// Parse the `--routing-mode` value.
    ///
    /// # Errors
    /// Returns an error for anything other than `subdirectory` or `subdomain`.
    pub fn parse(mode: &str, base_domain: &str) -> Result<Self, String> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "subdirectory" | "path" => Ok(Self::Subdirectory),
            "subdomain" | "host" => {
                let base_domain = base_domain.trim().trim_start_matches('.').to_string();
                if base_domain.is_empty() {
                    return Err("subdomain routing requires a base domain".to_string());
                }
                Ok(Self::Subdomain { base_domain })
            }
            other => Err(format!("unknown routing mode: {other}")),
        }
    }

    /// Where a user holding `role` belongs.
    #[must_use]
    pub fn destination(&self, role: Role) -> String {
        match self {
            Self::Subdirectory => role.path().to_string(),
            Self::Subdomain { base_domain } => {
                format!("https://{}.{base_domain}", role.subdomain_label())
            }
        }
    }

    #[must_use]
    pub fn login_destination(&self) -> String {
        match self {
            Self::Subdirectory => "/login".to_string(),
            Self::Subdomain { base_domain } => format!("https://{base_domain}/login"),
        }
    }

    /// The role section a request for `host` + `path` falls into.
    #[must_use]
    pub fn role_for_location(&self, host: Option<&str>, path: &str) -> Option<Role> {
        match self {
            Self::Subdirectory => role_for_path(path),
            Self::Subdomain { base_domain } => {
                let host = strip_port(host?);
                let label = host.strip_suffix(base_domain.as_str())?.strip_suffix('.')?;
                ALL_ROLES
                    .into_iter()
                    .find(|role| role.subdomain_label().eq_ignore_ascii_case(label))
            }
        }
    }

    #[must_use]
    pub fn is_on_destination(&self, role: Role, host: Option<&str>, path: &str) -> bool {
        self.role_for_location(host, path) == Some(role)
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
}
