//! Per-navigation route guard.
//!
//! ```text
//! Unchecked -> Checking -> Granted
//!                       -> DeniedUnauthenticated (to the login page)
//!                       -> DeniedWrongRole       (to the caller's own section)
//!                       -> DeniedUnavailable     (retry page, session kept)
//! ```
//!
//! Locations outside every role section stay `Unchecked`. An outage never
//! produces a login redirect, and a wrong-role redirect always targets the
//! caller's own section, never the location that was asked for.

use crate::{
    error::GateError,
    roles::{Role, RoutingMode},
    session::{Identity, SessionSource},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Navigation {
    pub host: Option<String>,
    pub path: String,
    pub token: Option<String>,
}

impl Navigation {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardState {
    Unchecked,
    Checking,
    Granted(Identity),
    DeniedUnauthenticated { redirect_to: String },
    DeniedWrongRole { redirect_to: String },
    DeniedUnavailable,
}

impl GuardState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unchecked | Self::Checking)
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::Unchecked => "unchecked",
            Self::Checking => "checking",
            Self::Granted(_) => "granted",
            Self::DeniedUnauthenticated { .. } => "denied_unauthenticated",
            Self::DeniedWrongRole { .. } => "denied_wrong_role",
            Self::DeniedUnavailable => "denied_unavailable",
        }
    }
}

pub struct RouteGuard {
    source: Arc<dyn SessionSource>,
    mode: RoutingMode,
    timeout: Duration,
}

impl RouteGuard {
    #[must_use]
    pub fn new(source: Arc<dyn SessionSource>, mode: RoutingMode, timeout: Duration) -> Self {
        Self {
            source,
            mode,
            timeout,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> &RoutingMode {
        &self.mode
    }

    /// The role section `navigation` points into, if any.
    #[must_use]
    pub fn section(&self, navigation: &Navigation) -> Option<Role> {
        self.mode
            .role_for_location(navigation.host.as_deref(), &navigation.path)
    }

    /// Run the guard for one navigation.
    pub async fn evaluate(&self, navigation: &Navigation) -> GuardState {
        let mut state = GuardState::Unchecked;
        if self.section(navigation).is_none() {
            return state;
        }

        advance(&mut state, GuardState::Checking, navigation);
        let session = match tokio::time::timeout(
            self.timeout,
            self.source.resolve(navigation.token.as_deref()),
        )
        .await
        {
            Ok(result) => result.map(|session| session.user),
            Err(_) => {
                warn!(path = %navigation.path, "Session check timed out");
                Err(GateError::unavailable("session check timed out"))
            }
        };
        advance(&mut state, self.decide(session, navigation), navigation);
        state
    }

    /// Check a signed-in `identity` against the section `navigation` points into.
    ///
    /// # Errors
    /// [`GateError::WrongRole`] carrying the caller's own destination.
    pub fn authorize(&self, identity: Identity, navigation: &Navigation) -> Result<Identity, GateError> {
        if self
            .mode
            .is_on_destination(identity.role, navigation.host.as_deref(), &navigation.path)
        {
            Ok(identity)
        } else {
            Err(GateError::WrongRole {
                actual: identity.role,
                redirect_to: self.mode.destination(identity.role),
            })
        }
    }

    /// Map a session lookup result to a terminal state for `navigation`.
    #[must_use]
    pub fn decide(&self, session: Result<Identity, GateError>, navigation: &Navigation) -> GuardState {
        match session.and_then(|identity| self.authorize(identity, navigation)) {
            Ok(identity) => GuardState::Granted(identity),
            Err(GateError::WrongRole { redirect_to, .. }) => {
                GuardState::DeniedWrongRole { redirect_to }
            }
            Err(GateError::Unauthenticated) => GuardState::DeniedUnauthenticated {
                redirect_to: self.mode.login_destination(),
            },
            // Anything else means we could not tell who the caller is.
            Err(_) => GuardState::DeniedUnavailable,
        }
    }
}

fn advance(state: &mut GuardState, next: GuardState, navigation: &Navigation) {
    debug!(
        path = %navigation.path,
        from = state.label(),
        to = next.label(),
        "Guard transition"
    );
    *state = next;
}

/// Drives the guard for a client that navigates repeatedly. Starting a new
/// navigation supersedes the one in flight, whose evaluation then resolves
/// to `None` instead of a state.
pub struct Navigator {
    guard: Arc<RouteGuard>,
    generation: watch::Sender<u64>,
}

impl Navigator {
    #[must_use]
    pub fn new(guard: Arc<RouteGuard>) -> Self {
        let (generation, _) = watch::channel(0);
        Self { guard, generation }
    }

    pub async fn navigate(&self, navigation: Navigation) -> Option<GuardState> {
        let mut ticket = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            ticket = *generation;
        });
        let mut superseded = self.generation.subscribe();

        tokio::select! {
            state = self.guard.evaluate(&navigation) => {
                (*self.generation.borrow() == ticket).then_some(state)
            }
            () = async {
                while superseded.changed().await.is_ok() {
                    if *superseded.borrow_and_update() != ticket {
                        return;
                    }
                }
                std::future::pending::<()>().await;
            } => {
                debug!(path = %navigation.path, "Navigation superseded");
                None
            }
        }
    }
}
