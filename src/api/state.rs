use crate::{
    config::GateConfig,
    guard::RouteGuard,
    identity::IdentityProvider,
    invite::InviteService,
    notify::WelcomeNotifier,
    session::{SessionSigner, SessionValidator},
    store::{InviteStore, UserStore},
};
use secrecy::SecretString;
use std::sync::Arc;

/// Everything a request needs, built once at startup and shared through an
/// `Extension` layer.
pub struct AppState {
    config: GateConfig,
    signer: Arc<SessionSigner>,
    validator: Arc<SessionValidator>,
    guard: RouteGuard,
    invites: InviteService,
    users: Arc<dyn UserStore>,
    provider: Arc<dyn IdentityProvider>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: GateConfig,
        jwt_secret: &SecretString,
        users: Arc<dyn UserStore>,
        invite_store: Arc<dyn InviteStore>,
        provider: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn WelcomeNotifier>,
    ) -> Self {
        let timeout = config.upstream_timeout();
        let signer = Arc::new(SessionSigner::new(
            jwt_secret,
            config.session_ttl_seconds(),
        ));
        let validator = Arc::new(SessionValidator::new(
            signer.clone(),
            users.clone(),
            timeout,
        ));
        // Room for the validator's single retry.
        let guard = RouteGuard::new(
            validator.clone(),
            config.routing_mode().clone(),
            timeout.saturating_mul(2),
        );
        let invites = InviteService::new(invite_store, notifier, timeout);

        Self {
            config,
            signer,
            validator,
            guard,
            invites,
            users,
            provider,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    #[must_use]
    pub fn signer(&self) -> &SessionSigner {
        &self.signer
    }

    #[must_use]
    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    #[must_use]
    pub const fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    #[must_use]
    pub const fn invites(&self) -> &InviteService {
        &self.invites
    }

    #[must_use]
    pub fn users(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    #[must_use]
    pub fn provider(&self) -> &dyn IdentityProvider {
        self.provider.as_ref()
    }
}
