//! Runtime settings shared by the session, guard and HTTP layers.

use crate::roles::RoutingMode;
use std::time::Duration;
use url::Url;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_REFRESH_GRACE_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct GateConfig {
    frontend_base_url: String,
    routing_mode: RoutingMode,
    cookie_domain: Option<String>,
    session_ttl_seconds: i64,
    refresh_grace_seconds: i64,
    upstream_timeout: Duration,
}

impl GateConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
            routing_mode: RoutingMode::Subdirectory,
            cookie_domain: None,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            refresh_grace_seconds: DEFAULT_REFRESH_GRACE_SECONDS,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_routing_mode(mut self, mode: RoutingMode) -> Self {
        self.routing_mode = mode;
        self
    }

    /// Share the session cookie across subdomains, e.g. `baidaohui.com`.
    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain
            .map(|domain| domain.trim().trim_start_matches('.').to_string())
            .filter(|domain| !domain.is_empty());
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_grace_seconds(mut self, seconds: i64) -> Self {
        self.refresh_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub const fn routing_mode(&self) -> &RoutingMode {
        &self.routing_mode
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub const fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub const fn refresh_grace_seconds(&self) -> i64 {
        self.refresh_grace_seconds
    }

    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    /// Local plain-HTTP frontends cannot receive `Secure` cookies.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        Url::parse(&self.frontend_base_url).map_or(true, |url| url.scheme() != "http")
    }

    /// Absolute link a Master can hand out for an invite token.
    #[must_use]
    pub fn invite_url(&self, token: &str) -> String {
        format!("{}/invite?token={token}", self.frontend_base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let config = GateConfig::new("https://baidaohui.com/".to_string());
        assert_eq!(config.frontend_base_url(), "https://baidaohui.com");
        assert_eq!(config.session_ttl_seconds(), 604_800);
        assert_eq!(config.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.routing_mode(), &RoutingMode::Subdirectory);
        assert!(config.cookie_domain().is_none());
        assert!(config.session_cookie_secure());

        let config = config
            .with_session_ttl_seconds(60)
            .with_refresh_grace_seconds(30)
            .with_upstream_timeout(Duration::from_millis(250))
            .with_cookie_domain(Some(".baidaohui.com".to_string()));
        assert_eq!(config.session_ttl_seconds(), 60);
        assert_eq!(config.refresh_grace_seconds(), 30);
        assert_eq!(config.upstream_timeout(), Duration::from_millis(250));
        assert_eq!(config.cookie_domain(), Some("baidaohui.com"));
    }

    #[test]
    fn plain_http_frontend_disables_secure_cookie() {
        let config = GateConfig::new("http://localhost:5173".to_string());
        assert!(!config.session_cookie_secure());
    }

    #[test]
    fn blank_cookie_domain_is_ignored() {
        let config = GateConfig::new("https://baidaohui.com".to_string())
            .with_cookie_domain(Some("  ".to_string()));
        assert!(config.cookie_domain().is_none());
    }

    #[test]
    fn invite_url_uses_frontend() {
        let config = GateConfig::new("https://baidaohui.com".to_string());
        assert_eq!(
            config.invite_url("abc"),
            "https://baidaohui.com/invite?token=abc"
        );
    }
}
