use crate::{config::GateConfig, roles::RoutingMode};
use anyhow::{anyhow, Context};
use clap::{builder::PossibleValuesParser, Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_SUPABASE_URL: &str = "supabase-url";
pub const ARG_SUPABASE_ANON_KEY: &str = "supabase-anon-key";
pub const ARG_ROUTING_MODE: &str = "routing-mode";
pub const ARG_BASE_DOMAIN: &str = "base-domain";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_REFRESH_GRACE_SECONDS: &str = "refresh-grace-seconds";
pub const ARG_UPSTREAM_TIMEOUT_SECONDS: &str = "upstream-timeout-seconds";
pub const ARG_STATIC_DIR: &str = "static-dir";
pub const ARG_NOTIFY_WEBHOOK_URL: &str = "notify-webhook-url";
pub const ARG_INIT_SCHEMA: &str = "init-schema";

#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub jwt_secret: SecretString,
    pub supabase_url: String,
    pub supabase_anon_key: SecretString,
    pub routing_mode: RoutingMode,
    pub cookie_domain: Option<String>,
    pub session_ttl_seconds: i64,
    pub refresh_grace_seconds: i64,
    pub upstream_timeout: Duration,
    pub static_dir: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub init_schema: bool,
}

impl Options {
    /// Parse gateway arguments from matches.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing or the routing mode is incomplete.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_required = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("missing required argument: --{id}"))
        };
        // Helper to filter empty strings which clap might pass through if env vars are set to ""
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let routing_mode = RoutingMode::parse(
            &read_required(ARG_ROUTING_MODE)?,
            &get_non_empty(ARG_BASE_DOMAIN).unwrap_or_default(),
        )
        .map_err(|err| anyhow!(err))?;

        let session_ttl_seconds = matches
            .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
            .copied()
            .context("missing session TTL")?;
        if session_ttl_seconds <= 0 {
            anyhow::bail!("--{ARG_SESSION_TTL_SECONDS} must be positive");
        }

        Ok(Self {
            frontend_base_url: read_required(ARG_FRONTEND_BASE_URL)?,
            jwt_secret: SecretString::from(read_required(ARG_JWT_SECRET)?),
            supabase_url: read_required(ARG_SUPABASE_URL)?,
            supabase_anon_key: SecretString::from(read_required(ARG_SUPABASE_ANON_KEY)?),
            routing_mode,
            cookie_domain: get_non_empty(ARG_COOKIE_DOMAIN),
            session_ttl_seconds,
            refresh_grace_seconds: matches
                .get_one::<i64>(ARG_REFRESH_GRACE_SECONDS)
                .copied()
                .unwrap_or_default()
                .max(0),
            upstream_timeout: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_UPSTREAM_TIMEOUT_SECONDS)
                    .copied()
                    .unwrap_or(10)
                    .max(1),
            ),
            static_dir: get_non_empty(ARG_STATIC_DIR),
            notify_webhook_url: get_non_empty(ARG_NOTIFY_WEBHOOK_URL),
            init_schema: matches.get_flag(ARG_INIT_SCHEMA),
        })
    }

    #[must_use]
    pub fn gate_config(&self) -> GateConfig {
        GateConfig::new(self.frontend_base_url.clone())
            .with_routing_mode(self.routing_mode.clone())
            .with_cookie_domain(self.cookie_domain.clone())
            .with_session_ttl_seconds(self.session_ttl_seconds)
            .with_refresh_grace_seconds(self.refresh_grace_seconds)
            .with_upstream_timeout(self.upstream_timeout)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    let command = with_routing_args(command);
    with_provider_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL, used for CORS and invite links")
                .env("BAIDAOHUI_FRONTEND_BASE_URL")
                .default_value("https://www.baidaohui.com"),
        )
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Secret used to sign session tokens")
                .env("BAIDAOHUI_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session cookie TTL in seconds")
                .env("BAIDAOHUI_SESSION_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_GRACE_SECONDS)
                .long(ARG_REFRESH_GRACE_SECONDS)
                .help("How long after expiry a session may still be refreshed")
                .env("BAIDAOHUI_REFRESH_GRACE_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .long(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .help("Timeout for store and identity provider calls")
                .env("BAIDAOHUI_UPSTREAM_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_NOTIFY_WEBHOOK_URL)
                .long(ARG_NOTIFY_WEBHOOK_URL)
                .help("Mail worker endpoint for welcome events (logged only when unset)")
                .env("BAIDAOHUI_NOTIFY_WEBHOOK_URL"),
        )
        .arg(
            Arg::new(ARG_INIT_SCHEMA)
                .long(ARG_INIT_SCHEMA)
                .help("Create missing tables before serving")
                .env("BAIDAOHUI_INIT_SCHEMA")
                .action(ArgAction::SetTrue),
        )
}

fn with_routing_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ROUTING_MODE)
                .long(ARG_ROUTING_MODE)
                .help("Serve role sections as /role paths or as role subdomains")
                .env("BAIDAOHUI_ROUTING_MODE")
                .default_value("subdirectory")
                .value_parser(PossibleValuesParser::new(["subdirectory", "subdomain"])),
        )
        .arg(
            Arg::new(ARG_BASE_DOMAIN)
                .long(ARG_BASE_DOMAIN)
                .help("Base domain for role subdomains, e.g. baidaohui.com")
                .env("BAIDAOHUI_BASE_DOMAIN")
                .required_if_eq(ARG_ROUTING_MODE, "subdomain"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Cookie domain shared by all subdomains")
                .env("BAIDAOHUI_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_STATIC_DIR)
                .long(ARG_STATIC_DIR)
                .help("Directory with the built site to serve behind the route guard")
                .env("BAIDAOHUI_STATIC_DIR"),
        )
}

fn with_provider_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SUPABASE_URL)
                .long(ARG_SUPABASE_URL)
                .help("Identity provider base URL")
                .env("BAIDAOHUI_SUPABASE_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_SUPABASE_ANON_KEY)
                .long(ARG_SUPABASE_ANON_KEY)
                .help("Identity provider API key")
                .env("BAIDAOHUI_SUPABASE_ANON_KEY")
                .hide_env_values(true)
                .required(true),
        )
}
