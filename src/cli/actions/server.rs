use crate::{
    api::{self, AppState},
    cli::{commands::gate, telemetry},
    identity::SupabaseProvider,
    notify::{LogNotifier, WebhookNotifier, WelcomeNotifier},
    store::PgStore,
};
use anyhow::{Context, Result};
use axum::{http::StatusCode, Router};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub options: gate::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, a client cannot be built,
/// or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let pool = connect(&args.dsn).await?;
    let store = Arc::new(PgStore::new(pool));
    if args.options.init_schema {
        store.apply_schema().await?;
        info!("Database schema applied");
    }

    let config = args.options.gate_config();
    let timeout = config.upstream_timeout();

    let provider = Arc::new(SupabaseProvider::new(
        &args.options.supabase_url,
        args.options.supabase_anon_key.clone(),
        timeout,
    )?);

    let notifier: Arc<dyn WelcomeNotifier> = match &args.options.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), timeout)?),
        None => Arc::new(LogNotifier),
    };

    let state = Arc::new(AppState::new(
        config,
        &args.options.jwt_secret,
        store.clone(),
        store,
        provider,
        notifier,
    ));

    let listener = TcpListener::bind(format!("::0:{}", args.port))
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;

    let site = site(args.options.static_dir.as_deref());
    let result = api::serve(listener, state, site, shutdown_signal()).await;
    telemetry::shutdown_tracer();
    result
}

/// # Errors
/// Returns an error if no connection can be established.
pub async fn connect(dsn: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")
}

/// The built single page app, with `index.html` answering client-side routes.
fn site(static_dir: Option<&str>) -> Router {
    match static_dir {
        Some(dir) => {
            let index = Path::new(dir).join("index.html");
            Router::new().fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        None => Router::new().fallback(|| async { StatusCode::NOT_FOUND }),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            debug!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                debug!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn log_startup_args(args: &Args) {
    let options = &args.options;
    info!(
        port = args.port,
        frontend = %options.frontend_base_url,
        routing_mode = ?options.routing_mode,
        cookie_domain = ?options.cookie_domain,
        upstream_timeout = ?options.upstream_timeout,
        static_dir = ?options.static_dir,
        webhook = options.notify_webhook_url.is_some(),
        "Starting server"
    );
}
