use crate::{
    cli::{actions::server::connect, telemetry},
    invite::InviteService,
    notify::LogNotifier,
    store::PgStore,
};
use anyhow::Result;
use chrono::Utc;
use std::{sync::Arc, time::Duration};

const SWEEP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Args {
    pub dsn: String,
}

/// Deactivate expired invites once and exit.
/// # Errors
/// Returns an error if the database is unreachable or the sweep fails.
pub async fn execute(args: Args) -> Result<()> {
    let store = Arc::new(PgStore::new(connect(&args.dsn).await?));
    let service = InviteService::new(store, Arc::new(LogNotifier), SWEEP_TIMEOUT);
    let result = service.sweep_expired(Utc::now()).await;
    telemetry::shutdown_tracer();
    result?;
    Ok(())
}
