//! Map validated CLI arguments to an [`Action`].

use crate::cli::{
    actions::{server, sweep, Action},
    commands::{gate, CMD_SWEEP_INVITES},
};
use anyhow::{Context, Result};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .filter(|dsn| !dsn.trim().is_empty())
        .context("missing required argument: --dsn")?;

    if matches.subcommand_name() == Some(CMD_SWEEP_INVITES) {
        return Ok(Action::SweepInvites(sweep::Args { dsn }));
    }

    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let options = gate::Options::parse(matches)?;

    Ok(Action::Server(server::Args { port, dsn, options }))
}
