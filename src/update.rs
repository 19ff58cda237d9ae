//! One full reconciliation run, end to end.

use std::time::Duration;

use anyhow::Context;
use log::{error, info};

use crate::config::{Config, Mode};
use crate::environments;
use crate::git::GitOps;
use crate::inventory;
use crate::locks::RunLock;
use crate::maintenance;
use crate::messaging;
use crate::repos;

const LOCK_TRIES: u32 = 2;
const LOCK_WAITTIME: Duration = Duration::from_secs(10);

/// Converge everything on disk toward the declared state: metadata first,
/// then repositories, then environments. Individual repositories and
/// environments may fail and are skipped; anything earlier in the chain is
/// fatal to the run.
pub fn run(config: &Config) -> anyhow::Result<()> {
    let git = GitOps::new(config);

    let lock = RunLock::from_config(config, LOCK_TRIES, LOCK_WAITTIME);
    let guard = lock.acquire().context("unable to acquire the run lock")?;

    maintenance::validate_directories(config).context("directory layout validation failed")?;
    maintenance::refresh_metadata(config, &git).context("unable to refresh metadata")?;

    match config.main.mode {
        Mode::Poll => info!("Executing a polling run"),
        Mode::OnDemand => info!("Executing an on-demand run"),
    }

    let hints = messaging::fetch_update_hints(config).context("unable to drain the hint queue")?;
    info!("{} update hints found", hints.len());
    // An empty drain means nobody asked for anything specific, so every
    // existing bare gets fetched.
    let hints = if hints.is_empty() { None } else { Some(&hints) };

    let mut inventory =
        inventory::get_inventory(config).context("unable to load the repositories inventory")?;
    let desired = inventory::get_desired_inventory(config)
        .context("unable to compute the desired inventory")?;

    let deltas = repos::refresh_repositories(config, &git, &guard, &mut inventory, &desired, hints)
        .context("repository reconciliation failed")?;
    environments::refresh_environments(config, &git, &deltas, &inventory)
        .context("environment reconciliation failed")?;

    // Losing the snapshot is not worth failing the run over; the next run
    // rebuilds it from the bare and clone trees.
    if let Err(persist_error) = inventory::persist_inventory(config, &inventory) {
        error!("Unable to persist the inventory ({persist_error})");
    }

    drop(guard);
    info!("Run completed");
    Ok(())
}
