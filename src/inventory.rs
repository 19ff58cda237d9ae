//! The repositories inventory.
//!
//! Snapshot of which refs are expanded for which repository, persisted as an
//! opaque blob between runs. When the blob is missing or doesn't decode the
//! inventory is rebuilt from what's actually on disk, so losing the cache
//! only costs time. The desired inventory is the look-ahead bit: every
//! override any declared environment asks for, so the repo reconciler knows
//! which extra refs to expand.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::environments::{self, EnvironmentsError};
use crate::partition::{Partition, PerPartition};
use crate::repos::RepositoriesError;

/// partition → repository → refs with a clone on disk.
pub type Inventory = PerPartition<BTreeMap<String, Vec<String>>>;

/// partition → element → refs some environment override still needs.
pub type DesiredInventory = PerPartition<BTreeMap<String, Vec<String>>>;

pub fn get_inventory(config: &Config) -> Result<Inventory, RepositoriesError> {
    info!("Fetching repositories inventory...");
    match read_inventory_from_disk(config) {
        Ok(inventory) => Ok(inventory),
        Err(error) => {
            warn!("Inventory on disk not found or corrupt, generating... ({error})");
            generate_inventory(config)
        }
    }
}

pub fn persist_inventory(config: &Config, inventory: &Inventory) -> Result<(), RepositoriesError> {
    info!("Persisting repositories inventory...");
    let path = config.inventory_path();
    debug!("Writing inventory to {}", path.display());
    let directory = path
        .parent()
        .ok_or_else(|| RepositoriesError("inventory path has no parent".to_string()))?;
    // Stage and rename so a crash never leaves a truncated blob behind.
    let mut staged = tempfile::NamedTempFile::new_in(directory)
        .map_err(|error| RepositoriesError(format!("unable to write inventory to disk ({error})")))?;
    serde_json::to_writer(&mut staged, inventory)
        .map_err(|error| RepositoriesError(format!("unable to write inventory to disk ({error})")))?;
    staged
        .flush()
        .and_then(|_| staged.persist(&path).map(drop).map_err(|error| error.error))
        .map_err(|error| RepositoriesError(format!("unable to write inventory to disk ({error})")))
}

fn read_inventory_from_disk(config: &Config) -> Result<Inventory, RepositoriesError> {
    let raw = fs::read(config.inventory_path())
        .map_err(|error| RepositoriesError(format!("unable to read inventory ({error})")))?;
    serde_json::from_slice(&raw)
        .map_err(|error| RepositoriesError(format!("unable to decode inventory ({error})")))
}

/// Rebuild the inventory from the bare and clone trees.
fn generate_inventory(config: &Config) -> Result<Inventory, RepositoriesError> {
    info!("Generating inventory of bares and clones...");
    let mapper = config.ref_mapper();
    let mut inventory = Inventory::default();
    for partition in Partition::ALL {
        let baredir = config.main.baredir.join(partition.as_str());
        let names = list_directory(&baredir)?;
        for name in names {
            let clonesdir = config.clones_path(partition, &name);
            let clones = list_directory(&clonesdir).map_err(|error| {
                RepositoriesError(format!(
                    "unable to list clones of {partition}/{name} ({error})"
                ))
            })?;
            let refs = clones
                .into_iter()
                .map(|dirname| mapper.dirname_to_refname(&dirname))
                .collect();
            inventory.get_mut(partition).insert(name, refs);
        }
    }
    Ok(inventory)
}

fn list_directory(path: &std::path::Path) -> Result<Vec<String>, RepositoriesError> {
    let entries = fs::read_dir(path)
        .map_err(|error| RepositoriesError(format!("unable to list {} ({error})", path.display())))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|error| RepositoriesError(format!("unable to list {} ({error})", path.display())))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Collect every override from every declared environment. Environments
/// whose definition doesn't validate are skipped here, exactly as they will
/// be skipped by the environment reconciliation later.
pub fn get_desired_inventory(config: &Config) -> Result<DesiredInventory, EnvironmentsError> {
    let mapper = config.ref_mapper();
    let mut desired = DesiredInventory::default();
    for environment in environments::declared_environment_names(config)? {
        let definition = match environments::read_environment_definition(config, &environment) {
            Ok(definition) => definition,
            Err(_) => {
                error!("Unable to process '{environment}' definition. Skipping");
                continue;
            }
        };
        for (partition, overrides) in definition.overrides.iter() {
            for (name, treeish) in overrides {
                // Pinned commits compare case-insensitively, branches don't.
                let treeish = mapper.canonicalize(treeish);
                let refs = desired.get_mut(partition).entry(name.clone()).or_default();
                if !refs.contains(&treeish) {
                    refs.push(treeish);
                }
            }
        }
    }
    Ok(desired)
}
