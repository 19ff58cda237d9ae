//! Repository reconciliation.
//!
//! For every partition the manifest is compared against the inventory: new
//! repositories get a bare mirror (rejected if a mandatory branch is
//! missing), existing ones are fetched and their clones expanded, refreshed
//! or removed, and repositories that left the manifest are purged. The fetch
//! fan-out over existing bares runs on a worker pool; one repository failing
//! never aborts the run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::sync::Mutex;

use log::{debug, error, info};
use rayon::prelude::*;

use crate::config::{Config, Mode};
use crate::git::{CloneOptions, GIT_CLONE_TIMEOUT, GIT_FETCH_TIMEOUT, GitOps};
use crate::inventory::{DesiredInventory, Inventory};
use crate::locks::LockGuard;
use crate::manifest::Manifest;
use crate::messaging;
use crate::messaging::UpdateHints;
use crate::partition::{Partition, PerPartition};
use crate::refs::RefMapper;

#[derive(Debug)]
pub struct RepositoriesError(pub String);

impl fmt::Display for RepositoriesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RepositoriesError {}

/// Refs expanded for one repository, shared with the refresh workers.
type RefsByRepository = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default)]
pub struct PartitionDelta {
    /// Repositories created this run (bare cloned and fully expanded).
    pub new: Vec<String>,
    /// Repositories both declared and already on disk.
    pub existing: BTreeSet<String>,
    /// Repositories that left the manifest and were purged.
    pub deleted: Vec<String>,
}

pub type RepositoriesDelta = PerPartition<PartitionDelta>;

/// Reconcile bares and clones against the manifest, partition by partition.
///
/// `hints`, when given, narrow which *existing* bares get fetched; creation
/// and deletion always happen. The returned delta feeds the environment
/// reconciliation.
pub fn refresh_repositories(
    config: &Config,
    git: &GitOps,
    lock: &LockGuard,
    inventory: &mut Inventory,
    desired: &DesiredInventory,
    hints: Option<&UpdateHints>,
) -> Result<RepositoriesDelta, RepositoriesError> {
    debug!(
        "Reading metadata from {}",
        config.main.repositorymetadata.display()
    );
    let manifest = Manifest::load(&config.main.repositorymetadata)?;
    let mapper = config.ref_mapper();

    debug!("Initial inventory: {inventory:?}");
    debug!("Needed from overrides: {desired:?}");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count())
        .build()
        .map_err(|error| RepositoriesError(format!("unable to start worker pool ({error})")))?;

    let mut deltas = RepositoriesDelta::default();
    for partition in Partition::ALL {
        info!("Refreshing bare repositories ({partition})");
        debug!("Calculating '{partition}' delta...");
        let declared = manifest.repositories.get(partition);
        let current = std::mem::take(inventory.get_mut(partition));
        let (new, existing, deleted) = calculate_delta(declared, &current);
        info!("New repositories: {new:?}");
        debug!("Existing repositories: {existing:?}");
        info!("Deleted repositories: {deleted:?}");

        lock.renew(
            new.len() as u64 * GIT_CLONE_TIMEOUT
                + existing.len() as u64 * GIT_FETCH_TIMEOUT
                + deleted.len() as u64,
        );

        let shared = Mutex::new(current);
        let desired_partition = desired.get(partition);

        info!("Cloning and expanding NEW bare repositories...");
        let created = create_new_repositories(
            config,
            git,
            &mapper,
            partition,
            &new,
            declared,
            &shared,
            desired_partition,
        );

        // Hints narrow only what gets fetched; a hinted partition shrinks to
        // the intersection, an unhinted one to nothing.
        let refreshable: Vec<String> = match hints {
            Some(hints) => existing.intersection(hints.get(partition)).cloned().collect(),
            None => existing.iter().cloned().collect(),
        };

        info!("Expanding EXISTING bare repositories...");
        pool.install(|| {
            refreshable.par_iter().for_each(|repository| {
                refresh_repository(
                    config,
                    git,
                    &mapper,
                    partition,
                    repository,
                    &shared,
                    desired_partition.get(repository).map(Vec::as_slice).unwrap_or(&[]),
                    hints.is_some(),
                );
            });
        });

        info!("Purging REMOVED bare repositories...");
        purge_repositories(config, git, &mapper, partition, &deleted, &shared);

        *inventory.get_mut(partition) = shared
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        *deltas.get_mut(partition) = PartitionDelta {
            new: created,
            existing,
            deleted,
        };
    }

    debug!("Final inventory: {inventory:?}");
    Ok(deltas)
}

/// ceil(1.5 × cpus); the fan-out spends most of its time waiting on the
/// network.
fn worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    (cpus as f64 * 1.5).ceil() as usize
}

fn calculate_delta(
    declared: &BTreeMap<String, String>,
    current: &RefsByRepository,
) -> (Vec<String>, BTreeSet<String>, Vec<String>) {
    let declared_names: BTreeSet<&String> = declared.keys().collect();
    let current_names: BTreeSet<&String> = current.keys().collect();

    let new = declared_names
        .difference(&current_names)
        .map(|name| (*name).clone())
        .collect();
    let existing = declared_names
        .intersection(&current_names)
        .map(|name| (*name).clone())
        .collect();
    let deleted = current_names
        .difference(&declared_names)
        .map(|name| (*name).clone())
        .collect();
    (new, existing, deleted)
}

#[allow(clippy::too_many_arguments)]
fn create_new_repositories(
    config: &Config,
    git: &GitOps,
    mapper: &RefMapper,
    partition: Partition,
    new: &[String],
    declared: &BTreeMap<String, String>,
    inventory: &Mutex<RefsByRepository>,
    desired: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut created = Vec::new();
    for repository in new {
        info!("Cloning and expanding {partition}/{repository}...");
        let bare_path = config.bare_path(partition, repository);
        let url = &declared[repository];

        if let Err(error) = git.clone(
            &bare_path,
            url,
            &CloneOptions {
                bare: true,
                ..CloneOptions::default()
            },
        ) {
            error!("Unable to clone '{repository}' ({error}). Skipping.");
            remove_tree(&bare_path);
            continue;
        }

        let refs = match git.get_refs(&bare_path) {
            Ok(refs) => refs,
            Err(error) => {
                error!("Unable to get refs of '{repository}' ({error}). Skipping.");
                remove_tree(&bare_path);
                debug!("Bare repository {} has been removed", bare_path.display());
                continue;
            }
        };

        if !config
            .main
            .mandatorybranches
            .iter()
            .all(|branch| refs.contains_key(branch))
        {
            error!("Repository '{repository}' lacks some of the mandatory branches. Skipping.");
            remove_tree(&bare_path);
            debug!("Bare repository {} has been removed", bare_path.display());
            continue;
        }

        // Expand the mandatory branches plus whatever overrides ask for,
        // as long as it exists upstream; pinned commits are always tried.
        let mut initial: BTreeSet<String> = config.main.mandatorybranches.iter().cloned().collect();
        if let Some(wanted) = desired.get(repository) {
            initial.extend(
                wanted
                    .iter()
                    .filter(|refname| mapper.is_commit(refname.as_str()) || refs.contains_key(refname.as_str()))
                    .cloned(),
            );
        }

        inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(repository.clone(), Vec::new());
        let initial: Vec<String> = initial.into_iter().collect();
        expand_clones(config, git, mapper, partition, repository, inventory, &initial, &[], &[]);
        created.push(repository.clone());
    }
    created
}

/// Fetch one existing bare and propagate ref changes to its clones. Any
/// failure before the comparison aborts just this repository; when the
/// refresh was hint-driven the hint is put back so the next run retries.
#[allow(clippy::too_many_arguments)]
fn refresh_repository(
    config: &Config,
    git: &GitOps,
    mapper: &RefMapper,
    partition: Partition,
    repository: &str,
    inventory: &Mutex<RefsByRepository>,
    desired: &[String],
    hinted: bool,
) {
    match config.main.mode {
        Mode::Poll => debug!("Expanding bare and clones of {partition}/{repository}..."),
        Mode::OnDemand => {
            info!("Expanding bare and clones of {partition}/{repository} upon demand...");
        }
    }
    let bare_path = config.bare_path(partition, repository);

    let old_refs = match git.get_refs(&bare_path) {
        Ok(refs) => refs,
        Err(error) => {
            error!("Unable to get old refs of '{repository}' ({error})");
            requeue_if_hinted(config, partition, repository, hinted);
            return;
        }
    };

    if let Err(error) = git.fetch(&bare_path, true) {
        error!("Unable to fetch '{repository}' from remote ({error})");
        requeue_if_hinted(config, partition, repository, hinted);
        return;
    }

    let new_refs = match git.get_refs(&bare_path) {
        Ok(refs) => refs,
        Err(error) => {
            error!("Unable to get new refs of '{repository}' ({error})");
            requeue_if_hinted(config, partition, repository, hinted);
            return;
        }
    };

    let current: Vec<String> = inventory
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(repository)
        .cloned()
        .unwrap_or_default();

    let (new, moved, deleted) = compare_refs(
        mapper,
        &old_refs,
        &new_refs,
        &current,
        desired,
        &config.main.mandatorybranches,
    );
    expand_clones(config, git, mapper, partition, repository, inventory, &new, &moved, &deleted);
}

fn requeue_if_hinted(config: &Config, partition: Partition, repository: &str, hinted: bool) {
    if !hinted {
        return;
    }
    if let Err(error) = messaging::enqueue_hint(config, partition, repository) {
        error!("Couldn't re-add hint '{partition}/{repository}' to the queue ({error})");
    }
}

fn purge_repositories(
    config: &Config,
    git: &GitOps,
    mapper: &RefMapper,
    partition: Partition,
    deleted: &[String],
    inventory: &Mutex<RefsByRepository>,
) {
    for repository in deleted {
        info!("Deleting {partition}/{repository}...");
        let refs: Vec<String> = inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(repository)
            .cloned()
            .unwrap_or_default();
        expand_clones(config, git, mapper, partition, repository, inventory, &[], &[], &refs);

        let clones_path = config.clones_path(partition, repository);
        remove_tree(&clones_path);
        debug!("Clone repository parent {} has been removed", clones_path.display());
        let bare_path = config.bare_path(partition, repository);
        remove_tree(&bare_path);
        debug!("Bare repository {} has been removed", bare_path.display());

        inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(repository);
    }
}

/// Which refs must be expanded, refreshed or removed, given what upstream
/// had before the fetch (`old_refs`), what it has now (`new_refs`), what's
/// on disk (`current`) and what overrides still want (`desired`).
fn compare_refs(
    mapper: &RefMapper,
    old_refs: &HashMap<String, String>,
    new_refs: &HashMap<String, String>,
    current: &[String],
    desired: &[String],
    mandatory: &[String],
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let desired_set: BTreeSet<&String> = desired.iter().chain(mandatory.iter()).collect();
    let current_set: BTreeSet<&String> = current.iter().collect();

    // What we need minus what we have, but only refs that exist upstream.
    // Pinned commits are always attempted.
    let new: Vec<String> = desired_set
        .difference(&current_set)
        .filter(|refname| mapper.is_commit(refname.as_str()) || new_refs.contains_key(refname.as_str()))
        .map(|refname| (*refname).clone())
        .collect();

    // What we have that nobody needs anymore.
    let mut deleted: Vec<String> = current_set
        .difference(&desired_set)
        .map(|refname| (*refname).clone())
        .collect();

    if !new.is_empty() {
        debug!("New refs to be expanded: {new:?}");
    }
    if !deleted.is_empty() {
        debug!("Removed refs: {deleted:?}");
    }

    let mut moved = Vec::new();
    for refname in desired_set.intersection(&current_set) {
        // No point in checking whether a commit has moved.
        if mapper.is_commit(refname.as_str()) {
            continue;
        }
        // Still needed but gone upstream: drop the clone now, the next run
        // will try to expand it again if it's still desired.
        let Some(new_sha) = new_refs.get(refname.as_str()) else {
            info!("Ref '{refname}' still needed but removed from repo");
            deleted.push((*refname).clone());
            continue;
        };
        if old_refs.get(refname.as_str()) != Some(new_sha) {
            debug!("Ref '{refname}' has moved and points to {new_sha}");
            moved.push((*refname).clone());
        } else {
            debug!("Ref '{refname}' is known but didn't move");
        }
    }

    (new, moved, deleted)
}

/// Materialise ref changes as clone directories and keep the inventory entry
/// in step. Mutating the shared map is the only synchronised section; clone
/// and reset run outside the lock.
#[allow(clippy::too_many_arguments)]
fn expand_clones(
    config: &Config,
    git: &GitOps,
    mapper: &RefMapper,
    partition: Partition,
    name: &str,
    inventory: &Mutex<RefsByRepository>,
    new_refs: &[String],
    moved_refs: &[String],
    deleted_refs: &[String],
) {
    let bare_path = config.bare_path(partition, name);

    if !new_refs.is_empty() {
        debug!("Processing new refs of {partition}/{name} ({new_refs:?})...");
    }
    for refname in new_refs {
        let clone_path = config.clone_path(partition, name, &mapper.refname_to_dirname(refname));
        info!("Populating new ref '{}'", clone_path.display());
        let result = match mapper.commit_hex(refname) {
            Some(hex) => {
                debug!("Will create a clone pointing to '{hex}'");
                git.clone(
                    &clone_path,
                    &bare_path,
                    &CloneOptions {
                        shared: true,
                        ..CloneOptions::default()
                    },
                )
                .and_then(|_| git.reset(&clone_path, hex, true))
            }
            None => git.clone(
                &clone_path,
                &bare_path,
                &CloneOptions {
                    branch: Some(refname.clone()),
                    ..CloneOptions::default()
                },
            ),
        };
        match result {
            Ok(()) => {
                inventory
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .entry(name.to_string())
                    .or_default()
                    .push(refname.clone());
            }
            Err(error) => {
                if clone_path.is_dir() {
                    remove_tree(&clone_path);
                }
                error!("Unable to create clone '{}' ({error})", clone_path.display());
            }
        }
    }

    if !moved_refs.is_empty() {
        debug!("Processing moved refs of {partition}/{name} ({moved_refs:?})...");
    }
    for refname in moved_refs {
        let clone_path = config.clone_path(partition, name, &mapper.refname_to_dirname(refname));
        info!("Updating ref '{}'", clone_path.display());
        // If this fails the bare has the right heads but the clone stays
        // stale until the ref moves again, so it's worth shouting about.
        let result = git
            .fetch(&clone_path, false)
            .and_then(|_| git.reset(&clone_path, &format!("origin/{refname}"), true));
        if let Err(error) = result {
            error!("Unable to refresh clone '{}' ({error})", clone_path.display());
        }
    }

    if !deleted_refs.is_empty() {
        debug!("Processing deleted refs of {partition}/{name} ({deleted_refs:?})...");
    }
    for refname in deleted_refs {
        let clone_path = config.clone_path(partition, name, &mapper.refname_to_dirname(refname));
        info!("Removing {}", clone_path.display());
        if clone_path.is_dir() && fs::remove_dir_all(&clone_path).is_err() {
            error!("Couldn't delete {partition}/{name}/{refname}");
            continue;
        }
        let mut map = inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(refs) = map.get_mut(name)
            && let Some(position) = refs.iter().position(|candidate| candidate == refname)
        {
            refs.remove(position);
            info!("{name}/{refname} deleted from inventory");
        }
    }
}

fn remove_tree(path: &std::path::Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => error!("Couldn't remove {} ({error})", path.display()),
    }
}
