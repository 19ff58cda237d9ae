//! Upkeep around the reconciliation proper: refreshing the two metadata
//! clones, sanity-checking the directory layout at startup and an occasional
//! garbage-collection sweep over every bare and clone.

use std::fmt;
use std::fs;
use std::fs::File;
use std::path::Path;

use fs2::FileExt;
use log::{debug, error, info};

use crate::config::{Config, LockType};
use crate::git::GitOps;
use crate::partition::Partition;

#[derive(Debug)]
pub struct MaintenanceError(pub String);

impl fmt::Display for MaintenanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MaintenanceError {}

/// Bring both metadata clones up to date with their upstreams.
pub fn refresh_metadata(config: &Config, git: &GitOps) -> Result<(), MaintenanceError> {
    refresh_environments_metadata(config, git)?;
    refresh_repositories_metadata(config, git)
}

fn refresh_environments_metadata(config: &Config, git: &GitOps) -> Result<(), MaintenanceError> {
    debug!("Refreshing environment metadata...");
    let path = &config.main.environmentsmetadatadir;
    git.fetch(path, false)
        .and_then(|_| git.reset(path, "origin/master", true))
        .map_err(|error| {
            MaintenanceError(format!("couldn't refresh environments metadata ({error})"))
        })
}

/// The webhook producer reads the manifest under a shared lock at any time,
/// so the hard reset happens under the exclusive counterpart: it must never
/// observe a half-written file.
fn refresh_repositories_metadata(config: &Config, git: &GitOps) -> Result<(), MaintenanceError> {
    debug!("Refreshing repositories metadata...");
    let path = &config.main.repositorymetadatadir;
    git.fetch(path, false).map_err(|error| {
        MaintenanceError(format!("couldn't refresh repositories metadata ({error})"))
    })?;

    let manifest_path = &config.main.repositorymetadata;
    let manifest = File::open(manifest_path).map_err(|_| {
        MaintenanceError(format!(
            "could not open '{}' to put a lock on it",
            manifest_path.display()
        ))
    })?;

    info!("Trying to acquire a lock to refresh the metadata...");
    manifest.lock_exclusive().map_err(|_| {
        MaintenanceError(format!("could not lock '{}'", manifest_path.display()))
    })?;
    debug!("Lock acquired");

    let reset = git.reset(path, "origin/master", true);

    debug!("Trying to release the lock used to refresh the metadata...");
    let unlock = manifest.unlock();
    debug!("Lock released");

    reset.map_err(|error| {
        MaintenanceError(format!("couldn't refresh repositories metadata ({error})"))
    })?;
    unlock.map_err(|_| MaintenanceError(format!("could not unlock '{}'", manifest_path.display())))
}

/// Every directory the run will touch must already exist and be writable
/// before anything is reconciled.
pub fn validate_directories(config: &Config) -> Result<(), MaintenanceError> {
    let main = &config.main;
    let mut directories = vec![
        main.baredir.clone(),
        main.clonedir.clone(),
        main.cachedir.clone(),
        main.cachedir.join("environments"),
        main.environmentsdir.clone(),
        main.repositorymetadatadir.clone(),
        main.environmentsmetadatadir.clone(),
    ];
    for partition in Partition::ALL {
        directories.push(main.baredir.join(partition.as_str()));
        directories.push(main.clonedir.join(partition.as_str()));
    }
    if config.lock.backend == LockType::File {
        directories.push(config.filelock.lockdir.clone());
    }
    for directory in &directories {
        validate_directory(directory)?;
    }

    if !main.environmentsmetadatadir.join(".git").exists() {
        return Err(MaintenanceError(format!(
            "{} not initialized (no Git repository found)",
            main.environmentsmetadatadir.display()
        )));
    }
    if !main.repositorymetadata.exists() {
        return Err(MaintenanceError(format!(
            "couldn't find metadata of repositories ({} not initialized)",
            main.repositorymetadatadir.display()
        )));
    }
    Ok(())
}

fn validate_directory(directory: &Path) -> Result<(), MaintenanceError> {
    let metadata = fs::metadata(directory).map_err(|_| {
        MaintenanceError(format!("directory '{}' does not exist", directory.display()))
    })?;
    if !metadata.is_dir() || metadata.permissions().readonly() {
        return Err(MaintenanceError(format!(
            "cannot read or write on directory '{}'",
            directory.display()
        )));
    }
    Ok(())
}

/// Run `git gc` over every bare and every clone. Per-repository failures are
/// logged and the sweep carries on.
pub fn gc_repositories(
    config: &Config,
    git: &GitOps,
    aggressive: bool,
) -> Result<(), MaintenanceError> {
    for partition in Partition::ALL {
        let baredir = config.main.baredir.join(partition.as_str());
        for name in list_directory(&baredir)? {
            let bare_path = config.bare_path(partition, &name);
            info!("Collecting garbage in {partition}/{name}...");
            if let Err(error) = git.gc(&bare_path, aggressive) {
                error!("Unable to collect garbage in '{}' ({error})", bare_path.display());
            }
            let clonesdir = config.clones_path(partition, &name);
            if !clonesdir.is_dir() {
                continue;
            }
            for dirname in list_directory(&clonesdir)? {
                let clone_path = clonesdir.join(&dirname);
                if let Err(error) = git.gc(&clone_path, aggressive) {
                    error!("Unable to collect garbage in '{}' ({error})", clone_path.display());
                }
            }
        }
    }
    Ok(())
}

fn list_directory(path: &Path) -> Result<Vec<String>, MaintenanceError> {
    let entries = fs::read_dir(path)
        .map_err(|error| MaintenanceError(format!("unable to list {} ({error})", path.display())))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|error| MaintenanceError(format!("unable to list {} ({error})", path.display())))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_directory_rejects_missing_paths() {
        let result = validate_directory(Path::new("/definitely/not/here"));
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn validate_directory_accepts_a_writable_directory() {
        let tmp = tempfile::tempdir().unwrap();
        validate_directory(tmp.path()).unwrap();
    }

    #[test]
    fn validate_directory_rejects_files() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(validate_directory(&file).is_err());
    }
}
