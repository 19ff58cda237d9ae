//! Thin wrapper around the `git` binary.
//!
//! Every operation shells out to `git`, maps a non-zero exit into a
//! [`GitError`] carrying the tool's stderr, and binds the HTTP low-speed
//! environment so a stalled transfer gives up instead of hanging a run:
//! transfers slower than `GIT_HTTP_LOW_SPEED_LIMIT` bytes/s for longer than
//! the per-operation `GIT_HTTP_LOW_SPEED_TIME` are aborted by git itself.
//! These are soft timeouts on the transfer, not wall-clock bounds.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::config::Config;

/// Soft timeout (seconds) for fetches.
pub const GIT_FETCH_TIMEOUT: u64 = 4;
/// Soft timeout (seconds) for clones.
pub const GIT_CLONE_TIMEOUT: u64 = 8;
/// Soft timeout (seconds) for garbage collection.
pub const GIT_GC_TIMEOUT: u64 = 10;

const GIT_DEFAULT_SOFT_TIMEOUT: u64 = 4;
const GIT_HTTP_LOW_SPEED_LIMIT: &str = "2000";

#[derive(Debug)]
pub enum GitError {
    /// git exited non-zero or could not be spawned.
    CommandFailed(String),
    /// git succeeded but printed something we can't make sense of.
    ParseError(String),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CommandFailed(msg) => write!(f, "{msg}"),
            GitError::ParseError(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for GitError {}

#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Produce an exact mirror (`--bare --mirror`).
    pub bare: bool,
    /// Borrow objects from the source via an `alternates` pointer.
    pub shared: bool,
    /// Check out a single named branch.
    pub branch: Option<String>,
}

/// Git operations bound to one process-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct GitOps {
    ssh_cmd: Option<PathBuf>,
}

impl GitOps {
    pub fn new(config: &Config) -> Self {
        GitOps {
            ssh_cmd: config.git.ssh_cmd_path.clone(),
        }
    }

    pub fn clone(
        &self,
        target: &Path,
        url: impl AsRef<OsStr>,
        options: &CloneOptions,
    ) -> Result<(), GitError> {
        debug!(
            "Cloning from {} to {}",
            url.as_ref().to_string_lossy(),
            target.display()
        );
        let mut command = self.command(None, GIT_CLONE_TIMEOUT);
        command.args(["clone", "--no-hardlinks"]);
        if options.bare {
            command.args(["--bare", "--mirror"]);
        }
        if options.shared {
            command.arg("--shared");
        }
        if let Some(branch) = &options.branch {
            command.args(["--branch", branch]);
        }
        command.arg(url.as_ref());
        command.arg(target);
        run(command).map(drop)
    }

    pub fn fetch(&self, path: &Path, prune: bool) -> Result<(), GitError> {
        debug!("Fetching new refs in {}", path.display());
        let mut command = self.command(Some(path), GIT_FETCH_TIMEOUT);
        command.args(["fetch", "--no-tags"]);
        if prune {
            command.arg("--prune");
        }
        command.arg("origin");
        run(command).map(drop)
    }

    pub fn reset(&self, path: &Path, treeish: &str, hard: bool) -> Result<(), GitError> {
        debug!("Resetting {} to {treeish}", path.display());
        let mut command = self.command(Some(path), GIT_DEFAULT_SOFT_TIMEOUT);
        command.arg("reset");
        if hard {
            command.arg("--hard");
        }
        command.arg(treeish);
        run(command).map(drop)
    }

    pub fn gc(&self, path: &Path, aggressive: bool) -> Result<(), GitError> {
        debug!("Collecting garbage in {}", path.display());
        let mut command = self.command(Some(path), GIT_GC_TIMEOUT);
        command.args(["gc", "--quiet"]);
        if aggressive {
            command.arg("--aggressive");
        }
        run(command).map(drop)
    }

    /// Local heads only: branch name → SHA. Tags and remote-tracking refs
    /// are excluded. A repository with no heads at all is an error.
    pub fn get_refs(&self, path: &Path) -> Result<HashMap<String, String>, GitError> {
        let mut command = self.command(Some(path), GIT_DEFAULT_SOFT_TIMEOUT);
        command.args(["show-ref", "--heads"]);
        parse_show_ref(&run(command)?)
    }

    /// Current HEAD SHA; abbreviated to 7 characters when `short`.
    pub fn get_head(&self, path: &Path, short: bool) -> Result<String, GitError> {
        debug!("Getting HEAD of {}", path.display());
        let mut command = self.command(Some(path), GIT_DEFAULT_SOFT_TIMEOUT);
        command.arg("rev-parse");
        if short {
            command.arg("--short=7");
        }
        command.arg("HEAD");
        Ok(run(command)?.trim().to_string())
    }

    /// git's content-addressed blob SHA of a file.
    pub fn hash_object(&self, path: &Path) -> Result<String, GitError> {
        debug!("Hashing object {}", path.display());
        let mut command = self.command(None, GIT_DEFAULT_SOFT_TIMEOUT);
        command.arg("hash-object");
        command.arg(path);
        Ok(run(command)?.trim().to_string())
    }

    fn command(&self, cwd: Option<&Path>, timeout: u64) -> Command {
        let mut command = Command::new("git");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        command.env("GIT_HTTP_LOW_SPEED_TIME", timeout.to_string());
        command.env("GIT_HTTP_LOW_SPEED_LIMIT", GIT_HTTP_LOW_SPEED_LIMIT);
        if let Some(ssh_cmd) = &self.ssh_cmd {
            command.env("GIT_SSH", ssh_cmd);
        }
        command
    }
}

fn run(mut command: Command) -> Result<String, GitError> {
    debug!("Executing {command:?}");
    let output = command
        .output()
        .map_err(|error| GitError::CommandFailed(format!("couldn't execute git: {error}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "couldn't execute {command:?} ({})",
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_show_ref(output: &str) -> Result<HashMap<String, String>, GitError> {
    let mut refs = HashMap::new();
    for line in output.lines() {
        let Some((sha, name)) = line.split_once(' ') else {
            return Err(GitError::ParseError(format!("unparseable ref line: {line}")));
        };
        let Some(branch) = name.strip_prefix("refs/heads/") else {
            return Err(GitError::ParseError(format!("not a local head: {name}")));
        };
        refs.insert(branch.to_string(), sha.to_string());
    }
    Ok(refs)
}
