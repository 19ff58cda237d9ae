//! The global run lock.
//!
//! Exactly one reconciliation run may make progress at a time. The `FILE`
//! backend takes an exclusive advisory lock on a well-known file; `DISABLED`
//! hands out a lock that protects nothing. Backends are uniform behind
//! acquire/release/renew so a remote, lease-based backend can slot in later.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use log::{debug, info, warn};

use crate::config::{Config, LockType};

#[derive(Debug)]
pub enum LockError {
    /// Contention: another process holds the lock.
    Exists,
    /// Anything else that kept us from acquiring.
    Failed(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Exists => write!(f, "lock already taken"),
            LockError::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for LockError {}

#[derive(Debug)]
enum Backend {
    File { path: PathBuf },
    Disabled,
}

#[derive(Debug)]
pub struct RunLock {
    backend: Backend,
    name: String,
    tries: u32,
    waittime: Duration,
}

impl RunLock {
    pub fn from_config(config: &Config, tries: u32, waittime: Duration) -> RunLock {
        let backend = match config.lock.backend {
            LockType::File => Backend::File {
                path: config.filelock.lockdir.join(&config.lock.name),
            },
            LockType::Disabled => Backend::Disabled,
        };
        RunLock {
            backend,
            name: config.lock.name.clone(),
            tries: tries.max(1),
            waittime,
        }
    }

    /// Try up to `tries` times, sleeping `waittime` between attempts. Only
    /// contention is retried.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("Obtaining lock '{}' (attempt: {attempt})...", self.name);
            match self.try_acquire() {
                Ok(guard) => {
                    debug!("Lock acquired");
                    return Ok(guard);
                }
                Err(LockError::Exists) if attempt < self.tries => {
                    debug!(
                        "Couldn't lock. Sleeping for {} seconds...",
                        self.waittime.as_secs()
                    );
                    thread::sleep(self.waittime);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn try_acquire(&self) -> Result<LockGuard, LockError> {
        match &self.backend {
            Backend::File { path } => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|error| {
                        LockError::Failed(format!("can't open lock file for writing ({error})"))
                    })?;
                file.try_lock_exclusive().map_err(|error| {
                    if error.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                        LockError::Exists
                    } else {
                        LockError::Failed(error.to_string())
                    }
                })?;
                Ok(LockGuard {
                    name: self.name.clone(),
                    _file: Some(file),
                })
            }
            Backend::Disabled => {
                warn!("Danger zone: no locking has been configured!");
                Ok(LockGuard {
                    name: self.name.clone(),
                    _file: None,
                })
            }
        }
    }
}

/// Held lock. Released when dropped (the OS drops the advisory lock with the
/// file descriptor).
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    _file: Option<File>,
}

impl LockGuard {
    /// Ask for `ttl` more seconds of ownership. A no-op for the file backend,
    /// which holds until release; the interface exists for lease-based
    /// backends.
    pub fn renew(&self, ttl: u64) {
        let ttl = if ttl == 0 {
            warn!("Invalid new TTL, resetting to 1 by default");
            1
        } else {
            ttl
        };
        info!("Setting '{}' lock TTL to {ttl} secs...", self.name);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        info!("Releasing lock '{}'...", self.name);
    }
}
