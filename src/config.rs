//! Runtime configuration.
//!
//! Everything is loaded once from a single TOML file and passed around as a
//! [`Config`] value; nothing in the library reads configuration from global
//! state. The sections mirror the units of the system:
//!
//! - `[main]`: filesystem roots and reconciliation policy (mandatory
//!   branches, protected environments, hash prefix, mode).
//! - `[lock]` / `[filelock]`: run-lock backend selection and its directory.
//! - `[messaging]`: the hint-queue root.
//! - `[git]`: optional `GIT_SSH` override for git subprocesses.
//! - `[gitlabproducer]`: webhook secret token and fuzzy URL routing.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::partition::Partition;
use crate::refs::RefMapper;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, error) => {
                write!(f, "can't read config file {}: {error}", path.display())
            }
            ConfigError::Parse(error) => write!(f, "config file parsing failed: {error}"),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// How the reconciler is being driven. Advisory: it changes log wording for
/// the refresh fan-out, never which repositories get fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "POLL")]
    Poll,
    #[serde(rename = "ONDEMAND")]
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum LockType {
    #[default]
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "DISABLED")]
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MainConfig {
    pub baredir: PathBuf,
    pub clonedir: PathBuf,
    pub environmentsdir: PathBuf,
    pub cachedir: PathBuf,
    pub logdir: PathBuf,
    /// The manifest file itself; normally inside `repositorymetadatadir`.
    pub repositorymetadata: PathBuf,
    pub repositorymetadatadir: PathBuf,
    pub environmentsmetadatadir: PathBuf,
    /// Branches every managed repository must carry to be accepted.
    pub mandatorybranches: Vec<String>,
    /// Environments that are never deleted, even when undeclared.
    pub protectedenvironments: Vec<String>,
    /// Names linked under `<environment>/hieradata/` from the common
    /// hieradata repository.
    pub common_hieradata_items: Vec<String>,
    /// Prefix marking a ref as a pinned commit.
    pub hashprefix: String,
    /// Write an `environment.conf` into every environment.
    pub directory_environments: bool,
    pub mode: Mode,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            baredir: "/var/lib/librarian/bare".into(),
            clonedir: "/var/lib/librarian/clone".into(),
            environmentsdir: "/var/lib/librarian/environments".into(),
            cachedir: "/var/lib/librarian/cache".into(),
            logdir: "/var/log/librarian".into(),
            repositorymetadata: "/var/lib/librarian/metadata/repositories/repositories.yaml"
                .into(),
            repositorymetadatadir: "/var/lib/librarian/metadata/repositories".into(),
            environmentsmetadatadir: "/var/lib/librarian/metadata/environments".into(),
            mandatorybranches: vec!["master".to_string(), "qa".to_string()],
            protectedenvironments: Vec::new(),
            common_hieradata_items: Vec::new(),
            hashprefix: "commit/".to_string(),
            directory_environments: false,
            mode: Mode::Poll,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    #[serde(rename = "type")]
    pub backend: LockType,
    pub name: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            backend: LockType::File,
            name: "librarian".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileLockConfig {
    pub lockdir: PathBuf,
}

impl Default for FileLockConfig {
    fn default() -> Self {
        FileLockConfig {
            lockdir: "/run/lock/librarian".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingConfig {
    pub queuedir: PathBuf,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        MessagingConfig {
            queuedir: "/var/spool/librarian".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitConfig {
    /// Exported as `GIT_SSH` to every git subprocess when set.
    pub ssh_cmd_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerConfig {
    /// When set, webhook requests must carry it in `X-Gitlab-Token`.
    pub secret_token: Option<String>,
    /// URL prefixes for which namespace/repo tail matching is allowed.
    pub fuzzy_url_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub main: MainConfig,
    pub lock: LockConfig,
    pub filelock: FileLockConfig,
    pub messaging: MessagingConfig,
    pub git: GitConfig,
    pub gitlabproducer: ProducerConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Io(path.to_path_buf(), error))?;
        let config: Config = toml::from_str(&raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main.hashprefix.is_empty() {
            return Err(ConfigError::Invalid("hashprefix can't be empty".to_string()));
        }
        if self.lock.name.is_empty() {
            return Err(ConfigError::Invalid("lock name can't be empty".to_string()));
        }
        Ok(())
    }

    pub fn ref_mapper(&self) -> RefMapper {
        RefMapper::new(&self.main.hashprefix)
    }

    // Path composition. Every on-disk location the reconciler owns is
    // derived here and nowhere else.

    pub fn bare_path(&self, partition: Partition, name: &str) -> PathBuf {
        self.main.baredir.join(partition.as_str()).join(name)
    }

    /// Parent directory holding one clone per expanded ref.
    pub fn clones_path(&self, partition: Partition, name: &str) -> PathBuf {
        self.main.clonedir.join(partition.as_str()).join(name)
    }

    pub fn clone_path(&self, partition: Partition, name: &str, dirname: &str) -> PathBuf {
        self.clones_path(partition, name).join(dirname)
    }

    pub fn environment_path(&self, environment: &str) -> PathBuf {
        self.main.environmentsdir.join(environment)
    }

    pub fn annotation_path(&self, environment: &str) -> PathBuf {
        self.main.cachedir.join("environments").join(environment)
    }

    pub fn annotations_path(&self) -> PathBuf {
        self.main.cachedir.join("environments")
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.main.cachedir.join("repositories")
    }

    pub fn environment_definition_path(&self, environment: &str) -> PathBuf {
        self.main
            .environmentsmetadatadir
            .join(format!("{environment}.yaml"))
    }
}
