//! The repository manifest: which upstream repository backs every name in
//! every partition. Shared between the reconciler (drives the delta) and the
//! webhook producer (reverse lookup by URL).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::partition::PerPartition;
use crate::repos::RepositoriesError;

/// name → git URL, any transport git understands.
pub type RepositoryMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub repositories: PerPartition<RepositoryMap>,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Manifest, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn load(path: &Path) -> Result<Manifest, RepositoriesError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            RepositoriesError(format!("unable to read {} ({error})", path.display()))
        })?;
        Manifest::parse(&raw).map_err(|error| {
            RepositoriesError(format!("unable to parse {} ({error})", path.display()))
        })
    }
}
