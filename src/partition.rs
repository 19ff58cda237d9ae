//! The three repository partitions and the per-partition container.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of every managed repository, override and on-disk root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Modules,
    Hostgroups,
    Common,
}

impl Partition {
    /// All partitions, in the order they are reconciled.
    pub const ALL: [Partition; 3] = [Partition::Modules, Partition::Hostgroups, Partition::Common];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Modules => "modules",
            Partition::Hostgroups => "hostgroups",
            Partition::Common => "common",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPartition(pub String);

impl fmt::Display for UnknownPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown partition '{}'", self.0)
    }
}

impl std::error::Error for UnknownPartition {}

impl FromStr for Partition {
    type Err = UnknownPartition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modules" => Ok(Partition::Modules),
            "hostgroups" => Ok(Partition::Hostgroups),
            "common" => Ok(Partition::Common),
            other => Err(UnknownPartition(other.to_string())),
        }
    }
}

/// One value per partition.
///
/// The manifest, the inventories, the update hints and the reconciliation
/// deltas are all triples keyed by [`Partition`]; this keeps them addressable
/// without stringly-typed map lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct PerPartition<T> {
    #[serde(default)]
    pub modules: T,
    #[serde(default)]
    pub hostgroups: T,
    #[serde(default)]
    pub common: T,
}

impl<T> PerPartition<T> {
    pub fn get(&self, partition: Partition) -> &T {
        match partition {
            Partition::Modules => &self.modules,
            Partition::Hostgroups => &self.hostgroups,
            Partition::Common => &self.common,
        }
    }

    pub fn get_mut(&mut self, partition: Partition) -> &mut T {
        match partition {
            Partition::Modules => &mut self.modules,
            Partition::Hostgroups => &mut self.hostgroups,
            Partition::Common => &mut self.common,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Partition, &T)> {
        Partition::ALL.iter().map(move |&p| (p, self.get(p)))
    }
}
