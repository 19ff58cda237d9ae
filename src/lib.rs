//! A reconciling librarian for configuration-management environments.
//!
//! Given a manifest of Git repositories (split into `modules`, `hostgroups`
//! and `common`) and a set of per-environment YAML definitions, every run
//! converges the local disk toward the declaration: bare mirrors are
//! created, fetched and pruned, per-ref working clones are expanded and
//! retired, and each environment directory is rebuilt as a tree of relative
//! symlinks into those clones.
//!
//! The update driver lives in [`update`]; a webhook producer ([`producer`])
//! can narrow a run's fetch set through the durable hint queue
//! ([`messaging`]).

pub mod config;
pub mod environments;
pub mod git;
pub mod inventory;
pub mod locks;
pub mod maintenance;
pub mod manifest;
pub mod messaging;
pub mod partition;
pub mod producer;
pub mod refs;
pub mod repos;
pub mod update;
