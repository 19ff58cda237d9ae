//! Environment reconciliation.
//!
//! An environment is a directory of symlinks into the per-ref clone tree,
//! described by one YAML file in the environments metadata repository. The
//! blob hash of that YAML is cached after a successful materialisation, so a
//! later run can tell changed environments from untouched ones without
//! rebuilding anything.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::LazyLock;

use log::{debug, error, info, warn};
use regex::Regex;
use serde_yaml::Value;

use crate::config::Config;
use crate::git::GitOps;
use crate::inventory::Inventory;
use crate::partition::{Partition, PerPartition};
use crate::refs::RefMapper;
use crate::repos::RepositoriesDelta;

const CONF_FILENAME: &str = "environment.conf";

static ENVIRONMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+$").expect("environment name regex"));

#[derive(Debug)]
pub struct EnvironmentsError(pub String);

impl fmt::Display for EnvironmentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EnvironmentsError {}

/// Puppet parser selection for the directory-environment config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parser {
    Current,
    Future,
}

impl Parser {
    pub fn as_str(self) -> &'static str {
        match self {
            Parser::Current => "current",
            Parser::Future => "future",
        }
    }
}

/// A validated environment definition.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentDefinition {
    pub notifications: String,
    /// Branch used for every element that has no override. Without it the
    /// environment only contains the explicitly overridden elements.
    pub default: Option<String>,
    pub overrides: PerPartition<BTreeMap<String, String>>,
    pub parser: Option<Parser>,
}

impl EnvironmentDefinition {
    /// Parse and validate one environment YAML. Guarantees that whatever
    /// keys are present contain things that make sense: overrides only name
    /// known partitions and each partition holds a non-empty mapping.
    pub fn parse(environment: &str, raw: &str) -> Result<EnvironmentDefinition, EnvironmentsError> {
        let value: Value = serde_yaml::from_str(raw)
            .map_err(|_| EnvironmentsError(format!("unable to parse '{environment}'")))?;
        let Value::Mapping(mapping) = value else {
            return Err(EnvironmentsError(format!("environment '{environment}' is empty")));
        };

        let notifications = match mapping.get("notifications") {
            Some(Value::String(notifications)) => notifications.clone(),
            Some(_) | None => {
                return Err(EnvironmentsError(format!(
                    "missing 'notifications' in environment '{environment}'"
                )));
            }
        };

        let default = match mapping.get("default") {
            None => None,
            Some(Value::String(default)) => Some(default.clone()),
            Some(_) => {
                return Err(EnvironmentsError(format!(
                    "default declared but it is not a string in environment '{environment}'"
                )));
            }
        };

        let mut overrides: PerPartition<BTreeMap<String, String>> = PerPartition::default();
        match mapping.get("overrides") {
            None => {}
            Some(Value::Mapping(partitions)) => {
                for (key, elements) in partitions {
                    let partition = key
                        .as_str()
                        .and_then(|name| name.parse::<Partition>().ok())
                        .ok_or_else(|| {
                            EnvironmentsError(format!(
                                "unknown partition to override in environment '{environment}'"
                            ))
                        })?;
                    let Value::Mapping(elements) = elements else {
                        return Err(EnvironmentsError(format!(
                            "overrides declared but nothing overridden in environment '{environment}'"
                        )));
                    };
                    for (element, treeish) in elements {
                        let (Some(element), Some(treeish)) = (element.as_str(), treeish.as_str())
                        else {
                            return Err(EnvironmentsError(format!(
                                "override is not a string in environment '{environment}'"
                            )));
                        };
                        overrides
                            .get_mut(partition)
                            .insert(element.to_string(), treeish.to_string());
                    }
                }
            }
            Some(_) => {
                return Err(EnvironmentsError(format!(
                    "overrides declared but nothing overridden in environment '{environment}'"
                )));
            }
        }

        let parser = match mapping.get("parser") {
            None => None,
            Some(Value::String(parser)) if parser == "current" => Some(Parser::Current),
            Some(Value::String(parser)) if parser == "future" => Some(Parser::Future),
            Some(parser) => {
                return Err(EnvironmentsError(format!(
                    "environment '{environment}' has an invalid value for the parser option: {parser:?}"
                )));
            }
        };

        Ok(EnvironmentDefinition {
            notifications,
            default,
            overrides,
            parser,
        })
    }
}

pub fn read_environment_definition(
    config: &Config,
    environment: &str,
) -> Result<EnvironmentDefinition, EnvironmentsError> {
    let path = config.environment_definition_path(environment);
    debug!("Reading environment from {}", path.display());
    let raw = fs::read_to_string(&path).map_err(|_| {
        EnvironmentsError(format!("unable to open {} for reading", path.display()))
    })?;
    EnvironmentDefinition::parse(environment, &raw)
}

/// Environments named by a `<name>.yaml` in the environments metadata clone.
pub fn declared_environment_names(config: &Config) -> Result<Vec<String>, EnvironmentsError> {
    let dir = &config.main.environmentsmetadatadir;
    let entries = fs::read_dir(dir)
        .map_err(|error| EnvironmentsError(format!("unable to list {} ({error})", dir.display())))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|error| EnvironmentsError(format!("unable to list {} ({error})", dir.display())))?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(name) = file_name.strip_suffix(".yaml") {
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[derive(Debug, Default)]
struct EnvironmentsDelta {
    new: Vec<String>,
    changed: Vec<String>,
    notchanged: Vec<String>,
    deleted: Vec<String>,
}

fn calculate_delta(config: &Config, git: &GitOps) -> Result<EnvironmentsDelta, EnvironmentsError> {
    let annotations = config.annotations_path();
    let entries = fs::read_dir(&annotations).map_err(|error| {
        EnvironmentsError(format!("unable to list {} ({error})", annotations.display()))
    })?;
    let mut current = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|error| {
            EnvironmentsError(format!("unable to list {} ({error})", annotations.display()))
        })?;
        current.insert(entry.file_name().to_string_lossy().into_owned());
    }
    let declared: BTreeSet<String> = declared_environment_names(config)?.into_iter().collect();

    let mut delta = EnvironmentsDelta {
        new: declared.difference(&current).cloned().collect(),
        deleted: current.difference(&declared).cloned().collect(),
        ..EnvironmentsDelta::default()
    };

    for environment in current.intersection(&declared) {
        // A missing or unreadable annotation counts as changed so the
        // environment gets rebuilt and the annotation rewritten.
        let stored = fs::read_to_string(config.annotation_path(environment)).ok();
        let fresh = git
            .hash_object(&config.environment_definition_path(environment))
            .map_err(|error| {
                EnvironmentsError(format!("unable to hash '{environment}' definition ({error})"))
            })?;
        if stored.as_deref() == Some(fresh.as_str()) {
            delta.notchanged.push(environment.clone());
        } else {
            delta.changed.push(environment.clone());
        }
    }

    Ok(delta)
}

/// Converge the environment tree: create what is newly declared, purge what
/// disappeared (unless protected), rebuild what changed and patch up the
/// rest with the repository delta of this run.
pub fn refresh_environments(
    config: &Config,
    git: &GitOps,
    repositories_deltas: &RepositoriesDelta,
    inventory: &Inventory,
) -> Result<(), EnvironmentsError> {
    debug!("Calculating delta...");
    let delta = calculate_delta(config, git)?;
    info!("New environments: {:?}", delta.new);
    info!("Existing and changed environments: {:?}", delta.changed);
    debug!("Existing but not changed environments: {:?}", delta.notchanged);
    info!("Deleted environments: {:?}", delta.deleted);

    info!("Creating new environments...");
    for environment in &delta.new {
        if let Err(error) = create_new_environment(config, git, environment, inventory) {
            error!("Failed to create environment '{environment}' ({error})");
        }
    }

    info!("Purging deleted environments...");
    for environment in &delta.deleted {
        if config.main.protectedenvironments.contains(environment) {
            warn!("Refusing to delete '{environment}' as it's protected");
            continue;
        }
        if let Err(error) = purge_deleted_environment(config, environment) {
            error!("Failed to purge environment '{environment}' ({error})");
        }
    }

    info!("Recreating changed environments...");
    for environment in &delta.changed {
        info!("Recreating environment '{environment}'");
        if let Err(error) = purge_deleted_environment(config, environment) {
            error!("Failed to purge environment '{environment}' ({error})");
            continue;
        }
        if let Err(error) = create_new_environment(config, git, environment, inventory) {
            error!("Failed to create environment '{environment}' ({error})");
        }
    }

    info!("Refreshing not changed environments...");
    refresh_notchanged_environments(config, &delta.notchanged, repositories_deltas);

    Ok(())
}

fn refresh_notchanged_environments(
    config: &Config,
    environments: &[String],
    repositories_deltas: &RepositoriesDelta,
) {
    let mapper = config.ref_mapper();
    for environment in environments {
        debug!("Refreshing environment '{environment}'...");
        let definition = match read_environment_definition(config, environment) {
            Ok(definition) => definition,
            Err(error) => {
                error!("Unable to read and parse '{environment}' definition ({error}). Skipping");
                continue;
            }
        };

        if definition.default.is_none() {
            debug!("Environment '{environment}' won't get new modules (no default)");
        } else {
            for module in &repositories_deltas.modules.new {
                if let Err(error) = link_module(config, &mapper, module, environment, &definition)
                {
                    error!("Failed to link module '{module}' in environment '{environment}' ({error})");
                }
            }
        }
        for module in &repositories_deltas.modules.deleted {
            debug!("Deleting module '{module}' from environment '{environment}'");
            unlink_module(config, module, environment);
        }

        if definition.default.is_none() {
            debug!("Environment '{environment}' won't get new hostgroups (no default)");
        } else {
            for hostgroup in &repositories_deltas.hostgroups.new {
                if let Err(error) =
                    link_hostgroup(config, &mapper, hostgroup, environment, &definition)
                {
                    error!(
                        "Failed to link hostgroup '{hostgroup}' in environment '{environment}' ({error})"
                    );
                }
            }
        }
        for hostgroup in &repositories_deltas.hostgroups.deleted {
            debug!("Deleting hostgroup '{hostgroup}' from environment '{environment}'");
            unlink_hostgroup(config, hostgroup, environment);
        }
    }
}

fn create_new_environment(
    config: &Config,
    git: &GitOps,
    environment: &str,
    inventory: &Inventory,
) -> Result<(), EnvironmentsError> {
    info!("Creating new environment '{environment}'");

    if !ENVIRONMENT_NAME.is_match(environment) {
        error!("Environment name '{environment}' is invalid. Skipping");
        return Ok(());
    }

    let definition = match read_environment_definition(config, environment) {
        Ok(definition) => definition,
        Err(error) => {
            error!("Unable to read and parse '{environment}' definition ({error}). Skipping");
            return Ok(());
        }
    };

    debug!("Creating directory structure...");
    let base = config.environment_path(environment);
    create_dir(&base)?;
    for directory in ["modules", "hostgroups", "hieradata"] {
        create_dir(&base.join(directory))?;
    }
    for directory in ["module_names", "hostgroups", "fqdns"] {
        create_dir(&base.join("hieradata").join(directory))?;
    }

    let mapper = config.ref_mapper();

    info!("Processing modules...");
    let mut modules: BTreeSet<&String> = inventory.modules.keys().collect();
    if definition.default.is_none() {
        let necessary: BTreeSet<&String> = definition.overrides.modules.keys().collect();
        modules = modules.intersection(&necessary).copied().collect();
    }
    for module in modules {
        if let Err(error) = link_module(config, &mapper, module, environment, &definition) {
            error!("Failed to link module '{module}' in environment '{environment}' ({error})");
        }
    }

    info!("Processing hostgroups...");
    let mut hostgroups: BTreeSet<&String> = inventory.hostgroups.keys().collect();
    if definition.default.is_none() {
        let necessary: BTreeSet<&String> = definition.overrides.hostgroups.keys().collect();
        hostgroups = hostgroups.intersection(&necessary).copied().collect();
    }
    for hostgroup in hostgroups {
        if let Err(error) = link_hostgroup(config, &mapper, hostgroup, environment, &definition) {
            error!("Failed to link hostgroup '{hostgroup}' in environment '{environment}' ({error})");
        }
    }

    info!("Processing site...");
    if let Err(error) = link_site(config, &mapper, environment, &definition) {
        error!("Failed to link site in environment '{environment}' ({error})");
    }

    info!("Processing common Hiera data...");
    if let Err(error) = link_common_hieradata(config, &mapper, environment, &definition) {
        error!("Failed to link common hieradata in environment '{environment}' ({error})");
    }

    if config.main.directory_environments
        && let Err(error) = write_configuration_file(config, environment, &definition)
    {
        error!("Failed to generate config file for environment '{environment}' ({error})");
    }

    annotate_environment(config, git, environment)
}

/// The branch an element of this environment should be linked to, already
/// turned into a clone directory name.
fn resolve_ref(
    mapper: &RefMapper,
    partition: Partition,
    element: &str,
    definition: &EnvironmentDefinition,
) -> String {
    let mut branch = "master";
    let mut overridden = false;
    if let Some(treeish) = definition.overrides.get(partition).get(element) {
        info!("{partition} '{element}' overridden to use treeish '{treeish}'");
        branch = treeish;
        overridden = true;
    }
    if !overridden && let Some(default) = &definition.default {
        branch = default;
    }
    mapper.refname_to_dirname(branch)
}

/// Create `link_name` pointing at `target`, with the target stored relative
/// to the link's parent so the environment tree stays relocatable. The target
/// is allowed to not exist yet.
fn link(target: &Path, link_name: &Path) -> Result<(), EnvironmentsError> {
    let parent = link_name.parent().ok_or_else(|| {
        EnvironmentsError(format!("link {} has no parent directory", link_name.display()))
    })?;
    let target = pathdiff::diff_paths(target, parent).ok_or_else(|| {
        EnvironmentsError(format!(
            "can't express {} relative to {}",
            target.display(),
            parent.display()
        ))
    })?;
    debug!("Linking {} to {}", link_name.display(), target.display());
    symlink(&target, link_name).map_err(|error| {
        EnvironmentsError(format!("unable to create link {} ({error})", link_name.display()))
    })
}

fn unlink(link_name: &Path) {
    debug!("Making sure link '{}' does not exist", link_name.display());
    if let Ok(metadata) = fs::symlink_metadata(link_name)
        && metadata.file_type().is_symlink()
    {
        let _ = fs::remove_file(link_name);
    }
}

fn link_module(
    config: &Config,
    mapper: &RefMapper,
    module: &str,
    environment: &str,
    definition: &EnvironmentDefinition,
) -> Result<(), EnvironmentsError> {
    let branch = resolve_ref(mapper, Partition::Modules, module, definition);
    debug!("Adding module '{module}' ({branch}) to environment '{environment}'");
    let clone = config.clone_path(Partition::Modules, module, &branch);
    let base = config.environment_path(environment);

    link(&clone.join("code"), &base.join("modules").join(module))?;
    link(
        &clone.join("data"),
        &base.join("hieradata").join("module_names").join(module),
    )
}

fn unlink_module(config: &Config, module: &str, environment: &str) {
    let base = config.environment_path(environment);
    unlink(&base.join("modules").join(module));
    unlink(&base.join("hieradata").join("module_names").join(module));
}

fn link_hostgroup(
    config: &Config,
    mapper: &RefMapper,
    hostgroup: &str,
    environment: &str,
    definition: &EnvironmentDefinition,
) -> Result<(), EnvironmentsError> {
    let branch = resolve_ref(mapper, Partition::Hostgroups, hostgroup, definition);
    debug!("Adding hostgroup '{hostgroup}' ({branch}) to environment '{environment}'");
    let clone = config.clone_path(Partition::Hostgroups, hostgroup, &branch);
    let base = config.environment_path(environment);

    link(
        &clone.join("code"),
        &base.join("hostgroups").join(format!("hg_{hostgroup}")),
    )?;
    link(
        &clone.join("data").join("hostgroup"),
        &base.join("hieradata").join("hostgroups").join(hostgroup),
    )?;
    link(
        &clone.join("data").join("fqdns"),
        &base.join("hieradata").join("fqdns").join(hostgroup),
    )
}

fn unlink_hostgroup(config: &Config, hostgroup: &str, environment: &str) {
    let base = config.environment_path(environment);
    unlink(&base.join("hostgroups").join(format!("hg_{hostgroup}")));
    unlink(&base.join("hieradata").join("hostgroups").join(hostgroup));
    unlink(&base.join("hieradata").join("fqdns").join(hostgroup));
}

fn link_site(
    config: &Config,
    mapper: &RefMapper,
    environment: &str,
    definition: &EnvironmentDefinition,
) -> Result<(), EnvironmentsError> {
    let branch = resolve_ref(mapper, Partition::Common, "site", definition);
    link(
        &config.clone_path(Partition::Common, "site", &branch).join("code"),
        &config.environment_path(environment).join("site"),
    )
}

fn link_common_hieradata(
    config: &Config,
    mapper: &RefMapper,
    environment: &str,
    definition: &EnvironmentDefinition,
) -> Result<(), EnvironmentsError> {
    let branch = resolve_ref(mapper, Partition::Common, "hieradata", definition);
    let data = config
        .clone_path(Partition::Common, "hieradata", &branch)
        .join("data");
    let base = config.environment_path(environment).join("hieradata");

    for element in &config.main.common_hieradata_items {
        link(&data.join(element), &base.join(element))?;
    }
    Ok(())
}

fn write_configuration_file(
    config: &Config,
    environment: &str,
    definition: &EnvironmentDefinition,
) -> Result<(), EnvironmentsError> {
    let path = config.environment_path(environment).join(CONF_FILENAME);
    let mut contents = String::from("modulepath = modules:hostgroups\nmanifest = site/site.pp\n");
    if let Some(parser) = definition.parser {
        contents.push_str(&format!("parser = {}\n", parser.as_str()));
    }
    fs::write(&path, contents).map_err(|error| {
        EnvironmentsError(format!("unable to write {} ({error})", path.display()))
    })
}

fn annotate_environment(
    config: &Config,
    git: &GitOps,
    environment: &str,
) -> Result<(), EnvironmentsError> {
    let definition = config.environment_definition_path(environment);
    let hash = git.hash_object(&definition).map_err(|error| {
        EnvironmentsError(format!("unable to hash '{environment}' definition ({error})"))
    })?;
    debug!("New cached hash for environment '{environment}' is '{hash}'");
    // If this write fails the environment is simply regenerated next run.
    fs::write(config.annotation_path(environment), &hash).map_err(|error| {
        EnvironmentsError(format!("unable to annotate '{environment}' ({error})"))
    })
}

fn remove_environment_annotation(config: &Config, environment: &str) {
    debug!("Removing cached hash for environment '{environment}'");
    match fs::remove_file(config.annotation_path(environment)) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!("No cached hash for environment '{environment}'");
        }
        Err(error) => {
            error!("Couldn't remove cached hash for environment '{environment}' ({error})");
        }
    }
}

fn purge_deleted_environment(config: &Config, environment: &str) -> Result<(), EnvironmentsError> {
    let base = config.environment_path(environment);
    info!("Deleting environment '{environment}'");
    match fs::remove_dir_all(&base) {
        Ok(()) => info!("Deleted '{}'", base.display()),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            return Err(EnvironmentsError(format!(
                "unable to delete {} ({error})",
                base.display()
            )));
        }
    }
    remove_environment_annotation(config, environment);
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), EnvironmentsError> {
    fs::create_dir(path).map_err(|error| {
        EnvironmentsError(format!("unable to create {} ({error})", path.display()))
    })
}
