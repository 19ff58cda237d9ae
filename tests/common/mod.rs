// Helpers are shared across suites; not every suite uses every one.
#![allow(dead_code)]

//! Test harness: a sandboxed on-disk layout plus upstream git repositories.
//!
//! Every test gets a fresh temporary directory holding the full tree the
//! reconciler expects (bare/clone/cache/environments roots, metadata
//! directories, lock and queue directories) and a place to grow "upstream"
//! repositories to clone from. Git runs with an isolated environment so user
//! and system configuration can't leak into test behavior.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use librarian::config::Config;
use librarian::environments;
use librarian::git::GitOps;
use librarian::inventory;
use librarian::locks::RunLock;
use librarian::messaging::UpdateHints;
use librarian::partition::{Partition, PerPartition};
use librarian::repos::{self, RepositoriesDelta};

/// Run git in `dir` with a hermetic environment and panic on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.org")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.org")
        .output()
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub struct Sandbox {
    tmp: TempDir,
    pub config: Config,
    manifest: PerPartition<BTreeMap<String, String>>,
}

impl Sandbox {
    pub fn new() -> Sandbox {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();

        let mut config = Config::default();
        config.main.baredir = root.join("bare");
        config.main.clonedir = root.join("clone");
        config.main.cachedir = root.join("cache");
        config.main.environmentsdir = root.join("environments");
        config.main.repositorymetadatadir = root.join("metadata/repositories");
        config.main.repositorymetadata = root.join("metadata/repositories/repositories.yaml");
        config.main.environmentsmetadatadir = root.join("metadata/environments");
        config.filelock.lockdir = root.join("locks");
        config.messaging.queuedir = root.join("queue");

        for partition in Partition::ALL {
            fs::create_dir_all(config.main.baredir.join(partition.as_str())).unwrap();
            fs::create_dir_all(config.main.clonedir.join(partition.as_str())).unwrap();
        }
        fs::create_dir_all(config.main.cachedir.join("environments")).unwrap();
        fs::create_dir_all(&config.main.environmentsdir).unwrap();
        fs::create_dir_all(&config.main.repositorymetadatadir).unwrap();
        fs::create_dir_all(&config.main.environmentsmetadatadir).unwrap();
        fs::create_dir_all(&config.filelock.lockdir).unwrap();
        fs::create_dir_all(root.join("upstream")).unwrap();

        let sandbox = Sandbox {
            tmp,
            config,
            manifest: PerPartition::default(),
        };
        sandbox.write_manifest();
        sandbox
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    // ---- upstream repositories ------------------------------------------

    /// Create an upstream repository with `code/` and `data/` content and
    /// the given branches (the first one is where the initial commit lands).
    pub fn create_upstream(&self, partition: Partition, name: &str, branches: &[&str]) -> PathBuf {
        let path = self.root().join("upstream").join(partition.as_str()).join(name);
        fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "--quiet"]);
        git(&path, &["symbolic-ref", "HEAD", &format!("refs/heads/{}", branches[0])]);

        fs::create_dir_all(path.join("code")).unwrap();
        fs::write(path.join("code").join("init.pp"), format!("# {name}\n")).unwrap();
        fs::create_dir_all(path.join("data").join("hostgroup")).unwrap();
        fs::create_dir_all(path.join("data").join("fqdns")).unwrap();
        fs::write(path.join("data").join("common.yaml"), "---\n").unwrap();
        fs::write(path.join("data").join("hostgroup").join("values.yaml"), "---\n").unwrap();
        fs::write(path.join("data").join("fqdns").join("values.yaml"), "---\n").unwrap();

        git(&path, &["add", "-A"]);
        git(&path, &["commit", "-q", "-m", "Initial import"]);
        for branch in &branches[1..] {
            git(&path, &["branch", branch]);
        }
        path
    }

    /// Upstream repository carrying both mandatory branches.
    pub fn create_repository(&self, partition: Partition, name: &str) -> PathBuf {
        self.create_upstream(partition, name, &["master", "qa"])
    }

    pub fn upstream_path(&self, partition: Partition, name: &str) -> PathBuf {
        self.root().join("upstream").join(partition.as_str()).join(name)
    }

    /// Commit something new on `branch` and return the new SHA.
    pub fn add_commit(&self, partition: Partition, name: &str, branch: &str) -> String {
        let path = self.upstream_path(partition, name);
        git(&path, &["checkout", "-q", branch]);
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        fs::write(path.join("code").join("extra.pp"), format!("# {stamp}\n")).unwrap();
        git(&path, &["add", "-A"]);
        git(&path, &["commit", "-q", "-m", "Update"]);
        self.upstream_sha(partition, name, branch)
    }

    pub fn upstream_sha(&self, partition: Partition, name: &str, branch: &str) -> String {
        let path = self.upstream_path(partition, name);
        git(&path, &["rev-parse", branch]).trim().to_string()
    }

    pub fn delete_upstream_branch(&self, partition: Partition, name: &str, branch: &str) {
        let path = self.upstream_path(partition, name);
        git(&path, &["branch", "-q", "-D", branch]);
    }

    // ---- manifest --------------------------------------------------------

    pub fn declare(&mut self, partition: Partition, name: &str) {
        let url = self.upstream_path(partition, name);
        self.manifest
            .get_mut(partition)
            .insert(name.to_string(), url.to_string_lossy().into_owned());
        self.write_manifest();
    }

    pub fn undeclare(&mut self, partition: Partition, name: &str) {
        self.manifest.get_mut(partition).remove(name);
        self.write_manifest();
    }

    fn write_manifest(&self) {
        let mut out = String::from("repositories:\n");
        for (partition, mapping) in self.manifest.iter() {
            if mapping.is_empty() {
                out.push_str(&format!("  {partition}: {{}}\n"));
                continue;
            }
            out.push_str(&format!("  {partition}:\n"));
            for (name, url) in mapping {
                out.push_str(&format!("    {name}: {url}\n"));
            }
        }
        fs::write(&self.config.main.repositorymetadata, out).unwrap();
    }

    // ---- environments ----------------------------------------------------

    /// Declare an environment definition; overrides are
    /// `(partition, element, treeish)` triples.
    pub fn declare_environment(
        &self,
        name: &str,
        default: Option<&str>,
        overrides: &[(Partition, &str, &str)],
    ) {
        let mut out = String::from("notifications: admin@example.org\n");
        if let Some(default) = default {
            out.push_str(&format!("default: {default}\n"));
        }
        if !overrides.is_empty() {
            out.push_str("overrides:\n");
            for partition in Partition::ALL {
                let entries: Vec<_> = overrides
                    .iter()
                    .filter(|(candidate, _, _)| *candidate == partition)
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                out.push_str(&format!("  {partition}:\n"));
                for (_, element, treeish) in entries {
                    out.push_str(&format!("    {element}: {treeish}\n"));
                }
            }
        }
        self.write_environment(name, &out);
    }

    pub fn write_environment(&self, name: &str, yaml: &str) {
        fs::write(self.config.environment_definition_path(name), yaml).unwrap();
    }

    pub fn undeclare_environment(&self, name: &str) {
        fs::remove_file(self.config.environment_definition_path(name)).unwrap();
    }

    // ---- running ---------------------------------------------------------

    /// One reconciliation pass over repositories and environments, the same
    /// sequence the update driver runs after the metadata refresh.
    pub fn update(&self) -> RepositoriesDelta {
        self.update_with_hints(None)
    }

    pub fn update_with_hints(&self, hints: Option<&UpdateHints>) -> RepositoriesDelta {
        let git = GitOps::new(&self.config);
        let lock = RunLock::from_config(&self.config, 1, Duration::from_secs(0));
        let guard = lock.acquire().expect("run lock");

        let mut inventory = inventory::get_inventory(&self.config).expect("inventory");
        let desired = inventory::get_desired_inventory(&self.config).expect("desired inventory");
        let deltas = repos::refresh_repositories(
            &self.config,
            &git,
            &guard,
            &mut inventory,
            &desired,
            hints,
        )
        .expect("repository reconciliation");
        environments::refresh_environments(&self.config, &git, &deltas, &inventory)
            .expect("environment reconciliation");
        inventory::persist_inventory(&self.config, &inventory).expect("persist inventory");
        deltas
    }

    pub fn hints(entries: &[(Partition, &str)]) -> UpdateHints {
        let mut hints = UpdateHints::default();
        for (partition, name) in entries {
            hints.get_mut(*partition).insert(name.to_string());
        }
        hints
    }

    // ---- assertions ------------------------------------------------------

    pub fn assert_bare(&self, partition: Partition, name: &str) {
        let path = self.config.bare_path(partition, name);
        assert!(path.is_dir(), "expected bare at {}", path.display());
    }

    pub fn assert_no_bare(&self, partition: Partition, name: &str) {
        let path = self.config.bare_path(partition, name);
        assert!(!path.exists(), "unexpected bare at {}", path.display());
    }

    pub fn assert_clone(&self, partition: Partition, name: &str, dirname: &str) {
        let path = self.config.clone_path(partition, name, dirname);
        assert!(path.is_dir(), "expected clone at {}", path.display());
        assert!(
            path.join("code").is_dir(),
            "clone {} has no code directory",
            path.display()
        );
    }

    pub fn assert_no_clone(&self, partition: Partition, name: &str, dirname: &str) {
        let path = self.config.clone_path(partition, name, dirname);
        assert!(!path.exists(), "unexpected clone at {}", path.display());
    }

    pub fn clone_head(&self, partition: Partition, name: &str, dirname: &str) -> String {
        let path = self.config.clone_path(partition, name, dirname);
        GitOps::new(&self.config)
            .get_head(&path, false)
            .expect("clone HEAD")
    }

    /// Assert a symlink exists, stores a relative target, and resolves to
    /// `target` (which must exist).
    pub fn assert_link_resolves(&self, link: &Path, target: &Path) {
        let stored = fs::read_link(link)
            .unwrap_or_else(|error| panic!("no symlink at {} ({error})", link.display()));
        assert!(
            stored.is_relative(),
            "link {} stores an absolute target {}",
            link.display(),
            stored.display()
        );
        let resolved = fs::canonicalize(link)
            .unwrap_or_else(|error| panic!("broken link at {} ({error})", link.display()));
        let expected = fs::canonicalize(target)
            .unwrap_or_else(|error| panic!("missing target {} ({error})", target.display()));
        assert_eq!(resolved, expected, "link {} mis-targeted", link.display());
    }

    pub fn assert_is_symlink(&self, link: &Path) {
        let metadata = fs::symlink_metadata(link)
            .unwrap_or_else(|error| panic!("no symlink at {} ({error})", link.display()));
        assert!(metadata.file_type().is_symlink());
    }

    pub fn environment_dir(&self, name: &str) -> PathBuf {
        self.config.environment_path(name)
    }

    pub fn annotation(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.config.annotation_path(name)).ok()
    }

    /// Assert the module symlink of `environment` points at the clone of
    /// `dirname` for `module`.
    pub fn assert_module_link(&self, environment: &str, module: &str, dirname: &str) {
        self.assert_link_resolves(
            &self.environment_dir(environment).join("modules").join(module),
            &self
                .config
                .clone_path(Partition::Modules, module, dirname)
                .join("code"),
        );
        self.assert_link_resolves(
            &self
                .environment_dir(environment)
                .join("hieradata")
                .join("module_names")
                .join(module),
            &self
                .config
                .clone_path(Partition::Modules, module, dirname)
                .join("data"),
        );
    }

    pub fn assert_hostgroup_link(&self, environment: &str, hostgroup: &str, dirname: &str) {
        let clone = self.config.clone_path(Partition::Hostgroups, hostgroup, dirname);
        let base = self.environment_dir(environment);
        self.assert_link_resolves(
            &base.join("hostgroups").join(format!("hg_{hostgroup}")),
            &clone.join("code"),
        );
        self.assert_link_resolves(
            &base.join("hieradata").join("hostgroups").join(hostgroup),
            &clone.join("data").join("hostgroup"),
        );
        self.assert_link_resolves(
            &base.join("hieradata").join("fqdns").join(hostgroup),
            &clone.join("data").join("fqdns"),
        );
    }
}
