//! Metadata refresh and startup validation against real git clones.

mod common;

use std::fs;
use std::path::PathBuf;

use common::{Sandbox, git};
use librarian::git::GitOps;
use librarian::maintenance::{gc_repositories, refresh_metadata, validate_directories};
use librarian::partition::Partition;

/// Replace the sandbox's plain metadata directories with clones of freshly
/// created origin repositories, the way a deployment would have them.
fn setup_metadata_origins(sandbox: &Sandbox) -> (PathBuf, PathBuf) {
    let root = sandbox.root();

    let repo_origin = root.join("origin/repositories");
    fs::create_dir_all(&repo_origin).unwrap();
    git(&repo_origin, &["init", "-q"]);
    git(&repo_origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
    fs::write(
        repo_origin.join("repositories.yaml"),
        "repositories:\n  modules: {}\n  hostgroups: {}\n  common: {}\n",
    )
    .unwrap();
    git(&repo_origin, &["add", "-A"]);
    git(&repo_origin, &["commit", "-q", "-m", "Initial manifest"]);

    let env_origin = root.join("origin/environments");
    fs::create_dir_all(&env_origin).unwrap();
    git(&env_origin, &["init", "-q"]);
    git(&env_origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
    fs::write(
        env_origin.join("production.yaml"),
        "notifications: admin@example.org\ndefault: master\n",
    )
    .unwrap();
    git(&env_origin, &["add", "-A"]);
    git(&env_origin, &["commit", "-q", "-m", "Initial environments"]);

    let config = &sandbox.config;
    fs::remove_dir_all(&config.main.repositorymetadatadir).unwrap();
    fs::remove_dir_all(&config.main.environmentsmetadatadir).unwrap();
    git(
        root,
        &[
            "clone",
            "-q",
            repo_origin.to_str().unwrap(),
            config.main.repositorymetadatadir.to_str().unwrap(),
        ],
    );
    git(
        root,
        &[
            "clone",
            "-q",
            env_origin.to_str().unwrap(),
            config.main.environmentsmetadatadir.to_str().unwrap(),
        ],
    );

    (repo_origin, env_origin)
}

#[test]
fn refresh_pulls_both_metadata_clones_forward() {
    let sandbox = Sandbox::new();
    let (repo_origin, env_origin) = setup_metadata_origins(&sandbox);
    let config = &sandbox.config;
    let git_ops = GitOps::new(config);

    fs::write(
        repo_origin.join("repositories.yaml"),
        "repositories:\n  modules:\n    foo: /upstream/foo\n  hostgroups: {}\n  common: {}\n",
    )
    .unwrap();
    git(&repo_origin, &["add", "-A"]);
    git(&repo_origin, &["commit", "-q", "-m", "Add foo"]);

    fs::write(
        env_origin.join("qa.yaml"),
        "notifications: admin@example.org\ndefault: qa\n",
    )
    .unwrap();
    git(&env_origin, &["add", "-A"]);
    git(&env_origin, &["commit", "-q", "-m", "Add qa environment"]);

    refresh_metadata(config, &git_ops).unwrap();

    let manifest = fs::read_to_string(&config.main.repositorymetadata).unwrap();
    assert!(manifest.contains("foo: /upstream/foo"));
    assert!(config.environment_definition_path("qa").is_file());
}

#[test]
fn refresh_discards_local_drift() {
    let sandbox = Sandbox::new();
    let (_repo_origin, _env_origin) = setup_metadata_origins(&sandbox);
    let config = &sandbox.config;
    let git_ops = GitOps::new(config);

    // Somebody scribbled over the local checkout; a refresh resets it.
    fs::write(&config.main.repositorymetadata, "repositories: broken\n").unwrap();
    refresh_metadata(config, &git_ops).unwrap();

    let manifest = fs::read_to_string(&config.main.repositorymetadata).unwrap();
    assert!(manifest.contains("modules: {}"));
}

#[test]
fn refresh_fails_without_an_upstream() {
    let sandbox = Sandbox::new();
    // Plain directories, not git clones.
    let config = &sandbox.config;
    let git_ops = GitOps::new(config);
    assert!(refresh_metadata(config, &git_ops).is_err());
}

#[test]
fn validation_checks_the_whole_layout() {
    let sandbox = Sandbox::new();
    setup_metadata_origins(&sandbox);
    validate_directories(&sandbox.config).unwrap();

    // A missing partition root is fatal.
    fs::remove_dir_all(sandbox.config.main.baredir.join("common")).unwrap();
    let error = validate_directories(&sandbox.config).unwrap_err();
    assert!(error.to_string().contains("does not exist"));
}

#[test]
fn validation_requires_initialized_metadata() {
    let sandbox = Sandbox::new();
    // Directories exist but the environments dir is not a git clone.
    let error = validate_directories(&sandbox.config).unwrap_err();
    assert!(error.to_string().contains("not initialized"));
}

#[test]
fn gc_sweeps_bares_and_clones() {
    let mut sandbox = Sandbox::new();
    sandbox.create_repository(Partition::Modules, "foo");
    sandbox.declare(Partition::Modules, "foo");
    sandbox.update();

    let git_ops = GitOps::new(&sandbox.config);
    gc_repositories(&sandbox.config, &git_ops, false).unwrap();
    sandbox.assert_clone(Partition::Modules, "foo", "master");
}
