//! The GitLab webhook producer.
//!
//! A tiny write-only endpoint, run as its own process next to the
//! reconciler: a push notification comes in, the repository manifest is read
//! under a shared lock (the reconciler hard-resets it under the exclusive
//! one), the `git_ssh_url` is matched against the declared repositories and
//! a hint is queued for the next run. Exact URL matches always win; fuzzy
//! namespace/repo tail matching only applies to configured prefixes.

use std::fs::File;
use std::io::Read;
use std::sync::LazyLock;

use log::{debug, error, info};
use regex::Regex;
use tiny_http::{Method, Request, Response, Server};

use crate::config::Config;
use crate::manifest::Manifest;
use crate::messaging;
use crate::partition::Partition;

/// The trailing `<namespace>/<repo>` segment of a repository URL.
static NAMESPACE_AND_REPO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+\w.]+/[-+\w.]+$").expect("namespace/repo regex"));

fn git_url_match_fuzzy(config: &Config, hook_url: &str, metadata_url: &str) -> bool {
    for prefix in &config.gitlabproducer.fuzzy_url_prefixes {
        if hook_url.starts_with(prefix)
            && let (Some(hook), Some(metadata)) = (
                NAMESPACE_AND_REPO.find(hook_url),
                NAMESPACE_AND_REPO.find(metadata_url),
            )
        {
            return hook.as_str() == metadata.as_str();
        }
    }
    false
}

/// Find the `(partition, name)` a hook URL refers to. The whole manifest is
/// scanned for an exact match before any fuzzy matching is attempted.
fn find_repository(config: &Config, manifest: &Manifest, url: &str) -> Option<(Partition, String)> {
    for (partition, mapping) in manifest.repositories.iter() {
        for (name, metadata_url) in mapping {
            if url == metadata_url {
                return Some((partition, name.clone()));
            }
        }
    }
    for (partition, mapping) in manifest.repositories.iter() {
        for (name, metadata_url) in mapping {
            if git_url_match_fuzzy(config, url, metadata_url) {
                return Some((partition, name.clone()));
            }
        }
    }
    None
}

/// Read the manifest under a shared advisory lock, so a concurrent metadata
/// reset can't hand us a torn file.
fn read_manifest(config: &Config) -> Result<Manifest, String> {
    let path = &config.main.repositorymetadata;
    let mut file =
        File::open(path).map_err(|error| format!("could not read '{}' ({error})", path.display()))?;
    file.lock_shared()
        .map_err(|error| format!("could not lock '{}' ({error})", path.display()))?;
    let mut raw = String::new();
    let read = file.read_to_string(&mut raw);
    let _ = file.unlock();
    read.map_err(|error| format!("could not read '{}' ({error})", path.display()))?;
    Manifest::parse(&raw).map_err(|error| format!("could not parse '{}' ({error})", path.display()))
}

/// Handle one `POST /gitlab` payload; returns the status code and body.
pub fn handle_gitlab(config: &Config, token: Option<&str>, body: &[u8]) -> (u16, &'static str) {
    if let Some(secret) = &config.gitlabproducer.secret_token
        && token != Some(secret.as_str())
    {
        error!("Token missing or mismatched");
        return (401, "Unauthorized");
    }

    let payload: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
    debug!("Incoming request with payload: {payload}");
    let Some(url) = payload
        .get("repository")
        .and_then(|repository| repository.get("git_ssh_url"))
        .and_then(|url| url.as_str())
    else {
        error!("Malformed payload ({payload})");
        return (400, "Malformed request");
    };

    let manifest = match read_manifest(config) {
        Ok(manifest) => manifest,
        Err(error) => {
            error!("Unexpected error ({error})");
            return (500, "Internal Server Error!");
        }
    };

    match find_repository(config, &manifest, url) {
        Some((partition, name)) => match messaging::enqueue_hint(config, partition, &name) {
            Ok(()) => (200, "OK"),
            Err(error) => {
                error!("{partition}/{name} couldn't be added to the queue ({error})");
                (500, "Queue not accessible")
            }
        },
        None => {
            error!("'{url}' couldn't be found in repositories");
            (404, "Repository not found")
        }
    }
}

fn route(config: &Config, request: &mut Request) -> (u16, &'static str) {
    if *request.method() != Method::Post || request.url() != "/gitlab" {
        return (404, "Not Found");
    }
    let token = request
        .headers()
        .iter()
        .find(|header| header.field.equiv("X-Gitlab-Token"))
        .map(|header| header.value.as_str().to_string());
    let mut body = Vec::new();
    if request.as_reader().read_to_end(&mut body).is_err() {
        return (400, "Malformed request");
    }
    handle_gitlab(config, token.as_deref(), &body)
}

/// Accept webhook deliveries until the process is killed.
pub fn serve(config: &Config, address: &str) -> anyhow::Result<()> {
    let server = Server::http(address)
        .map_err(|error| anyhow::anyhow!("unable to listen on {address} ({error})"))?;
    info!("Accepting webhooks on {address}");
    for mut request in server.incoming_requests() {
        let (status, body) = route(config, &mut request);
        let response = Response::from_string(body).with_status_code(status);
        if let Err(error) = request.respond(response) {
            error!("Unable to respond ({error})");
        }
    }
    Ok(())
}
