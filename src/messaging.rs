//! The durable hint queue.
//!
//! The webhook producer and the reconciler communicate through a directory
//! queue: every hint is one JSON file `{time, data}` where `data` is a
//! serialized `{partition: [name, ...]}` mapping. Publishing stages the file
//! under `tmp/` and renames it into the queue root, so consumers never see a
//! half-written element. Dequeuing claims an element by creating a `.lck`
//! marker with `create_new`; elements claimed by somebody else are skipped,
//! never waited on.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::partition::{Partition, PerPartition};

#[derive(Debug)]
pub struct MessagingError(pub String);

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MessagingError {}

/// Repositories whose bares should be fetched in the next run, merged from
/// all drained messages. A partition nobody hinted at is an empty set.
pub type UpdateHints = PerPartition<BTreeSet<String>>;

impl PerPartition<BTreeSet<String>> {
    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, names)| names.is_empty())
    }

    pub fn len(&self) -> usize {
        self.iter().map(|(_, names)| names.len()).sum()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    time: String,
    data: String,
}

const LOCK_SUFFIX: &str = ".lck";

struct HintQueue {
    root: PathBuf,
}

impl HintQueue {
    /// The queue directory is created lazily on first access.
    fn open(config: &Config) -> Result<HintQueue, MessagingError> {
        let root = config.messaging.queuedir.clone();
        fs::create_dir_all(root.join("tmp"))
            .map_err(|error| MessagingError(format!("failed to create queue object ({error})")))?;
        Ok(HintQueue { root })
    }

    fn add(&self, message: &Message) -> Result<(), MessagingError> {
        let name = element_name();
        let staged = self.root.join("tmp").join(&name);
        let body = serde_json::to_vec(message)
            .map_err(|error| MessagingError(format!("failed to encode element ({error})")))?;
        fs::write(&staged, body)
            .map_err(|error| MessagingError(format!("failed to add element ({error})")))?;
        fs::rename(&staged, self.root.join(&name))
            .map_err(|error| MessagingError(format!("failed to add element ({error})")))?;
        Ok(())
    }

    /// Names of elements currently published, oldest first.
    fn element_names(&self) -> Result<Vec<String>, MessagingError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|error| MessagingError(format!("failed to list queue ({error})")))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|error| MessagingError(format!("failed to list queue ({error})")))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "tmp" || name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Dequeue every unlocked element. Elements locked by another consumer
    /// are skipped; elements whose payload doesn't decode are dropped.
    fn dequeue_all(&self) -> Result<Vec<Message>, MessagingError> {
        let mut messages = Vec::new();
        for name in self.element_names()? {
            let lock_path = self.root.join(format!("{name}{LOCK_SUFFIX}"));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {}
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    warn!("Element {name} was locked when dequeuing");
                    continue;
                }
                Err(error) => {
                    log::error!("I/O error when getting item {name} ({error})");
                    continue;
                }
            }

            let element_path = self.root.join(&name);
            let raw = fs::read(&element_path);
            let _ = fs::remove_file(&element_path);
            let _ = fs::remove_file(&lock_path);

            let raw = match raw {
                Ok(raw) => raw,
                Err(error) => {
                    log::error!("I/O error when getting item {name} ({error})");
                    continue;
                }
            };
            match serde_json::from_slice::<Message>(&raw) {
                Ok(message) => {
                    debug!("Message {name} extracted and decoded");
                    messages.push(message);
                }
                Err(_) => {
                    debug!("Couldn't decode item {name}. Will be ignored.");
                }
            }
        }
        Ok(messages)
    }

    fn count(&self) -> Result<usize, MessagingError> {
        Ok(self.element_names()?.len())
    }

    fn purge(&self) -> Result<(), MessagingError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|error| MessagingError(format!("failed to purge queue ({error})")))?;
        for entry in entries {
            let entry =
                entry.map_err(|error| MessagingError(format!("failed to purge queue ({error})")))?;
            if entry.file_name() == "tmp" {
                continue;
            }
            fs::remove_file(entry.path())
                .map_err(|error| MessagingError(format!("failed to purge queue ({error})")))?;
        }
        Ok(())
    }
}

/// Monotonic-enough element names: publish order survives a directory sort.
fn element_name() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{micros:016x}{:08x}{sequence:04x}", std::process::id())
}

/// Publish a hint that `partition/name` changed upstream.
pub fn enqueue_hint(config: &Config, partition: Partition, name: &str) -> Result<(), MessagingError> {
    let data = serde_json::json!({ partition.as_str(): [name] });
    let message = Message {
        time: Utc::now().to_rfc3339(),
        data: data.to_string(),
    };
    HintQueue::open(config)?.add(&message)?;
    info!("Hint '{partition}/{name}' added to the queue");
    Ok(())
}

/// Drain the queue and merge every valid hint into per-partition name sets.
pub fn fetch_update_hints(config: &Config) -> Result<UpdateHints, MessagingError> {
    info!("Getting and processing hints...");
    let messages = HintQueue::open(config)?
        .dequeue_all()
        .map_err(|error| MessagingError(format!("could not retrieve messages ({error})")))?;
    info!("{} messages found", messages.len());
    Ok(validate_and_merge_messages(messages))
}

pub fn count_pending_hints(config: &Config) -> Result<usize, MessagingError> {
    HintQueue::open(config)?.count()
}

pub fn purge_queue(config: &Config) -> Result<(), MessagingError> {
    HintQueue::open(config)?.purge()
}

fn validate_and_merge_messages(messages: Vec<Message>) -> UpdateHints {
    let mut hints = UpdateHints::default();
    for message in messages {
        let time = &message.time;
        let map = match serde_json::from_str::<serde_json::Value>(&message.data) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                warn!("Discarding message ({time}): bad data section");
                continue;
            }
        };
        for (key, value) in &map {
            let Ok(partition) = key.parse::<Partition>() else {
                warn!("Discarding message ({time}): unknown partition '{key}'");
                continue;
            };
            let Some(items) = value.as_array() else {
                warn!("Discarding message ({time}): value '{value}' is not a list");
                continue;
            };
            for item in items {
                match item.as_str() {
                    Some(name) => {
                        debug!("Accepted message {partition}:{name} created at {time}");
                        hints.get_mut(partition).insert(name.to_string());
                    }
                    None => {
                        warn!("Discarding item '{item}' in ({time} - {partition}): not a string");
                    }
                }
            }
        }
    }
    hints
}
