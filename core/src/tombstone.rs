//! Tombstone store: per-peer lifecycle records in a shared graveyard.
//!
//! Each supervised process owns exactly one tombstone file at
//! `${graveyard}/${name}` and writes it twice over its lifetime: once at
//! birth and once at death. Peers' tombstones are read-only. The file is
//! a small YAML document so operators can inspect a graveyard with `cat`:
//!
//! ```yaml
//! born: 2021-10-15T07:44:37.967Z
//! died: 2021-10-15T07:44:50.693Z
//! exitCode: 0
//! ```
//!
//! [`watch`] subscribes to filesystem notifications on the graveyard and
//! drives an [`EventHandler`] for every create/write event. Delivery is
//! at-least-once and events may coalesce, so handlers re-read the file
//! and must be idempotent.

use crate::error::{CoreError, Result};
use crate::event::Trace;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// The serialized lifecycle fields of a tombstone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Record {
    #[serde(skip_serializing_if = "Option::is_none")]
    born: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    died: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Lifecycle record for one supervised process, keyed by
/// `(graveyard, name)`.
pub struct Tombstone {
    graveyard: PathBuf,
    name: String,
    record: Mutex<Record>,
    /// One write at a time, so a reader never observes a torn file
    /// written by our own process.
    file_lock: AsyncMutex<()>,
    trace: Trace,
}

impl Tombstone {
    pub fn new(graveyard: impl Into<PathBuf>, name: impl Into<String>, trace: Trace) -> Self {
        Self {
            graveyard: graveyard.into(),
            name: name.into(),
            record: Mutex::new(Record::default()),
            file_lock: AsyncMutex::new(()),
            trace,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.graveyard.join(&self.name)
    }

    pub fn born(&self) -> Option<DateTime<Utc>> {
        self.record.lock().born
    }

    pub fn died(&self) -> Option<DateTime<Utc>> {
        self.record.lock().died
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.record.lock().exit_code
    }

    /// Serialize the record and replace the tombstone file with it.
    ///
    /// The graveyard directory is created if missing. The document is
    /// rendered to an in-memory buffer first and written with a single
    /// call, so concurrent readers see either the previous contents or
    /// the new ones in full.
    pub async fn write(&self) -> Result<()> {
        let _write = self.file_lock.lock().await;

        tokio::fs::create_dir_all(&self.graveyard).await?;

        let buf = {
            let record = self.record.lock().clone();
            serde_yaml::to_string(&record).map_err(CoreError::TombstoneSerialize)?
        };
        tokio::fs::write(self.path(), buf).await?;
        Ok(())
    }

    /// Record that the child has been successfully spawned.
    pub async fn record_birth(&self) -> Result<()> {
        self.record.lock().born = Some(Utc::now());

        self.trace
            .add_event(format!("Creating tombstone: {}", self.path().display()));
        self.write()
            .await
            .map_err(|err| err.context("failed to create tombstone"))
    }

    /// Record that the child has exited with the given code.
    pub async fn record_death(&self, exit_code: i32) -> Result<()> {
        {
            let mut record = self.record.lock();
            record.died = Some(Utc::now());
            record.exit_code = Some(exit_code);
        }

        self.trace
            .add_event(format!("Updating tombstone: {}", self.path().display()));
        self.write()
            .await
            .map_err(|err| err.context("failed to update tombstone"))
    }
}

impl std::fmt::Debug for Tombstone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.lock();
        f.debug_struct("Tombstone")
            .field("graveyard", &self.graveyard)
            .field("name", &self.name)
            .field("born", &record.born)
            .field("died", &record.died)
            .field("exit_code", &record.exit_code)
            .finish()
    }
}

/// Read and deserialize a peer's tombstone from a graveyard.
///
/// Fails with [`CoreError::TombstoneNotFound`] if the file does not yet
/// exist and [`CoreError::MalformedTombstone`] if it does not parse.
/// Unknown fields are tolerated.
pub async fn read(graveyard: &Path, name: &str) -> Result<Tombstone> {
    let tombstone = Tombstone::new(graveyard, name, Trace::noop());
    let path = tombstone.path();

    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::TombstoneNotFound(path));
        }
        Err(err) => return Err(err.into()),
    };

    let record: Record = serde_yaml::from_str(&contents)
        .map_err(|source| CoreError::MalformedTombstone { path, source })?;
    *tombstone.record.lock() = record;
    Ok(tombstone)
}

/// Handler invoked for each create/write event observed in a graveyard.
///
/// Delivery is at-least-once; implementations must be idempotent. Errors
/// are recorded to the trace and do not terminate the watch.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, trace: &Trace, event: &Event) -> Result<()>;
}

/// Watch a graveyard and invoke `handler` for each create/write event.
///
/// The watcher runs on its own task until `shutdown` is cancelled, the
/// notification channel closes, or a fatal watcher error occurs. A
/// failure to register the graveyard with the OS watcher is returned
/// synchronously.
pub fn watch(
    graveyard: &Path,
    handler: Arc<dyn EventHandler>,
    shutdown: Shutdown,
    trace: Trace,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    // The callback runs on the notify worker thread; an unbounded sender
    // keeps it non-blocking.
    let mut watcher =
        notify::recommended_watcher(move |result: std::result::Result<Event, notify::Error>| {
            let _ = tx.send(result);
        })?;
    watcher.watch(graveyard, RecursiveMode::NonRecursive)?;

    let graveyard = graveyard.to_path_buf();
    tokio::spawn(async move {
        // Owned by the task so the OS watch is released on every exit path.
        let _watcher = watcher;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    trace.add_event(format!("Tombstone Watch({}): done", graveyard.display()));
                    return;
                }
                item = rx.recv() => match item {
                    None => return,
                    Some(Ok(event)) => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        if let Err(err) = handler.handle(&trace, &event).await {
                            trace.add_event(format!("Handler error: {err}"));
                        }
                    }
                    Some(Err(err)) => {
                        trace.add_event(format!(
                            "Tombstone Watch({}): error: {err}",
                            graveyard.display()
                        ));
                    }
                },
            }
        }
    });

    Ok(())
}
