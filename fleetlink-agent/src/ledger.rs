//! Execution ledger - durable, content-addressed record of dispatched artifacts
//!
//! ROLE:
//! - Every dispatched artifact is written to `<storage_dir>/<sha256 hex>`
//! - The index (creation time, storage path, name, status) lives in memory and
//!   is mirrored to a single JSON document, `execution-ledger.json`
//! - The index file is the only source of truth at startup: it is fully
//!   reloaded before the ledger accepts any mutation
//!
//! LOCKING:
//! One reader/writer lock guards the whole index. Reads take it shared,
//! mutations take it exclusive for their entire duration, file I/O included,
//! so the in-memory and on-disk index never diverge for longer than one call.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Name of the index document inside the storage directory
pub const INDEX_FILE_NAME: &str = "execution-ledger.json";

/// Errors returned by ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist ledger index {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("ledger index {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One persisted ledger entry (element of the JSON index array)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub creation_time_ns: i64,
    pub storage_path: PathBuf,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone)]
struct Entry {
    creation_time_ns: i64,
    name: String,
}

/// In-memory index. `entries` is keyed by storage path (hash -> name),
/// `statuses` by logical name (name -> status).
#[derive(Debug, Default)]
struct Index {
    entries: HashMap<PathBuf, Entry>,
    statuses: HashMap<String, String>,
    unpersisted: bool,
}

impl Index {
    fn from_records(records: Vec<ExecutionRecord>) -> Self {
        let mut index = Index::default();
        for record in records {
            index.statuses.insert(record.name.clone(), record.status);
            index.entries.insert(
                record.storage_path,
                Entry {
                    creation_time_ns: record.creation_time_ns,
                    name: record.name,
                },
            );
        }
        index
    }

    /// Records ordered by creation time, then path, so the document is stable
    fn records(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .entries
            .iter()
            .map(|(path, entry)| ExecutionRecord {
                creation_time_ns: entry.creation_time_ns,
                storage_path: path.clone(),
                name: entry.name.clone(),
                status: self.statuses.get(&entry.name).cloned().unwrap_or_default(),
            })
            .collect();
        records.sort_by(|a, b| {
            a.creation_time_ns
                .cmp(&b.creation_time_ns)
                .then_with(|| a.storage_path.cmp(&b.storage_path))
        });
        records
    }

    /// A name keeps its status only while some stored artifact still refers to it
    fn forget_if_orphaned(&mut self, name: &str) {
        if !self.entries.values().any(|entry| entry.name == name) {
            self.statuses.remove(name);
        }
    }
}

/// Content-addressed ledger of execution artifacts
pub struct ExecutionLedger {
    storage_dir: PathBuf,
    index_path: PathBuf,
    index: RwLock<Index>,
}

/// Returned by [`ExecutionLedger::update_status`]: the new status only lives in
/// memory until [`PendingPersist::persist`] (or [`ExecutionLedger::persist`]) runs.
#[must_use = "status updates are not durable until the ledger is persisted"]
pub struct PendingPersist<'a> {
    ledger: &'a ExecutionLedger,
}

impl PendingPersist<'_> {
    /// Write the index now
    pub fn persist(self) -> Result<(), LedgerError> {
        self.ledger.persist()
    }

    /// Keep batching; a later `persist` call will pick the change up
    pub fn defer(self) {}
}

/// Lower-case hex SHA-256 of the artifact bytes
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn unix_nanos(at: &DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp().saturating_mul(1_000_000_000))
}

impl ExecutionLedger {
    /// Open (or create) a ledger rooted at `storage_dir`, reloading its index
    pub fn open<P: Into<PathBuf>>(storage_dir: P) -> Result<Self, LedgerError> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir).map_err(|source| LedgerError::Io {
            path: storage_dir.clone(),
            source,
        })?;

        let index_path = storage_dir.join(INDEX_FILE_NAME);
        let records = Self::load_index(&index_path)?;
        info!(
            "execution ledger opened at {} with {} records",
            storage_dir.display(),
            records.len()
        );

        Ok(Self {
            storage_dir,
            index_path,
            index: RwLock::new(Index::from_records(records)),
        })
    }

    fn load_index(index_path: &Path) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let content = match fs::read(index_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no ledger index at {}, starting fresh", index_path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(LedgerError::Io {
                    path: index_path.to_path_buf(),
                    source,
                })
            }
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&content).map_err(|source| LedgerError::Corrupt {
            path: index_path.to_path_buf(),
            source,
        })
    }

    /// Directory holding the artifacts and the index
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Path of the JSON index document
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Storage path an artifact with these bytes lives at
    pub fn artifact_path(&self, content: &[u8]) -> PathBuf {
        self.storage_dir.join(digest(content))
    }

    /// Store the artifact bytes, record it and persist the index (write-through).
    ///
    /// Fails with `Io` when the artifact cannot be written, and with `Persist`
    /// when the index cannot; in the latter case the in-memory record stays.
    pub fn add(
        &self,
        name: &str,
        content: &[u8],
        created_at: DateTime<Utc>,
        status: &str,
    ) -> Result<(), LedgerError> {
        let mut index = self.index.write();

        let path = self.artifact_path(content);
        fs::write(&path, content).map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;

        let previous = index.entries.insert(
            path.clone(),
            Entry {
                creation_time_ns: unix_nanos(&created_at),
                name: name.to_string(),
            },
        );
        index.statuses.insert(name.to_string(), status.to_string());
        if let Some(previous) = previous {
            if previous.name != name {
                index.forget_if_orphaned(&previous.name);
            }
        }
        index.unpersisted = true;
        debug!("ledger add: {} -> {}", name, path.display());

        self.persist_locked(&mut index)
    }

    /// Forget the record for these bytes and persist. Artifact bytes stay on disk.
    pub fn remove(&self, content: &[u8]) -> Result<(), LedgerError> {
        let mut index = self.index.write();

        let path = self.artifact_path(content);
        if let Some(entry) = index.entries.remove(&path) {
            index.forget_if_orphaned(&entry.name);
            debug!("ledger remove: {} ({})", entry.name, path.display());
        } else {
            debug!("ledger remove: nothing recorded at {}", path.display());
        }
        index.unpersisted = true;

        self.persist_locked(&mut index)
    }

    /// Change the status of `name` in memory only.
    ///
    /// The returned token must be persisted (or explicitly deferred); this is
    /// how batched status updates followed by a single write are expressed.
    pub fn update_status(&self, name: &str, status: &str) -> Result<PendingPersist<'_>, LedgerError> {
        let mut index = self.index.write();
        let Some(current) = index.statuses.get_mut(name) else {
            return Err(LedgerError::NotFound(name.to_string()));
        };
        *current = status.to_string();
        index.unpersisted = true;
        Ok(PendingPersist { ledger: self })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index.read().statuses.contains_key(name)
    }

    pub fn get_status(&self, name: &str) -> Option<String> {
        self.index.read().statuses.get(name).cloned()
    }

    pub fn get_all_names_status(&self) -> HashMap<String, String> {
        self.index.read().statuses.clone()
    }

    /// Number of stored artifacts
    pub fn size(&self) -> usize {
        self.index.read().entries.len()
    }

    /// True while some in-memory change has not reached the index file
    pub fn has_unpersisted_changes(&self) -> bool {
        self.index.read().unpersisted
    }

    /// Creation time recorded for a storage path
    pub fn creation_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.index
            .read()
            .entries
            .get(path)
            .map(|entry| DateTime::from_timestamp_nanos(entry.creation_time_ns))
    }

    /// Storage path recorded with exactly this creation time
    pub fn path_at(&self, created_at: DateTime<Utc>) -> Option<PathBuf> {
        let wanted = unix_nanos(&created_at);
        self.index
            .read()
            .entries
            .iter()
            .find(|(_, entry)| entry.creation_time_ns == wanted)
            .map(|(path, _)| path.clone())
    }

    /// Logical name recorded for a storage path
    pub fn name_of(&self, path: &Path) -> Option<String> {
        self.index.read().entries.get(path).map(|entry| entry.name.clone())
    }

    /// Storage paths, oldest first
    pub fn all_paths(&self) -> Vec<PathBuf> {
        self.records().into_iter().map(|record| record.storage_path).collect()
    }

    pub fn all_names(&self) -> Vec<String> {
        self.index
            .read()
            .entries
            .values()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Snapshot of every record, oldest first
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.index.read().records()
    }

    /// Read back the stored bytes of the newest artifact recorded under `name`
    pub fn read_artifact(&self, name: &str) -> Result<Vec<u8>, LedgerError> {
        let path = {
            let index = self.index.read();
            index
                .entries
                .iter()
                .filter(|(_, entry)| entry.name == name)
                .max_by_key(|(_, entry)| entry.creation_time_ns)
                .map(|(path, _)| path.clone())
                .ok_or_else(|| LedgerError::NotFound(name.to_string()))?
        };
        fs::read(&path).map_err(|source| LedgerError::Io { path, source })
    }

    /// Write the full index to disk
    pub fn persist(&self) -> Result<(), LedgerError> {
        let mut index = self.index.write();
        self.persist_locked(&mut index)
    }

    /// Caller holds the write lock. The document goes to a sibling temp file
    /// first and is renamed over the index, so no reader sees half a document.
    fn persist_locked(&self, index: &mut Index) -> Result<(), LedgerError> {
        let persist_error = |source: io::Error| LedgerError::Persist {
            path: self.index_path.clone(),
            source,
        };

        let document = serde_json::to_vec_pretty(&index.records())
            .map_err(|e| persist_error(e.into()))?;
        let tmp_path = self.index_path.with_extension("json.tmp");
        fs::write(&tmp_path, &document).map_err(persist_error)?;
        fs::rename(&tmp_path, &self.index_path).map_err(|e| {
            error!("failed to replace ledger index {}: {}", self.index_path.display(), e);
            persist_error(e)
        })?;

        index.unpersisted = false;
        debug!("ledger index persisted ({} records)", index.entries.len());
        Ok(())
    }

    /// Delete the index document (ledger reset). Artifacts and memory are untouched.
    pub fn remove_mapping_file(&self) -> Result<(), LedgerError> {
        let _guard = self.index.write();
        info!("deleting {}", self.index_path.display());
        match fs::remove_file(&self.index_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!("failed to delete {}: {}", self.index_path.display(), source);
                Err(LedgerError::Io {
                    path: self.index_path.clone(),
                    source,
                })
            }
        }
    }
}
