//! The endpoint override table.
//!
//! Operators can pin any lookup key (domain or literal IP) to a fixed
//! target host; the resolver treats a matching row as authoritative and
//! never queries DNS for it. Keys are normalized so that `Example.COM.`,
//! `[1.2.3.4]` and `ipv6:::1` all land on the row an operator would
//! expect.

use std::path::PathBuf;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical form of a lookup key: brackets and the `ipv6:` tag stripped,
/// lower-cased, at most one trailing dot removed.
pub fn normalize_key(key: &str) -> String {
    let key = key.trim();
    let key = key.strip_prefix('[').unwrap_or(key);
    let key = key.strip_suffix(']').unwrap_or(key);
    let key = key.to_ascii_lowercase();
    let key = key.strip_prefix("ipv6:").unwrap_or(&key);
    let key = key.strip_suffix('.').unwrap_or(key);
    key.to_owned()
}

/// One persisted override row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    /// Normalized lookup key.
    pub key: String,
    /// Target host, passed to connection establishment verbatim. May carry
    /// a port (`host:port`, `[v6]:port`).
    pub target: String,
    /// Free-form operator note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl OverrideEntry {
    pub fn new(key: &str, target: impl Into<String>) -> Self {
        Self {
            key: normalize_key(key),
            target: target.into(),
            comment: None,
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("override store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("override store is not valid RON: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("override store could not be serialized: {0}")]
    Serialize(#[from] ron::Error),
}

/// CRUD over the override table. Implementations normalize keys on every
/// operation, so callers may pass raw operator input.
pub trait OverrideStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<OverrideEntry>, StoreError>;

    fn set(&self, entry: OverrideEntry) -> Result<(), StoreError>;

    /// Returns whether a row existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All rows, ordered by key.
    fn list(&self) -> Result<Vec<OverrideEntry>, StoreError>;
}

/// A purely in-memory table, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryOverrideStore {
    entries: DashMap<String, OverrideEntry>,
}

impl MemoryOverrideStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverrideStore for MemoryOverrideStore {
    fn get(&self, key: &str) -> Result<Option<OverrideEntry>, StoreError> {
        Ok(self
            .entries
            .get(&normalize_key(key))
            .map(|entry| entry.clone()))
    }

    fn set(&self, mut entry: OverrideEntry) -> Result<(), StoreError> {
        entry.key = normalize_key(&entry.key);
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(&normalize_key(key)).is_some())
    }

    fn list(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

/// An override table persisted as a RON file.
///
/// The whole table is loaded at open and mirrored in memory; mutations
/// rewrite the file through a temporary-then-rename step so a crash never
/// leaves a half-written table behind.
#[derive(Debug)]
pub struct FileOverrideStore {
    path: PathBuf,
    entries: DashMap<String, OverrideEntry>,
    write_lock: Mutex<()>,
}

impl FileOverrideStore {
    /// Opens the table at `path`, creating an empty one if the file does
    /// not exist yet.
    ///
    /// # Errors
    /// I/O failure other than the file missing, or a file that is not a
    /// valid table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let rows: Vec<OverrideEntry> = ron::from_str(&text)?;
                for mut row in rows {
                    row.key = normalize_key(&row.key);
                    entries.insert(row.key.clone(), row);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self {
            path,
            entries,
            write_lock: Mutex::new(()),
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));

        let text = ron::to_string(&rows)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl OverrideStore for FileOverrideStore {
    fn get(&self, key: &str) -> Result<Option<OverrideEntry>, StoreError> {
        Ok(self
            .entries
            .get(&normalize_key(key))
            .map(|entry| entry.clone()))
    }

    fn set(&self, mut entry: OverrideEntry) -> Result<(), StoreError> {
        entry.key = normalize_key(&entry.key);
        let _guard = self.write_lock.lock();
        self.entries.insert(entry.key.clone(), entry);
        self.persist()
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let removed = self.entries.remove(&normalize_key(key)).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
