//! Usage log persistence.
//!
//! The on-disk format is a single JSON array of entries, rewritten in full on
//! every append. That is plenty for audit volume (a handful of calls per
//! minute) and keeps the file trivially inspectable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::errors::UsageError;
use super::types::UsageLogEntry;

/// Where a tracker keeps its entries between runs.
pub trait UsageStore: Send + Sync {
    /// Load previously persisted entries. A missing log is an empty log.
    fn load(&self) -> Result<Vec<UsageLogEntry>, UsageError>;

    /// Replace the persisted log with `entries`.
    fn save(&self, entries: &[UsageLogEntry]) -> Result<(), UsageError>;
}

// ─── JsonFileStore ───────────────────────────────────────────────────────────

/// JSON-array file, written atomically (temp file + rename).
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, e: std::io::Error) -> UsageError {
        UsageError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

impl UsageStore for JsonFileStore {
    fn load(&self) -> Result<Vec<UsageLogEntry>, UsageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &[UsageLogEntry]) -> Result<(), UsageError> {
        let content = serde_json::to_string_pretty(entries)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

// ─── MemoryStore ─────────────────────────────────────────────────────────────

/// In-process store with no file I/O. Counts saves so tests can assert that
/// every append was persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<UsageLogEntry>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if a previous run had left these entries behind.
    pub fn with_entries(entries: Vec<UsageLogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<UsageLogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl UsageStore for MemoryStore {
    fn load(&self) -> Result<Vec<UsageLogEntry>, UsageError> {
        Ok(self.snapshot())
    }

    fn save(&self, entries: &[UsageLogEntry]) -> Result<(), UsageError> {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<T: UsageStore + ?Sized> UsageStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Vec<UsageLogEntry>, UsageError> {
        (**self).load()
    }

    fn save(&self, entries: &[UsageLogEntry]) -> Result<(), UsageError> {
        (**self).save(entries)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
