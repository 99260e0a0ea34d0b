//! Usage tracker: the persisted call log and the reports derived from it.
//!
//! One tracker may be shared by several bridges; it is keyed by tool and
//! caller, never by connection. Entries are appended under a lock that also
//! covers persistence, so the file never regresses to an older snapshot and
//! the in-memory log stays ordered by timestamp.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use super::errors::UsageError;
use super::store::{JsonFileStore, MemoryStore, UsageStore};
use super::types::{format_success_rate, CallStatus, CountBreakdown, UsageLogEntry, UsageStats};

/// Reason recorded for a call handle dropped without `complete`.
const ABANDONED_REASON: &str = "abandoned";

/// Below this many calls, the overall success rate is not worth flagging.
const MIN_CALLS_FOR_RATE_WARNING: usize = 10;

// ─── UsageTracker ────────────────────────────────────────────────────────────

pub struct UsageTracker {
    entries: Mutex<Vec<UsageLogEntry>>,
    store: Box<dyn UsageStore>,
}

impl UsageTracker {
    /// Tracker backed by `store`, seeded with whatever it already holds.
    ///
    /// An unreadable log is logged and replaced, not fatal: losing history is
    /// better than refusing to audit new calls.
    pub fn with_store(store: impl UsageStore + 'static) -> Self {
        let entries = match store.load() {
            Ok(entries) => {
                tracing::debug!(count = entries.len(), "loaded usage log");
                entries
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load usage log, starting fresh");
                Vec::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            store: Box::new(store),
        }
    }

    /// Tracker persisting to a JSON file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_store(JsonFileStore::new(path.as_ref()))
    }

    /// Tracker with no file I/O.
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UsageLogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Recording ──────────────────────────────────────────────────────

    /// Record a call that was refused before touching the wire.
    pub fn log_attempt(&self, tool: &str, caller: &str, params: &Value, reason: &str) {
        tracing::info!(tool, caller, reason, "call skipped");
        self.append(tool, caller, params.clone(), CallStatus::Skipped, Some(reason.to_string()), None);
    }

    /// Start auditing a call that is about to reach the wire.
    ///
    /// The returned handle records exactly one entry: on
    /// [`complete`](CallHandle::complete), or as an `error` if dropped first.
    pub fn log_call(self: &Arc<Self>, tool: &str, caller: &str, params: Value) -> CallHandle {
        CallHandle {
            tracker: Arc::clone(self),
            tool: tool.to_string(),
            caller: caller.to_string(),
            params: Some(params),
            started: Instant::now(),
        }
    }

    fn append(
        &self,
        tool: &str,
        caller: &str,
        params: Value,
        result: CallStatus,
        reason: Option<String>,
        duration_ms: Option<u64>,
    ) {
        let mut entries = self.lock();
        entries.push(UsageLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tool: tool.to_string(),
            caller: caller.to_string(),
            params,
            result,
            reason,
            duration_ms,
        });

        if let Err(e) = self.store.save(&entries) {
            tracing::error!(error = %e, "failed to persist usage log");
        }
    }

    /// Force a save of the current log.
    pub fn flush(&self) -> Result<(), UsageError> {
        let entries = self.lock();
        self.store.save(&entries)
    }

    /// Drop every entry (and persist the empty log).
    pub fn clear(&self) -> Result<(), UsageError> {
        let mut entries = self.lock();
        entries.clear();
        self.store.save(&entries)
    }

    // ─── Reporting ──────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the full log, oldest first.
    pub fn entries(&self) -> Vec<UsageLogEntry> {
        self.lock().clone()
    }

    /// The `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<UsageLogEntry> {
        let entries = self.lock();
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    /// Totals, success rate, and per-tool / per-caller breakdowns.
    pub fn stats(&self) -> UsageStats {
        let entries = self.lock();

        let mut overall = CountBreakdown::default();
        let mut by_tool: BTreeMap<String, CountBreakdown> = BTreeMap::new();
        let mut by_caller: BTreeMap<String, CountBreakdown> = BTreeMap::new();

        for entry in entries.iter() {
            overall.record(entry.result);
            by_tool.entry(entry.tool.clone()).or_default().record(entry.result);
            by_caller.entry(entry.caller.clone()).or_default().record(entry.result);
        }

        UsageStats {
            total: overall.total,
            success: overall.success,
            errors: overall.errors,
            skipped: overall.skipped,
            success_rate: format_success_rate(overall.success, overall.total),
            by_tool,
            by_caller,
        }
    }

    /// Human-readable diagnostics derived from [`stats`](Self::stats).
    pub fn suggestions(&self) -> Vec<String> {
        let stats = self.stats();
        let mut out = Vec::new();

        if stats.skipped > stats.success {
            out.push(format!(
                "More calls were skipped ({}) than succeeded ({}); check that the tool process is running and connected.",
                stats.skipped, stats.success
            ));
        }

        for (tool, counts) in &stats.by_tool {
            if counts.errors > counts.success {
                out.push(format!(
                    "Tool '{tool}' fails more often than it succeeds ({} errors vs {} successes).",
                    counts.errors, counts.success
                ));
            }
        }

        if stats.total >= MIN_CALLS_FOR_RATE_WARNING && stats.success * 2 < stats.total {
            out.push(format!(
                "Overall success rate is {}; review the usage log for recurring errors.",
                stats.success_rate
            ));
        }

        out
    }
}

// ─── CallHandle ──────────────────────────────────────────────────────────────

/// An audited call in flight. Consumed by [`complete`](Self::complete).
pub struct CallHandle {
    tracker: Arc<UsageTracker>,
    tool: String,
    caller: String,
    /// Taken when the entry is written; `None` afterwards.
    params: Option<Value>,
    started: Instant,
}

impl CallHandle {
    /// Record the outcome. `error` is kept as the entry's reason.
    pub fn complete(mut self, success: bool, error: Option<String>) {
        let status = if success { CallStatus::Success } else { CallStatus::Error };
        self.record(status, error);
    }

    fn record(&mut self, status: CallStatus, reason: Option<String>) {
        let Some(params) = self.params.take() else {
            return;
        };
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.tracker
            .append(&self.tool, &self.caller, params, status, reason, Some(duration_ms));
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.params.is_some() {
            tracing::warn!(tool = %self.tool, caller = %self.caller, "call handle dropped without completion");
            self.record(CallStatus::Error, Some(ABANDONED_REASON.to_string()));
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
