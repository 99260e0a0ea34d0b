//! Usage log entry and statistics types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Log Entries ─────────────────────────────────────────────────────────────

/// Outcome of one audited call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The child returned a result.
    Success,
    /// The call reached the wire and failed (remote error, timeout, exit).
    Error,
    /// The call never reached the wire (e.g. no connection).
    Skipped,
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub id: String,
    /// When the entry was appended. Entries are ordered by this field.
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub caller: String,
    pub params: serde_json::Value,
    pub result: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Outcome counts for one tool or caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountBreakdown {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl CountBreakdown {
    pub(crate) fn record(&mut self, status: CallStatus) {
        self.total += 1;
        match status {
            CallStatus::Success => self.success += 1,
            CallStatus::Error => self.errors += 1,
            CallStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Aggregate view over the whole log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    pub skipped: usize,
    /// `success / total` as a percentage with one decimal, or `"0%"`.
    pub success_rate: String,
    pub by_tool: BTreeMap<String, CountBreakdown>,
    pub by_caller: BTreeMap<String, CountBreakdown>,
}

/// Render a success ratio the way reports show it.
pub fn format_success_rate(success: usize, total: usize) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.1}%", success as f64 / total as f64 * 100.0)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
