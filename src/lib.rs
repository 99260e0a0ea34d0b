//! toolbridge drives a tool-providing child process over line-delimited
//! JSON-RPC on its standard streams, with per-call deadlines and an audit
//! trail of every call attempted.

pub mod bridge;
pub mod config;
pub mod usage;

use std::path::{Path, PathBuf};

pub use bridge::{Bridge, BridgeError, CallOptions, ErrorKind, RetryPolicy, RetryStrategy};
pub use config::BridgeConfig;
pub use usage::{UsageStats, UsageTracker};

/// Number of rotated log files kept next to the live one.
const LOG_KEEP: u32 = 3;

/// Platform data directory for toolbridge state (usage log, logs).
///
/// Falls back to `~/.toolbridge/` if the platform directory is unknown.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

/// Install a global tracing subscriber writing to `<log_dir>/bridge.log`.
///
/// Rotates existing logs first (`bridge.log` → `.1` → `.2` → `.3`). The
/// filter comes from `RUST_LOG`, defaulting to `toolbridge=info,warn`.
/// Returns the log file path. A subscriber installed earlier (by the host
/// application or another test) is left in place.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("bridge.log");
    rotate_log_file(&log_path, LOG_KEEP);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "toolbridge logging initialized"
        );
    }
    Ok(log_path)
}

/// Shift `bridge.log` → `bridge.log.1` → … → `.{keep}`, dropping the oldest.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// Log sink that flushes each line to disk as it is written.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
