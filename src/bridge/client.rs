//! Bridge — the composition root callers talk to.
//!
//! Owns at most one live [`Connection`] at a time, plus the event bus that
//! outlives reconnects and a shared handle to the usage tracker. Every
//! `call_tool` is audited: calls refused before reaching the wire are logged
//! as skipped, calls that reach the wire are logged once they settle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::errors::{BridgeError, RetryStrategy};
use super::events::EventBus;
use super::supervisor::{self, Connection};
use super::types::{JsonRpcRequest, TOOLS_LIST};
use crate::config::BridgeConfig;
use crate::usage::UsageTracker;

/// Default number of retries in [`RetryPolicy`].
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default base delay for exponential backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Per-call overrides. Unset fields fall back to the bridge config.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub caller: Option<String>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// Bounds for [`Bridge::call_tool_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub options: CallOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            options: CallOptions::default(),
        }
    }
}

/// `base * 2^(attempt - 1)`, saturating, capped at [`MAX_RETRY_DELAY`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

// ─── Bridge ──────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    usage: Arc<UsageTracker>,
    events: Arc<EventBus>,
    connection: Mutex<Option<Arc<Connection>>>,
    /// Serializes connect / attach / disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, usage: Arc<UsageTracker>) -> Self {
        Self {
            config,
            usage,
            events: Arc::new(EventBus::new()),
            connection: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Bridge with a file-backed usage tracker at the configured location.
    pub fn with_usage_log(config: BridgeConfig) -> Self {
        let usage = Arc::new(UsageTracker::open(config.resolved_usage_log_path()));
        Self::new(config, usage)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Notifications from the child. Listeners survive reconnects.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Spawn the configured child. A no-op if already connected.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let connection = supervisor::connect(&self.config, Arc::clone(&self.events)).await?;
        self.replace(Some(connection)).await;
        Ok(())
    }

    /// Use an existing byte stream pair instead of spawning a process.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let _guard = self.lifecycle.lock().await;
        let connection = Connection::attach(&self.config.command, reader, writer, Arc::clone(&self.events));
        self.replace(Some(connection)).await;
    }

    /// Kill the child and reject whatever is still pending. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.replace(None).await;
    }

    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        tracing::info!(command = %self.config.command, "reconnecting");
        self.disconnect().await;
        self.connect().await
    }

    async fn replace(&self, next: Option<Arc<Connection>>) {
        let previous = {
            let mut slot = self.connection.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, next)
        };
        if let Some(old) = previous {
            old.shutdown().await;
        }
    }

    /// The current connection, if it is still open.
    fn live_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |c| c.pending_count())
    }

    pub fn pid(&self) -> Option<u32> {
        self.live_connection().and_then(|c| c.pid())
    }

    // ─── Calls ──────────────────────────────────────────────────────────

    /// Invoke a tool with the configured timeout and caller identity.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        self.call_tool_with(name, arguments, &CallOptions::default()).await
    }

    /// Invoke a tool, overriding the timeout and/or caller for this call.
    pub async fn call_tool_with(
        &self,
        name: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<Value, BridgeError> {
        let timeout = options.timeout.unwrap_or_else(|| self.config.call_timeout());
        let caller = options.caller.as_deref().unwrap_or(&self.config.caller);

        let registered = match self.live_connection() {
            Some(conn) => conn.register(name, timeout).map(|call| (conn, call)),
            None => Err(BridgeError::transport("not connected")),
        };
        let (conn, call) = match registered {
            Ok(pair) => pair,
            Err(e) => {
                self.usage.log_attempt(name, caller, &arguments, &e.to_string());
                return Err(e);
            }
        };

        let audit = self.usage.log_call(name, caller, arguments.clone());
        tracing::debug!(id = call.id, tool = name, caller, "calling tool");

        conn.dispatch(JsonRpcRequest::tool_call(call.id, name, arguments));
        let result = call.wait().await;

        match &result {
            Ok(_) => audit.complete(true, None),
            Err(e) => {
                tracing::warn!(tool = name, caller, error = %e, "tool call failed");
                audit.complete(false, Some(e.to_string()));
            }
        }
        result
    }

    /// Retry per the error's [`RetryStrategy`], up to `policy.max_retries`.
    pub async fn call_tool_with_retry(
        &self,
        name: &str,
        arguments: Value,
        policy: &RetryPolicy,
    ) -> Result<Value, BridgeError> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.call_tool_with(name, arguments.clone(), &policy.options).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let strategy = err.retry_strategy();
            if strategy == RetryStrategy::Never || attempt >= policy.max_retries {
                return Err(err);
            }
            attempt += 1;

            tracing::warn!(
                tool = name,
                attempt,
                max_retries = policy.max_retries,
                strategy = ?strategy,
                error = %err,
                "retrying tool call"
            );

            match strategy {
                RetryStrategy::Immediate | RetryStrategy::Never => {}
                RetryStrategy::Backoff => {
                    tokio::time::sleep(backoff_delay(policy.base_delay, attempt)).await;
                }
                RetryStrategy::Reconnect => self.reconnect().await?,
            }
        }
    }

    /// Send any JSON-RPC method through the correlation path. Not audited.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let conn = self
            .live_connection()
            .ok_or_else(|| BridgeError::transport("not connected"))?;
        conn.request(method, params, timeout).await
    }

    /// `tools/list` with the configured timeout.
    pub async fn list_tools(&self) -> Result<Value, BridgeError> {
        self.request(TOOLS_LIST, None, self.config.call_timeout()).await
    }

    /// Fire-and-forget notification to the child.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BridgeError> {
        let conn = self
            .live_connection()
            .ok_or_else(|| BridgeError::transport("not connected"))?;
        conn.notify(method, params).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::errors::ErrorKind;
    use crate::usage::{CallStatus, MemoryStore};
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    type ChildLines = Lines<BufReader<ReadHalf<DuplexStream>>>;
    type ChildWriter = WriteHalf<DuplexStream>;

    fn bridge(config: BridgeConfig) -> Bridge {
        Bridge::new(config, Arc::new(UsageTracker::in_memory()))
    }

    /// A bridge attached to an in-process pipe; the test plays the child.
    async fn attached() -> (Bridge, ChildLines, ChildWriter) {
        let (bridge_side, child_side) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (child_read, child_write) = tokio::io::split(child_side);

        let bridge = bridge(BridgeConfig::new("fake-child"));
        bridge.attach(bridge_read, bridge_write).await;
        (bridge, BufReader::new(child_read).lines(), child_write)
    }

    async fn next_request(lines: &mut ChildLines) -> Value {
        let line = lines.next_line().await.unwrap().expect("bridge closed stdin");
        serde_json::from_str(&line).unwrap()
    }

    async fn write_line(writer: &mut ChildWriter, line: &str) {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
    }

    async fn reply(writer: &mut ChildWriter, id: &Value, result: Value) {
        let msg = json!({"jsonrpc": "2.0", "id": id, "result": result});
        write_line(writer, &msg.to_string()).await;
    }

    #[tokio::test]
    async fn test_request_wire_shape() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let req = next_request(&mut lines).await;
            assert_eq!(req["jsonrpc"], "2.0");
            assert_eq!(req["method"], "tools/call");
            assert_eq!(req["params"]["name"], "echo");
            assert_eq!(req["params"]["arguments"], json!({"v": 1}));
            assert!(req["id"].is_u64());
            reply(&mut writer, &req["id"], json!("ok")).await;
        };

        let (result, ()) = tokio::join!(bridge.call_tool("echo", json!({"v": 1})), child);
        assert_eq!(result.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let first = next_request(&mut lines).await;
            let second = next_request(&mut lines).await;
            for req in [second, first] {
                let v = req["params"]["arguments"]["v"].clone();
                reply(&mut writer, &req["id"], json!({ "echoed": v })).await;
            }
        };

        let (r1, r2, ()) = tokio::join!(
            bridge.call_tool("echo", json!({"v": 1})),
            bridge.call_tool("echo", json!({"v": 2})),
            child
        );
        assert_eq!(r1.unwrap(), json!({"echoed": 1}));
        assert_eq!(r2.unwrap(), json!({"echoed": 2}));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_settle_with_their_own_result() {
        const N: u64 = 25;
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let mut requests = Vec::new();
            for _ in 0..N {
                requests.push(next_request(&mut lines).await);
            }
            let mut seen_ids: Vec<u64> = requests.iter().map(|r| r["id"].as_u64().unwrap()).collect();
            seen_ids.sort_unstable();
            seen_ids.dedup();
            assert_eq!(seen_ids.len() as u64, N, "ids must be unique while pending");

            for req in requests.into_iter().rev() {
                let v = req["params"]["arguments"]["v"].clone();
                reply(&mut writer, &req["id"], v).await;
            }
        };

        let calls = futures::future::join_all((0..N).map(|v| bridge.call_tool("echo", json!({ "v": v }))));
        let (results, ()) = tokio::join!(calls, child);

        for (v, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(v));
        }
        assert_eq!(bridge.usage().stats().success, N as usize);
    }

    #[tokio::test]
    async fn test_noise_lines_do_not_disturb_routing() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let req = next_request(&mut lines).await;
            write_line(&mut writer, "Server listening on stdio").await;
            write_line(&mut writer, "{ broken json").await;
            write_line(&mut writer, r#"{"jsonrpc":"2.0","id":999999,"result":"stray"}"#).await;
            write_line(&mut writer, r#"{"neither":"shape"}"#).await;
            reply(&mut writer, &req["id"], json!("real")).await;
        };

        let (result, ()) = tokio::join!(bridge.call_tool("echo", json!({})), child);
        assert_eq!(result.unwrap(), json!("real"));
        assert!(bridge.is_connected());
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let req = next_request(&mut lines).await;
            let msg = json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32602, "message": "missing field 'path'"}
            });
            write_line(&mut writer, &msg.to_string()).await;
        };

        let (result, ()) = tokio::join!(bridge.call_tool("fs.read", json!({})), child);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(err.retry_strategy(), RetryStrategy::Never);
        assert!(err.to_string().contains("missing field 'path'"));

        let entries = bridge.usage().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, CallStatus::Error);
    }

    #[tokio::test]
    async fn test_late_response_is_dropped_and_next_call_unaffected() {
        let (bridge, mut lines, mut writer) = attached().await;
        let fast = CallOptions::default().timeout(Duration::from_millis(20));

        let child = async {
            let slow = next_request(&mut lines).await;
            let next = next_request(&mut lines).await;
            // Answer the timed-out call only after the second one is pending.
            reply(&mut writer, &slow["id"], json!("late")).await;
            reply(&mut writer, &next["id"], json!("fresh")).await;
        };

        let calls = async {
            let first = bridge.call_tool_with("slow", json!({}), &fast).await;
            let second = bridge.call_tool("quick", json!({})).await;
            (first, second)
        };

        let ((first, second), ()) = tokio::join!(calls, child);
        assert_eq!(first.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(second.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_deadline_holds_while_stdin_is_full() {
        // Tiny pipe that the peer never drains.
        let (bridge_side, _child_side) = tokio::io::duplex(64);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let bridge = bridge(BridgeConfig::new("fake-child"));
        bridge.attach(bridge_read, bridge_write).await;

        let opts = CallOptions::default().timeout(Duration::from_millis(50));
        let blob = "x".repeat(4096);

        let (first, second) = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(
                bridge.call_tool_with("echo", json!({ "blob": blob }), &opts),
                bridge.call_tool_with("echo", json!({ "v": 2 }), &opts)
            )
        })
        .await
        .expect("calls must settle at their deadline");

        assert_eq!(first.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(bridge.usage().stats().errors, 2);
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast_and_logs_skipped() {
        let bridge = bridge(BridgeConfig::new("unused"));
        let err = bridge.call_tool("echo", json!({"v": 1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let entries = bridge.usage().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, CallStatus::Skipped);
        assert_eq!(entries[0].params, json!({"v": 1}));
        assert!(entries[0].duration_ms.is_none());
        assert!(bridge.notify("x", None).await.is_err());
        assert!(bridge.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn test_notifications_reach_listeners() {
        let (bridge, _lines, mut writer) = attached().await;
        let (_id, mut rx) = bridge.events().subscribe("progress");

        write_line(&mut writer, r#"{"jsonrpc":"2.0","method":"progress","params":{"pct":10}}"#).await;
        write_line(&mut writer, r#"{"jsonrpc":"2.0","method":"other","params":{}}"#).await;
        write_line(&mut writer, r#"{"jsonrpc":"2.0","method":"progress","params":{"pct":20}}"#).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.params["pct"], 10);
        assert_eq!(second.params["pct"], 20);
    }

    #[tokio::test]
    async fn test_list_tools_and_notify() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let note = next_request(&mut lines).await;
            assert_eq!(note["method"], "notifications/initialized");
            assert!(note.get("id").is_none());

            let req = next_request(&mut lines).await;
            assert_eq!(req["method"], "tools/list");
            reply(&mut writer, &req["id"], json!({"tools": [{"name": "echo"}]})).await;
        };

        let calls = async {
            bridge.notify("notifications/initialized", None).await.unwrap();
            bridge.list_tools().await
        };
        let (tools, ()) = tokio::join!(calls, child);
        assert_eq!(tools.unwrap()["tools"][0]["name"], "echo");
        // Plain requests are not audited.
        assert!(bridge.usage().is_empty());
    }

    #[tokio::test]
    async fn test_retry_backoff_on_timeout_then_gives_up() {
        let (bridge, mut lines, _writer) = attached().await;
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            options: CallOptions::default().timeout(Duration::from_millis(20)),
        };

        let child = async {
            let mut seen = 0;
            while seen < 3 {
                next_request(&mut lines).await;
                seen += 1;
            }
            seen
        };

        let (result, seen) = tokio::join!(bridge.call_tool_with_retry("slow", json!({}), &policy), child);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(seen, 3);
        assert_eq!(bridge.usage().stats().errors, 3);
    }

    #[test]
    fn test_backoff_delay_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 40), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(Duration::MAX, 2), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(Duration::ZERO, u32::MAX), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_with_many_attempts_does_not_overflow() {
        let (bridge, _lines, _writer) = attached().await;
        let policy = RetryPolicy {
            max_retries: 40,
            base_delay: Duration::ZERO,
            options: CallOptions::default().timeout(Duration::from_millis(1)),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            bridge.call_tool_with_retry("slow", json!({}), &policy),
        )
        .await
        .expect("retry loop must finish");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(bridge.usage().stats().errors, 41);
    }

    #[tokio::test]
    async fn test_retry_never_on_remote_error() {
        let (bridge, mut lines, mut writer) = attached().await;

        let child = async {
            let req = next_request(&mut lines).await;
            let msg = json!({"jsonrpc": "2.0", "id": req["id"], "error": {"message": "bad args"}});
            write_line(&mut writer, &msg.to_string()).await;
        };

        let policy = RetryPolicy::default();
        let (result, ()) = tokio::join!(
            bridge.call_tool_with_retry("t", json!({}), &policy),
            child
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Remote);
        assert_eq!(bridge.usage().len(), 1);
    }

    #[tokio::test]
    async fn test_reader_eof_rejects_pending_as_terminated() {
        let (bridge, mut lines, writer) = attached().await;

        let child = async move {
            next_request(&mut lines).await;
            drop(writer);
            drop(lines);
        };

        let (result, ()) = tokio::join!(bridge.call_tool("echo", json!({})), child);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessTerminated);
        assert_eq!(err.retry_strategy(), RetryStrategy::Reconnect);
        assert!(!bridge.is_connected());

        let err = bridge.call_tool("echo", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_caller_override_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let usage = Arc::new(UsageTracker::with_store(Arc::clone(&store)));
        let bridge = Bridge::new(BridgeConfig::new("fake-child"), Arc::clone(&usage));

        bridge.call_tool("a", json!({})).await.unwrap_err();

        let (bridge_side, child_side) = tokio::io::duplex(4096);
        let (br, bw) = tokio::io::split(bridge_side);
        let (cr, mut cw) = tokio::io::split(child_side);
        bridge.attach(br, bw).await;
        let mut lines = BufReader::new(cr).lines();

        let child = async {
            let req = next_request(&mut lines).await;
            reply(&mut cw, &req["id"], json!(true)).await;
        };
        let opts = CallOptions::default().caller("planner");
        let (ok, ()) = tokio::join!(bridge.call_tool_with("b", json!({}), &opts), child);
        ok.unwrap();

        let stats = usage.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.total, stats.success + stats.errors + stats.skipped);
        assert_eq!(stats.success_rate, "50.0%");
        assert_eq!(stats.by_caller["bridge"].skipped, 1);
        assert_eq!(stats.by_caller["planner"].success, 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (bridge, _lines, _writer) = attached().await;
        assert!(bridge.is_connected());
        bridge.disconnect().await;
        bridge.disconnect().await;
        assert!(!bridge.is_connected());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_child_times_out_and_pending_entry_is_gone() {
        let config = BridgeConfig::new("sh")
            .with_args(["-c", "cat > /dev/null"])
            .with_startup_grace(Duration::ZERO);
        let bridge = bridge(config);
        bridge.connect().await.unwrap();
        assert!(bridge.pid().is_some());
        assert_eq!(bridge.pending_count(), 0);

        let opts = CallOptions::default().timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = bridge.call_tool_with("echo", json!({}), &opts).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
        assert_eq!(bridge.pending_count(), 0);
        assert!(bridge.is_connected());

        bridge.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_that_never_reads_stdin_still_times_out() {
        let config = BridgeConfig::new("sh")
            .with_args(["-c", "sleep 30"])
            .with_startup_grace(Duration::ZERO);
        let bridge = bridge(config);
        bridge.connect().await.unwrap();

        let opts = CallOptions::default().timeout(Duration::from_millis(50));
        let blob = "x".repeat(256 * 1024);
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            bridge.call_tool_with("echo", json!({ "blob": blob }), &opts),
        )
        .await
        .expect("call must settle at its deadline");

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(bridge.pending_count(), 0);

        // The stalled write is released once the child is killed.
        bridge.disconnect().await;
        assert!(!bridge.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_rejects_all_pending_as_terminated() {
        // Exits after reading two requests, answering neither.
        let config = BridgeConfig::new("sh")
            .with_args(["-c", "head -n 2 > /dev/null"])
            .with_startup_grace(Duration::ZERO);
        let bridge = bridge(config);
        bridge.connect().await.unwrap();

        let (r1, r2) = tokio::join!(
            bridge.call_tool("echo", json!({"v": 1})),
            bridge.call_tool("echo", json!({"v": 2}))
        );
        assert_eq!(r1.unwrap_err().kind(), ErrorKind::ProcessTerminated);
        assert_eq!(r2.unwrap_err().kind(), ErrorKind::ProcessTerminated);
        assert_eq!(bridge.pending_count(), 0);
        assert!(!bridge.is_connected());

        let err = bridge.call_tool("echo", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let stats = bridge.usage().stats();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconnect_after_exit() {
        let config = BridgeConfig::new("sh")
            .with_args(["-c", "head -n 1 > /dev/null"])
            .with_startup_grace(Duration::ZERO);
        let bridge = bridge(config);
        bridge.connect().await.unwrap();
        let first_pid = bridge.pid();

        let err = bridge.call_tool("x", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessTerminated);

        bridge.reconnect().await.unwrap();
        assert!(bridge.is_connected());
        assert_ne!(bridge.pid(), first_pid);
        bridge.disconnect().await;
    }
}
