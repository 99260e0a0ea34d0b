//! Child process supervision and the live connection to it.
//!
//! `connect` spawns the child with the parent's environment plus the
//! configured overrides and pipes all three standard streams:
//! - stdin carries framed requests (single writer, serialized by a lock);
//!   each request is written by its own task so a child that stops reading
//!   can stall the pipe but never a caller's deadline
//! - stdout is owned by a reader task that feeds the framer and routes
//!   responses to the correlator and notifications to the event bus
//! - stderr is forwarded line-by-line to the log
//!
//! A watcher task owns the `Child`. When the process exits, for whatever
//! reason, the watcher closes the correlator (rejecting every pending call
//! with `ProcessTerminated`) before it lets go of the process handle.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::correlator::{PendingCall, RequestCorrelator};
use super::errors::BridgeError;
use super::events::{EventBus, ListenerId};
use super::framer::message_stream;
use super::types::{encode_line, JsonRpcNotification, JsonRpcRequest, Message, Notification};
use crate::config::BridgeConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Lower bound on how long to wait for an explicit ready notification.
const MIN_READY_WAIT: Duration = Duration::from_secs(5);

/// How long `shutdown` waits for the killed child to be reaped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Connection ──────────────────────────────────────────────────────────────

/// A live channel to one child (or to any reader/writer pair).
pub struct Connection {
    label: String,
    correlator: Arc<RequestCorrelator>,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wire a connection over an arbitrary byte stream pair.
    ///
    /// End of stream on `reader` closes the connection as if the child had
    /// exited.
    pub fn attach<R, W>(label: &str, reader: R, writer: W, events: Arc<EventBus>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let correlator = RequestCorrelator::new();
        let reader_task = tokio::spawn(pump_messages(
            label.to_string(),
            reader,
            Arc::clone(&correlator),
            events,
        ));

        Arc::new(Self {
            label: label.to_string(),
            correlator,
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            pid: None,
            kill_tx: Mutex::new(None),
            watcher: Mutex::new(None),
            reader_task,
            stderr_task: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_open(&self) -> bool {
        self.correlator.is_open()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Reserve a correlation id and arm its deadline.
    pub fn register(&self, label: &str, timeout: Duration) -> Result<PendingCall, BridgeError> {
        self.correlator.register(label, timeout)
    }

    /// Queue the request for an already registered call (`request.id` must
    /// come from [`register`](Self::register)).
    ///
    /// The write runs on its own task; the caller only ever waits on
    /// [`PendingCall::wait`], which the deadline bounds even while the pipe
    /// is full. A write failure settles the call with a `Transport` error.
    pub fn dispatch(&self, request: JsonRpcRequest) {
        let writer = Arc::clone(&self.writer);
        let correlator = Arc::clone(&self.correlator);
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            // Settled while queued (deadline or close): nothing to send.
            if !correlator.is_pending(request.id) {
                tracing::debug!(id = request.id, "skipping write for settled call");
                return;
            }
            if let Err(e) = write_line(&mut writer, &request).await {
                tracing::warn!(id = request.id, method = %request.method, error = %e, "failed to write request");
                correlator.fail(request.id, e);
            }
        });
    }

    /// Register, write, and wait: one full round trip.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let call = self.register(method, timeout)?;
        self.dispatch(JsonRpcRequest::new(call.id, method, params));
        call.wait().await
    }

    /// Send a notification to the child. Nothing is registered.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::transport("connection is closed"));
        }
        let mut writer = self.writer.lock().await;
        write_line(&mut writer, &JsonRpcNotification::new(method, params)).await
    }

    /// Close the connection, kill the child, and wait for it to be reaped.
    ///
    /// Idempotent. Pending calls are rejected with `ProcessTerminated`.
    pub async fn shutdown(&self) {
        self.correlator.close("bridge disconnected");

        let kill = self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = kill {
            let _ = tx.send(());
        }

        let watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = watcher {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!(child = %self.label, "child was not reaped within shutdown timeout");
            }
        }
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

/// Serialize and write one line. Callers hold the writer lock for the whole
/// line so concurrent writes never interleave.
async fn write_line<T: Serialize>(writer: &mut BoxedWriter, message: &T) -> Result<(), BridgeError> {
    let line = encode_line(message)
        .map_err(|e| BridgeError::transport(format!("failed to serialize message: {e}")))?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| BridgeError::transport(format!("failed to write to child stdin: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::transport(format!("failed to flush child stdin: {e}")))?;
    Ok(())
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.correlator.close("connection dropped");
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        // Dropping `kill_tx` makes the watcher kill the child.
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn the configured child and return a ready connection.
///
/// Fails with `SpawnFailed` if the executable cannot be started or exits
/// before it is considered ready.
pub async fn connect(config: &BridgeConfig, events: Arc<EventBus>) -> Result<Arc<Connection>, BridgeError> {
    config.validate()?;

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    // Inherits the parent environment; overrides win.
    cmd.envs(&config.env);
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let spawn_failed = |reason: String| BridgeError::SpawnFailed {
        command: config.command.clone(),
        reason,
    };

    let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::info!(command = %config.command, pid = ?pid, "spawned child process");

    // Subscribe before the reader starts so an early ready signal is not lost.
    let ready_sub = config
        .ready_notification
        .as_deref()
        .map(|method| events.subscribe(method));

    let label = config.command.clone();
    let correlator = RequestCorrelator::new();
    let reader_task = tokio::spawn(pump_messages(
        label.clone(),
        stdout,
        Arc::clone(&correlator),
        Arc::clone(&events),
    ));
    let stderr_task = stderr.map(|s| tokio::spawn(forward_stderr(label.clone(), s)));

    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let watcher = tokio::spawn(watch_child(
        label.clone(),
        child,
        kill_rx,
        Arc::clone(&correlator),
        exit_tx,
    ));

    let connection = Arc::new(Connection {
        label,
        correlator,
        writer: Arc::new(tokio::sync::Mutex::new(Box::new(stdin))),
        pid,
        kill_tx: Mutex::new(Some(kill_tx)),
        watcher: Mutex::new(Some(watcher)),
        reader_task,
        stderr_task,
    });

    if let Err(reason) = wait_ready(config, exit_rx, ready_sub, &events).await {
        connection.shutdown().await;
        return Err(spawn_failed(reason));
    }

    tracing::info!(command = %config.command, pid = ?pid, "child process ready");
    Ok(connection)
}

/// Decide when a freshly spawned child may take calls.
///
/// - explicit ready notification configured: wait for it
/// - zero grace: ready at once, unless the child already exited
/// - otherwise: ready once the grace period passes without an exit
async fn wait_ready(
    config: &BridgeConfig,
    mut exit_rx: oneshot::Receiver<String>,
    ready_sub: Option<(ListenerId, mpsc::UnboundedReceiver<Notification>)>,
    events: &EventBus,
) -> Result<(), String> {
    let grace = config.startup_grace();

    if let Some((listener, mut ready_rx)) = ready_sub {
        let deadline = grace.max(MIN_READY_WAIT);
        let outcome = tokio::select! {
            got = ready_rx.recv() => match got {
                Some(_) => Ok(()),
                None => Err("ready listener closed".to_string()),
            },
            exited = &mut exit_rx => Err(exit_reason(exited)),
            _ = tokio::time::sleep(deadline) => Err(format!(
                "no ready notification within {}ms",
                deadline.as_millis()
            )),
        };
        events.off(listener);
        return outcome;
    }

    if grace.is_zero() {
        return match exit_rx.try_recv() {
            Ok(reason) => Err(format!("exited during startup: {reason}")),
            Err(oneshot::error::TryRecvError::Empty) => Ok(()),
            Err(oneshot::error::TryRecvError::Closed) => Err("exited during startup".to_string()),
        };
    }

    tokio::select! {
        exited = &mut exit_rx => Err(exit_reason(exited)),
        _ = tokio::time::sleep(grace) => Ok(()),
    }
}

fn exit_reason(exited: Result<String, oneshot::error::RecvError>) -> String {
    match exited {
        Ok(reason) => format!("exited during startup: {reason}"),
        Err(_) => "exited during startup".to_string(),
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────

/// Owns the read side: framer → correlator / event bus.
async fn pump_messages<R>(label: String, reader: R, correlator: Arc<RequestCorrelator>, events: Arc<EventBus>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let messages = message_stream(reader);
    tokio::pin!(messages);

    while let Some(message) = messages.next().await {
        match message {
            Message::Response { id, outcome } => {
                correlator.resolve(id, outcome);
            }
            Message::Notification(notification) => {
                events.emit(&notification);
            }
            Message::Request { id, method, .. } => {
                tracing::debug!(child = %label, id, method = %method, "ignoring request from child");
            }
        }
    }

    tracing::info!(child = %label, "child stdout closed");
    correlator.close("child closed its stdout");
}

/// Forward the child's stderr to the log, one line per event.
async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "toolbridge::child", child = %label, "{line}");
                }
            }
            Err(e) => {
                tracing::debug!(child = %label, error = %e, "stopped reading child stderr");
                break;
            }
        }
    }
}

/// Owns the `Child`: waits for exit or a kill request, then fails every
/// pending call before the handle is released.
async fn watch_child(
    label: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    correlator: Arc<RequestCorrelator>,
    exit_tx: oneshot::Sender<String>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            tracing::info!(child = %label, "killing child process");
            if let Err(e) = child.start_kill() {
                tracing::debug!(child = %label, error = %e, "kill failed (already exited?)");
            }
            child.wait().await
        }
    };

    let reason = match status {
        Ok(status) => format!("child exited ({status})"),
        Err(e) => format!("failed to wait for child: {e}"),
    };

    let rejected = correlator.close(&reason);
    tracing::info!(child = %label, reason = %reason, rejected, "child process ended");
    let _ = exit_tx.send(reason);
    drop(child);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
