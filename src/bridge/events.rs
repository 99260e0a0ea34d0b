//! Notification fan-out.
//!
//! Messages from the child that carry no id are delivered to listeners
//! registered for their method. Delivery is synchronous on the reader task,
//! so notifications of one method reach a listener in arrival order. There is
//! no buffering: a listener only sees notifications emitted after it was
//! registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use super::types::Notification;

/// Listener callback. Runs on the reader task; keep it short.
pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Wildcard method key: listeners under it receive every notification.
pub const ANY_METHOD: &str = "*";

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for notifications whose method equals `method`
    /// (or every notification, for [`ANY_METHOD`]).
    pub fn on<F>(&self, method: &str, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Register a channel-backed listener.
    ///
    /// The receiver sees every matching notification emitted while it is
    /// alive; once dropped, sends are silently discarded.
    pub fn subscribe(&self, method: &str) -> (ListenerId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(method, move |n| {
            let _ = tx.send(n.clone());
        });
        (id, rx)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(lid, _)| *lid != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Deliver `notification` to every matching listener.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, notification: &Notification) -> usize {
        // Snapshot outside the lock so listeners may (un)register freely.
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(&notification.method)
                .into_iter()
                .chain(listeners.get(ANY_METHOD))
                .flatten()
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!(method = %notification.method, "notification with no listeners");
        }
        for listener in &targets {
            listener(notification);
        }
        targets.len()
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .map_or(0, Vec::len)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
