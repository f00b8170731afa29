use log::debug;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Set of the live server-side connections. A connection is inserted once
/// its handshake completed and removed when its reader loop exits, and each
/// removal wakes the waiters, so a shutting-down host can block until the
/// set drained.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashSet<Uuid>>,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, id: Uuid) {
        self.connections.lock().unwrap().insert(id);
    }

    // Removing an absent id is harmless, but the waiters are woken either way
    pub(crate) fn remove(&self, id: Uuid) -> bool {
        let found = self.connections.lock().unwrap().remove(&id);
        if !found {
            debug!("connection {} was not registered", id);
        }
        self.drained.notify_waiters();
        found
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_connections() == 0
    }

    /// Waits until no connection is registered anymore. Returns immediately
    /// when the set is already empty.
    pub async fn wait_empty(&self) {
        loop {
            let drained = self.drained.notified();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }
}
