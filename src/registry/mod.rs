//! Registry of live device sessions.
//!
//! One entry per device id, owned by the service and injected wherever
//! delivery is needed. The map is the only cross-task shared mutable state
//! in the core; a single lock guards it, held only for map mutation and
//! never across socket I/O. Sessions are never closed from the outside:
//! a superseded session receives a control message and winds itself down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

/// Control messages delivered into a session's own channel.
#[derive(Debug)]
pub enum SessionControl {
    /// A command was queued for this device; drain the pending slot.
    Wake,
    /// A newer connection took over this device id; shut down.
    Supersede,
}

#[derive(Clone)]
struct SessionHandle {
    epoch: u64,
    tx: mpsc::Sender<SessionControl>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
    next_epoch: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        // A session that panicked mid-registration must not wedge every
        // other connection; the map itself stays consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session for a device id and return its epoch. Any previous
    /// session for the same id is told to supersede itself.
    pub fn add(&self, device_id: &str, tx: mpsc::Sender<SessionControl>) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let old = {
            let mut map = self.lock();
            map.insert(device_id.to_string(), SessionHandle { epoch, tx })
        };
        if let Some(old) = old {
            debug!(device_id, old_epoch = old.epoch, "superseding live session");
            let _ = old.tx.try_send(SessionControl::Supersede);
        }
        epoch
    }

    /// Deregister a session. The epoch check keeps a slow old session from
    /// evicting the connection that replaced it.
    pub fn remove(&self, device_id: &str, epoch: u64) -> bool {
        let mut map = self.lock();
        match map.get(device_id) {
            Some(handle) if handle.epoch == epoch => {
                map.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Nudge the live session for a device, if any. Returns false when there
    /// is none (or its channel is gone), in which case the caller falls back
    /// to the push path.
    pub fn wake(&self, device_id: &str) -> bool {
        let tx = {
            let map = self.lock();
            map.get(device_id).map(|handle| handle.tx.clone())
        };
        match tx {
            Some(tx) => tx.try_send(SessionControl::Wake).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.lock().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_wake_then_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);

        let epoch = registry.add("dev1", tx);
        assert!(registry.contains("dev1"));
        assert!(registry.wake("dev1"));
        assert!(matches!(rx.try_recv(), Ok(SessionControl::Wake)));

        assert!(registry.remove("dev1", epoch));
        assert!(!registry.contains("dev1"));
        assert!(!registry.wake("dev1"));
    }

    #[tokio::test]
    async fn second_connection_supersedes_first() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        let epoch1 = registry.add("dev1", tx1);
        let _epoch2 = registry.add("dev1", tx2);

        // Old session is told to wind down; exactly one entry remains.
        assert!(matches!(rx1.try_recv(), Ok(SessionControl::Supersede)));
        assert_eq!(registry.len(), 1);

        // The old session's late deregistration must not evict the new one.
        assert!(!registry.remove("dev1", epoch1));
        assert!(registry.contains("dev1"));

        // New session still reachable.
        assert!(registry.wake("dev1"));
        assert!(matches!(rx2.try_recv(), Ok(SessionControl::Wake)));
    }

    #[tokio::test]
    async fn wake_with_closed_channel_reports_no_session() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        registry.add("dev1", tx);
        drop(rx);
        assert!(!registry.wake("dev1"));
    }
}
