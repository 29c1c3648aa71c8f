//! Session registry: the authoritative mapping of live client sessions.
//!
//! Queried and mutated by both the network layer and the operator console.
//! All operations go through a single mutex, so a `list()` snapshot never
//! observes a half-registered or half-removed session. The lock is never
//! held across an await.

#![allow(dead_code)] // The console exercises only part of the registry surface

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Snapshot of one registered session, as reported by `list` and `lookup`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Registry-assigned identifier, unique for the lifetime of the process.
    pub id: u64,
    /// Client endpoint (address:port).
    pub peer: SocketAddr,
    /// Wall-clock time the client connected.
    pub connected_at: DateTime<Local>,
}

/// Handed to a session task at registration time.
pub struct SessionTicket {
    /// The assigned identifier.
    pub id: u64,
    /// Fired when the operator force-disconnects this session.
    pub closer: Arc<Notify>,
}

struct SessionHandle {
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    closer: Arc<Notify>,
}

impl SessionHandle {
    fn info(&self, id: u64) -> SessionInfo {
        SessionInfo {
            id,
            peer: self.peer,
            connected_at: self.connected_at,
        }
    }
}

/// Registry of active sessions.
///
/// Identifiers are monotonically increasing and never reused; the ordered
/// map keeps `list()` sorted by ascending id for free.
pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: u64,
    sessions: BTreeMap<u64, SessionHandle>,
}

impl Registry {
    /// Create an empty registry. The first assigned id is 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                sessions: BTreeMap::new(),
            }),
        }
    }

    /// Register a new session, returning its id and close signal.
    pub fn register(&self, peer: SocketAddr) -> SessionTicket {
        let closer = Arc::new(Notify::new());
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(
            id,
            SessionHandle {
                peer,
                connected_at: Local::now(),
                closer: Arc::clone(&closer),
            },
        );
        SessionTicket { id, closer }
    }

    /// Remove a session. Idempotent: removing an id that is already gone is
    /// a no-op, tolerating races between client close and operator disconnect.
    pub fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(&id);
    }

    /// Snapshot of all sessions in ascending id order.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .iter()
            .map(|(&id, handle)| handle.info(id))
            .collect()
    }

    /// Look up a single session by id.
    pub fn lookup(&self, id: u64) -> Option<SessionInfo> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(&id).map(|handle| handle.info(id))
    }

    /// Force-disconnect a session: remove its entry and fire its close
    /// signal under one lock acquisition, so no observer sees the session
    /// listed after its socket has started closing (or vice versa).
    ///
    /// Returns `None` if the id is not present; the registry is unchanged.
    pub fn disconnect(&self, id: u64) -> Option<SessionInfo> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.sessions.remove(&id)?;
        let info = handle.info(id);
        handle.closer.notify_one();
        Some(info)
    }

    /// Remove every session and fire all close signals. Used by server
    /// shutdown; returns the sessions that were open.
    pub fn drain(&self) -> Vec<SessionInfo> {
        let mut inner = self.inner.lock().unwrap();
        let sessions = std::mem::take(&mut inner.sessions);
        sessions
            .into_iter()
            .map(|(id, handle)| {
                let info = handle.info(id);
                handle.closer.notify_one();
                info
            })
            .collect()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Check if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_ids_monotonic_and_never_reused() {
        let registry = Registry::new();

        let t1 = registry.register(peer(1000));
        let t2 = registry.register(peer(1001));
        assert_eq!(t1.id, 1);
        assert_eq!(t2.id, 2);

        registry.unregister(t1.id);
        registry.unregister(t2.id);

        // Freed ids must not come back
        let t3 = registry.register(peer(1002));
        assert_eq!(t3.id, 3);
    }

    #[test]
    fn test_list_ordered_by_id() {
        let registry = Registry::new();
        for port in [5000, 4000, 3000] {
            registry.register(peer(port));
        }

        let ids: Vec<u64> = registry.list().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_lookup() {
        let registry = Registry::new();
        let ticket = registry.register(peer(2000));

        let info = registry.lookup(ticket.id).unwrap();
        assert_eq!(info.peer, peer(2000));
        assert!(registry.lookup(999).is_none());
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = Registry::new();
        let ticket = registry.register(peer(2000));

        registry.unregister(ticket.id);
        registry.unregister(ticket.id); // no-op, must not panic
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fires_closer_and_removes() {
        let registry = Registry::new();
        let ticket = registry.register(peer(2000));
        let closer = Arc::clone(&ticket.closer);

        let info = registry.disconnect(ticket.id).unwrap();
        assert_eq!(info.peer, peer(2000));
        assert!(registry.lookup(ticket.id).is_none());

        // The permit was stored by notify_one, so this resolves immediately
        closer.notified().await;
    }

    #[test]
    fn test_disconnect_unknown_id_leaves_registry_unchanged() {
        let registry = Registry::new();
        registry.register(peer(2000));

        assert!(registry.disconnect(42).is_none());
        assert_eq!(registry.len(), 1);

        // Second disconnect of an id that was just removed reports not-found
        assert!(registry.disconnect(1).is_some());
        assert!(registry.disconnect(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_empties_and_reports_all() {
        let registry = Registry::new();
        registry.register(peer(2000));
        registry.register(peer(2001));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_concurrent_register_unregister_consistency() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let ticket = registry.register(peer(3000 + i));
                    let _ = registry.list();
                    registry.unregister(ticket.id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());
    }
}
