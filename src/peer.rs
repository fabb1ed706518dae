//! Peer identity and the mesh membership directory.
//!
//! A [`Peer`] is identified by its `(host, port)` pair; that pair is the
//! unique key everywhere in the crate. The [`Directory`] is the only shared
//! membership state. The underlying map is never handed out for direct
//! mutation, and no network I/O happens while its lock is held.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// One mesh member.
///
/// Equality and hashing consider only `(host, port)`: two peers with the same
/// endpoint are the same peer regardless of TLS material.
#[derive(Clone, Debug)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    /// Dial (or accept) this peer over TLS.
    pub use_tls: bool,
    /// PEM certificate chain presented on this link, if any.
    pub certificate: Option<PathBuf>,
    /// PEM private key matching `certificate`.
    pub private_key: Option<PathBuf>,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
            certificate: None,
            private_key: None,
        }
    }

    pub fn with_tls(mut self, certificate: Option<PathBuf>, private_key: Option<PathBuf>) -> Self {
        self.use_tls = true;
        self.certificate = certificate;
        self.private_key = private_key;
        self
    }

    /// `host:port` rendering used for dialing and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn key(&self) -> PeerKey {
        PeerKey {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PeerKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transient connection state for one peer, owned by its supervisor.
///
/// Shared (via `Arc`) between the directory, the supervisor task, and health
/// queries; every field is independently synchronized so readers never block
/// the supervisor.
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    connected: AtomicBool,
    last_connected_at: Mutex<Option<SystemTime>>,
    last_disconnected_at: Mutex<Option<SystemTime>>,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.last_connected_at.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(SystemTime::now());
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self
            .last_disconnected_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(SystemTime::now());
    }

    pub fn last_connected_at(&self) -> Option<SystemTime> {
        *self.last_connected_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_disconnected_at(&self) -> Option<SystemTime> {
        *self
            .last_disconnected_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of one directory entry.
#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub peer: Peer,
    pub connected: bool,
    pub last_connected_at: Option<SystemTime>,
    pub last_disconnected_at: Option<SystemTime>,
}

struct PeerEntry {
    peer: Peer,
    link: Arc<LinkState>,
}

/// The authoritative set of known peers.
#[derive(Default)]
pub(crate) struct Directory {
    inner: Mutex<HashMap<PeerKey, PeerEntry>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Returns the fresh link state, or `None` if the
    /// `(host, port)` key is already present.
    pub fn add(&self, peer: Peer) -> Option<Arc<LinkState>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = peer.key();
        if inner.contains_key(&key) {
            return None;
        }
        let link = Arc::new(LinkState::default());
        inner.insert(
            key,
            PeerEntry {
                peer,
                link: link.clone(),
            },
        );
        Some(link)
    }

    /// Remove a peer. Returns its entry so the caller can stop the
    /// supervisor after the lock is released.
    pub fn remove(&self, host: &str, port: u16) -> Option<Peer> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .remove(&PeerKey {
                host: host.to_string(),
                port,
            })
            .map(|entry| entry.peer)
    }

    pub fn find(&self, host: &str, port: u16) -> Option<Peer> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&PeerKey {
                host: host.to_string(),
                port,
            })
            .map(|entry| entry.peer.clone())
    }

    pub fn link(&self, host: &str, port: u16) -> Option<Arc<LinkState>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&PeerKey {
                host: host.to_string(),
                port,
            })
            .map(|entry| entry.link.clone())
    }

    pub fn contains(&self, host: &str, port: u16) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(&PeerKey {
            host: host.to_string(),
            port,
        })
    }

    /// Snapshot of every entry. Insertion order is not preserved.
    pub fn snapshot(&self) -> Vec<PeerStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .values()
            .map(|entry| PeerStatus {
                peer: entry.peer.clone(),
                connected: entry.link.is_connected(),
                last_connected_at: entry.link.last_connected_at(),
                last_disconnected_at: entry.link.last_disconnected_at(),
            })
            .collect()
    }

    /// True iff every directory peer currently has a live outbound link.
    pub fn all_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values().all(|entry| entry.link.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_key() {
        let dir = Directory::new();
        assert!(dir.add(Peer::new("127.0.0.1", 9000)).is_some());
        assert!(dir.add(Peer::new("127.0.0.1", 9000)).is_none());
        assert!(dir.add(Peer::new("127.0.0.1", 9001)).is_some());
    }

    #[test]
    fn peers_compare_by_host_and_port_only() {
        let plain = Peer::new("10.0.0.1", 8000);
        let tls = Peer::new("10.0.0.1", 8000).with_tls(None, None);
        assert_eq!(plain, tls);
        assert_ne!(plain, Peer::new("10.0.0.1", 8001));
    }

    #[test]
    fn remove_returns_entry_once() {
        let dir = Directory::new();
        dir.add(Peer::new("a", 1));
        assert!(dir.remove("a", 1).is_some());
        assert!(dir.remove("a", 1).is_none());
        assert!(!dir.contains("a", 1));
    }

    #[test]
    fn link_state_drives_health() {
        let dir = Directory::new();
        let link = dir.add(Peer::new("a", 1)).unwrap();
        assert!(!dir.all_connected());

        link.mark_connected();
        assert!(dir.all_connected());
        assert!(link.last_connected_at().is_some());

        link.mark_disconnected();
        assert!(!dir.all_connected());
        assert!(link.last_disconnected_at().is_some());

        let statuses = dir.snapshot();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].connected);
    }
}
