//! Mesh coordinator.
//!
//! [`Mesh`] is the public face of the crate: it owns the peer directory,
//! the inbound listener, and one outbound supervisor per peer, and exposes
//! the messaging operations on top of them. Every node runs both roles at
//! once, so a full mesh is just every node listing every other node as a
//! peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{ActiveLink, SupervisorHandle};
use crate::dispatch::sync_call;
use crate::error::{MeshError, Result};
use crate::events::{EventsHandle, MeshEvents};
use crate::frame::{FrameKind, NO_CORRELATION};
use crate::peer::{Directory, LinkState, Peer, PeerStatus};
use crate::server::{InboundBinder, Server};
use crate::settings::MeshSettings;

/// A mesh node: listener, peer directory, and outbound supervisors behind
/// one handle. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    local: Peer,
    settings: Arc<MeshSettings>,
    events: EventsHandle,
    directory: Directory,
    supervisors: Mutex<HashMap<crate::peer::PeerKey, SupervisorHandle>>,
    server: Mutex<Option<Server>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("local", &self.inner.local)
            .finish_non_exhaustive()
    }
}

impl Mesh {
    /// Create a node that will listen on `local`. Peers can be added
    /// before or after [`start`](Mesh::start).
    pub fn new(local: Peer, settings: MeshSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(MeshInner {
                local,
                settings: Arc::new(settings),
                events: EventsHandle::new(),
                directory: Directory::new(),
                supervisors: Mutex::new(HashMap::new()),
                server: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Install the event handler. Takes effect for all subsequent
    /// callbacks, including on connections already up.
    pub fn set_events(&self, events: Arc<dyn MeshEvents>) {
        self.inner.events.set(events);
    }

    pub fn local_peer(&self) -> &Peer {
        &self.inner.local
    }

    /// Bind the listener and start dialing every known peer.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Configuration("mesh already started".into()));
        }

        let binder: Arc<dyn InboundBinder> = self.inner.clone();
        let server = match Server::start(
            &self.inner.local,
            self.inner.settings.clone(),
            self.inner.events.clone(),
            binder,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self
            .inner
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(server);

        // Peers added before start have directory entries but no
        // supervisor yet.
        for status in self.inner.directory.snapshot() {
            let peer = status.peer;
            if let Some(link) = self.inner.directory.link(&peer.host, peer.port) {
                self.inner.spawn_supervisor(peer, link);
            }
        }

        info!(local = %self.inner.local, "mesh started");
        Ok(())
    }

    /// Stop the listener and every supervisor. Peers stay in the
    /// directory; a later `start` dials them again.
    pub async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);

        let server = self
            .inner
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(server) = server {
            server.stop().await;
        }

        let supervisors: Vec<SupervisorHandle> = {
            let mut map = self
                .inner
                .supervisors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in supervisors {
            handle.stop().await;
        }

        info!(local = %self.inner.local, "mesh stopped");
    }

    /// Address the listener actually bound, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.local_addr())
    }

    /// Add `peer` to the directory. Returns false (and changes nothing) if
    /// the `(host, port)` pair is already present. Once the mesh is started
    /// this immediately begins dialing.
    pub fn add_peer(&self, peer: Peer) -> bool {
        let added = self.inner.add_peer_entry(peer.clone());
        if !added {
            debug!(peer = %peer, "peer already known");
        }
        added
    }

    /// Remove a peer: stop its supervisor, close its connection, and fail
    /// every sync call still waiting on it.
    pub async fn remove_peer(&self, host: &str, port: u16) -> Result<()> {
        let removed = self.inner.directory.remove(host, port);
        let handle = self
            .inner
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&Peer::new(host, port).key());

        if removed.is_none() && handle.is_none() {
            return Err(MeshError::UnknownPeer {
                host: host.to_string(),
                port,
            });
        }
        if let Some(handle) = handle {
            handle.stop().await;
        }
        info!(host, port, "peer removed");
        Ok(())
    }

    /// Send a fire-and-forget message to one peer.
    pub async fn send(&self, host: &str, port: u16, data: &[u8]) -> Result<()> {
        let link = self.inner.active_link(host, port)?;
        link.writer
            .write_frame(FrameKind::Async, NO_CORRELATION, data)
            .await?;
        Ok(())
    }

    /// Send a request and wait up to `timeout` for the correlated response.
    pub async fn send_sync(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let link = self.inner.active_link(host, port)?;
        sync_call(&link.writer, &link.pending, data, timeout).await
    }

    /// Send `data` to every peer with a live connection. Peers without a
    /// connection are skipped, not counted as failures.
    pub async fn broadcast(&self, data: &[u8]) -> Result<()> {
        let links: Vec<(Peer, ActiveLink)> = {
            let map = self
                .inner
                .supervisors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            self.inner
                .directory
                .snapshot()
                .into_iter()
                .filter_map(|status| {
                    let link = map.get(&status.peer.key())?.active()?;
                    Some((status.peer, link))
                })
                .collect()
        };

        let total = links.len();
        let mut failed = 0;
        for (peer, link) in links {
            if let Err(e) = link
                .writer
                .write_frame(FrameKind::Async, NO_CORRELATION, data)
                .await
            {
                warn!(peer = %peer, error = %e, "broadcast send failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(MeshError::Broadcast { failed, total });
        }
        Ok(())
    }

    /// Point-in-time view of every known peer.
    pub fn peers(&self) -> Vec<PeerStatus> {
        self.inner.directory.snapshot()
    }

    /// Peers currently without a live outbound connection.
    pub fn disconnected_peers(&self) -> Vec<Peer> {
        self.inner
            .directory
            .snapshot()
            .into_iter()
            .filter(|status| !status.connected)
            .map(|status| status.peer)
            .collect()
    }

    /// True iff every known peer has a live outbound connection.
    pub fn is_healthy(&self) -> bool {
        self.inner.directory.all_connected()
    }

    pub fn is_peer_healthy(&self, host: &str, port: u16) -> bool {
        self.inner
            .directory
            .link(host, port)
            .map(|link| link.is_connected())
            .unwrap_or(false)
    }
}

impl MeshInner {
    /// Insert into the directory and, when started, begin dialing.
    /// Returns false for a duplicate.
    fn add_peer_entry(&self, peer: Peer) -> bool {
        match self.directory.add(peer.clone()) {
            None => false,
            Some(link) => {
                if self.started.load(Ordering::SeqCst) {
                    self.spawn_supervisor(peer, link);
                }
                true
            }
        }
    }

    fn spawn_supervisor(&self, peer: Peer, link: Arc<LinkState>) {
        let mut map = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&peer.key()) {
            return;
        }
        let handle = SupervisorHandle::spawn(
            peer.clone(),
            link,
            self.local.clone(),
            self.settings.clone(),
            self.events.clone(),
        );
        map.insert(peer.key(), handle);
    }

    fn active_link(&self, host: &str, port: u16) -> Result<ActiveLink> {
        if !self.directory.contains(host, port) {
            return Err(MeshError::UnknownPeer {
                host: host.to_string(),
                port,
            });
        }
        let map = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&Peer::new(host, port).key())
            .and_then(|handle| handle.active())
            .ok_or_else(|| MeshError::NotConnected {
                host: host.to_string(),
                port,
            })
    }
}

#[async_trait]
impl InboundBinder for MeshInner {
    async fn bind_inbound(&self, announced: Peer) -> Option<Peer> {
        if let Some(existing) = self.directory.find(&announced.host, announced.port) {
            return Some(existing);
        }
        if !self.settings.automatic_bind_peer {
            return None;
        }
        if !self.events.get().on_peer_connect_request(&announced).await {
            debug!(peer = %announced, "connect request rejected by handler");
            return None;
        }
        // Reciprocal add: the announcing node becomes a full peer and we
        // dial back to complete the mesh.
        if self.add_peer_entry(announced.clone()) {
            info!(peer = %announced, "peer auto-bound from inbound connection");
        }
        Some(announced)
    }
}
