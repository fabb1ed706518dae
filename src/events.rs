//! Application callback surface.
//!
//! The host application registers one implementation of [`MeshEvents`];
//! every method has a default so implementors override only what they need.
//! Boolean results are advisory; the mesh logs a `false` and moves on.

use async_trait::async_trait;

use crate::frame::FrameBody;
use crate::peer::Peer;

/// Events the mesh raises toward the host application.
///
/// `on_async_message`/`on_sync_message` fire when payload buffering is
/// enabled (the default); `on_async_stream`/`on_sync_stream` fire instead
/// when [`MeshSettings::buffer_payloads`] is false, handing the payload over
/// as a bounded stream of exactly `content_length` bytes. Whatever the
/// handler leaves unread is discarded by the connection's read loop.
///
/// [`MeshSettings::buffer_payloads`]: crate::MeshSettings::buffer_payloads
#[async_trait]
pub trait MeshEvents: Send + Sync {
    /// An outbound link to `peer` came up (once per logical session).
    async fn on_peer_connected(&self, _peer: &Peer) -> bool {
        true
    }

    /// An outbound link to `peer` went down (once per logical session).
    async fn on_peer_disconnected(&self, _peer: &Peer) -> bool {
        true
    }

    /// The preshared-key exchange with `peer` was rejected.
    async fn on_authentication_failed(&self, _peer: &Peer) -> bool {
        true
    }

    /// A fire-and-forget message arrived.
    async fn on_async_message(&self, _peer: &Peer, _payload: Vec<u8>) -> bool {
        true
    }

    /// A sync request arrived; the returned bytes are shipped back to the
    /// caller as the response.
    async fn on_sync_message(&self, _peer: &Peer, _payload: Vec<u8>) -> Vec<u8> {
        Vec::new()
    }

    /// Streamed variant of [`on_async_message`](Self::on_async_message).
    async fn on_async_stream(
        &self,
        _peer: &Peer,
        _content_length: u64,
        _body: &mut FrameBody<'_>,
    ) -> bool {
        true
    }

    /// Streamed variant of [`on_sync_message`](Self::on_sync_message).
    async fn on_sync_stream(
        &self,
        _peer: &Peer,
        _content_length: u64,
        _body: &mut FrameBody<'_>,
    ) -> Vec<u8> {
        Vec::new()
    }

    /// An unknown peer announced itself on an inbound connection. Return
    /// `false` to veto the automatic reciprocal `add_peer`.
    async fn on_peer_connect_request(&self, _announced: &Peer) -> bool {
        true
    }
}

/// No-op implementation used until the application registers its own.
pub struct DefaultEvents;

#[async_trait]
impl MeshEvents for DefaultEvents {}

/// Shared, swappable handle to the registered event implementation.
///
/// Components hold a clone and take a snapshot per invocation; swapping the
/// implementation never blocks a callback already in flight.
#[derive(Clone)]
pub(crate) struct EventsHandle {
    inner: std::sync::Arc<std::sync::RwLock<std::sync::Arc<dyn MeshEvents>>>,
}

impl EventsHandle {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(std::sync::Arc::new(DefaultEvents))),
        }
    }

    pub fn set(&self, events: std::sync::Arc<dyn MeshEvents>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = events;
    }

    pub fn get(&self) -> std::sync::Arc<dyn MeshEvents> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
