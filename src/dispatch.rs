//! Sync/async dispatch engine.
//!
//! Outgoing sync requests are correlated to their responses through a
//! per-connection [`PendingTable`]: registering produces a fresh correlation
//! id and a single-resolution receiver; exactly one of {matching response,
//! timeout, connection closed} resolves it, the first wins, and the entry is
//! removed immediately so a late duplicate is discarded.
//!
//! Inbound frames are routed here from every read loop, outbound supervisor
//! and inbound listener alike, and either resolve a pending request, invoke
//! an application callback, or (for sync requests) ship the callback's reply
//! back out over the same connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{MeshError, Result};
use crate::events::EventsHandle;
use crate::frame::{self, CorrelationId, FrameBody, FrameHeader, FrameKind};
use crate::peer::Peer;
use crate::settings::MeshSettings;
use crate::transport::{BoxedReader, ConnWriter};

type ResponseSlot = oneshot::Sender<Result<Vec<u8>>>;

/// Outstanding sync requests on one connection, keyed by correlation id.
///
/// The lock guards only map access; no I/O ever happens while it is held,
/// and a caller's blocking wait happens on its own oneshot receiver.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<HashMap<CorrelationId, ResponseSlot>>,
    closed: AtomicBool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request. The returned correlation id is unique among
    /// requests currently outstanding on this connection.
    pub fn register(&self) -> Result<(CorrelationId, oneshot::Receiver<Result<Vec<u8>>>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = frame::new_correlation_id()?;
            if let std::collections::hash_map::Entry::Vacant(slot) = inner.entry(id) {
                slot.insert(tx);
                return Ok((id, rx));
            }
            // 128-bit collision among outstanding requests: retry.
        }
    }

    /// Resolve an entry with a response payload. Returns false if no request
    /// with this id is outstanding (already timed out, or foreign id).
    pub fn resolve(&self, id: &CorrelationId, payload: Vec<u8>) -> bool {
        let slot = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.remove(id)
        };
        match slot {
            Some(tx) => {
                let _ = tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it (caller gave up waiting).
    pub fn remove(&self, id: &CorrelationId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(id);
    }

    /// Fail every outstanding request with a connection-closed result and
    /// refuse new registrations. Called when the owning connection dies.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<ResponseSlot> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(MeshError::ConnectionClosed));
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Issue one sync request over `writer` and wait for its resolution.
///
/// The wait is scoped to the caller; no shared lock is held while blocked.
pub(crate) async fn sync_call(
    writer: &ConnWriter,
    pending: &PendingTable,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let (id, rx) = pending.register()?;

    if let Err(e) = writer
        .write_frame(FrameKind::SyncRequest, id, payload)
        .await
    {
        pending.remove(&id);
        return Err(e.into());
    }
    trace!(corr = %hex::encode(&id[..4]), len = payload.len(), "sync request sent");

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        // Resolver dropped without sending: connection teardown.
        Ok(Err(_)) => Err(MeshError::ConnectionClosed),
        Err(_) => {
            pending.remove(&id);
            Err(MeshError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Everything a read loop needs to dispatch one connection's frames.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub settings: Arc<MeshSettings>,
    pub events: EventsHandle,
    pub pending: Arc<PendingTable>,
    pub writer: ConnWriter,
}

impl DispatchContext {
    /// Handle one frame whose header has been read; consumes exactly the
    /// frame's payload from `reader`.
    pub async fn handle_frame(
        &self,
        header: &FrameHeader,
        reader: &mut BoxedReader,
        peer: &Peer,
    ) -> Result<()> {
        let chunk = self.settings.stream_buffer_size;
        let mut body = FrameBody::new(reader, header.content_length);

        match header.kind {
            FrameKind::SyncResponse => {
                let payload = body.read_to_end(chunk).await?;
                if self.pending.resolve(&header.correlation_id, payload) {
                    trace!(
                        peer = %peer,
                        corr = %hex::encode(&header.correlation_id[..4]),
                        "sync response matched"
                    );
                } else {
                    debug!(
                        peer = %peer,
                        corr = %hex::encode(&header.correlation_id[..4]),
                        "discarding sync response with no outstanding request"
                    );
                }
            }
            FrameKind::Async => {
                let events = self.events.get();
                let ok = if self.settings.buffer_payloads {
                    let payload = body.read_to_end(chunk).await?;
                    events.on_async_message(peer, payload).await
                } else {
                    let ok = events
                        .on_async_stream(peer, header.content_length, &mut body)
                        .await;
                    body.drain(chunk).await?;
                    ok
                };
                if !ok {
                    debug!(peer = %peer, "async message handler returned false");
                }
            }
            FrameKind::SyncRequest => {
                let events = self.events.get();
                let response = if self.settings.buffer_payloads {
                    let payload = body.read_to_end(chunk).await?;
                    events.on_sync_message(peer, payload).await
                } else {
                    let response = events
                        .on_sync_stream(peer, header.content_length, &mut body)
                        .await;
                    body.drain(chunk).await?;
                    response
                };
                self.writer
                    .write_frame(FrameKind::SyncResponse, header.correlation_id, &response)
                    .await?;
                trace!(
                    peer = %peer,
                    corr = %hex::encode(&header.correlation_id[..4]),
                    len = response.len(),
                    "sync response written"
                );
            }
        }
        Ok(())
    }

    /// Handle one Async frame whose payload was already buffered (the
    /// listener does this while sniffing for the handshake announcement).
    pub async fn handle_buffered_async(&self, payload: Vec<u8>, peer: &Peer) -> Result<()> {
        let events = self.events.get();
        let ok = if self.settings.buffer_payloads {
            events.on_async_message(peer, payload).await
        } else {
            let mut slice: &[u8] = &payload;
            let mut body = FrameBody::new(&mut slice, payload.len() as u64);
            events
                .on_async_stream(peer, payload.len() as u64, &mut body)
                .await
        };
        if !ok {
            debug!(peer = %peer, "async message handler returned false");
        }
        Ok(())
    }
}

/// Read loop for an outbound connection: frames in, dispatch, until the
/// stream ends or a protocol error closes it.
pub(crate) async fn run_read_loop(
    reader: &mut BoxedReader,
    ctx: &DispatchContext,
    peer: &Peer,
) -> Result<()> {
    loop {
        let header = match frame::read_header(reader).await? {
            Some(h) => h,
            None => {
                debug!(peer = %peer, "remote closed the connection");
                return Ok(());
            }
        };
        ctx.handle_frame(&header, reader, peer).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> CorrelationId {
        [byte; 16]
    }

    #[tokio::test]
    async fn resolution_is_first_wins_and_removes() {
        let table = PendingTable::new();
        let (corr, rx) = table.register().unwrap();
        assert_eq!(table.outstanding(), 1);

        assert!(table.resolve(&corr, b"first".to_vec()));
        assert_eq!(table.outstanding(), 0);
        // Second resolution finds nothing: the late duplicate is ignored.
        assert!(!table.resolve(&corr, b"second".to_vec()));

        assert_eq!(rx.await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn foreign_correlation_id_not_resolved() {
        let table = PendingTable::new();
        let (_corr, _rx) = table.register().unwrap();
        assert!(!table.resolve(&id(0xEE), Vec::new()));
        assert_eq!(table.outstanding(), 1);
    }

    #[tokio::test]
    async fn fail_all_unblocks_waiters_and_closes_table() {
        let table = PendingTable::new();
        let (_a, rx_a) = table.register().unwrap();
        let (_b, rx_b) = table.register().unwrap();

        table.fail_all();
        assert!(matches!(rx_a.await.unwrap(), Err(MeshError::ConnectionClosed)));
        assert!(matches!(rx_b.await.unwrap(), Err(MeshError::ConnectionClosed)));

        // Closed tables refuse new registrations.
        assert!(matches!(
            table.register(),
            Err(MeshError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn remove_after_timeout_discards_late_response() {
        let table = PendingTable::new();
        let (corr, rx) = table.register().unwrap();

        table.remove(&corr);
        drop(rx);
        assert!(!table.resolve(&corr, b"too late".to_vec()));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn concurrent_registrations_get_distinct_ids() {
        let table = PendingTable::new();
        let (a, _rx_a) = table.register().unwrap();
        let (b, _rx_b) = table.register().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.outstanding(), 2);
    }
}
