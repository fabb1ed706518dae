//! Inbound listener.
//!
//! Accepts connections from remote peers, runs the responder side of the
//! transport handshake, and drives a per-connection read loop. An inbound
//! connection starts out anonymous: frames are attributed to the remote
//! socket address until the peer announces itself with a connect request,
//! at which point the connection is bound to the directory's peer entry.
//! Inbound connections never reconnect from this side; the remote's own
//! supervisor owns that.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchContext, PendingTable};
use crate::error::Result;
use crate::events::EventsHandle;
use crate::frame::{self, FrameBody, FrameKind};
use crate::handshake::ConnectRequest;
use crate::peer::Peer;
use crate::settings::MeshSettings;
use crate::transport::{BoxedReader, ConnWriter, Listener};

/// Upper bound on an async payload worth buffering to probe for a connect
/// request. Anything larger is ordinary application traffic.
const CONNECT_REQUEST_MAX: u64 = 1024;

/// Decides what happens when an inbound connection announces a peer
/// identity. Implemented by the mesh coordinator, which owns the
/// directory and the auto-bind policy.
#[async_trait]
pub(crate) trait InboundBinder: Send + Sync {
    /// Returns the directory's peer instance if the connection is now
    /// bound, `None` if the announcement was declined.
    async fn bind_inbound(&self, announced: Peer) -> Option<Peer>;
}

/// Running listener task plus the handle to stop it.
pub(crate) struct Server {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Server {
    pub async fn start(
        local: &Peer,
        settings: Arc<MeshSettings>,
        events: EventsHandle,
        binder: Arc<dyn InboundBinder>,
    ) -> Result<Self> {
        let listener = Listener::bind(local, settings.clone()).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            settings,
            events,
            binder,
            cancel.clone(),
        ));
        info!(addr = %local_addr, tls = local.use_tls, "listener started");
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .is_err()
        {
            warn!("listener task did not wind down in time");
        }
    }
}

async fn accept_loop(
    listener: Listener,
    settings: Arc<MeshSettings>,
    events: EventsHandle,
    binder: Arc<dyn InboundBinder>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((reader, writer, remote)) => {
                debug!(remote = %remote, "inbound connection accepted");
                tokio::spawn(handle_connection(
                    reader,
                    writer,
                    remote,
                    settings.clone(),
                    events.clone(),
                    binder.clone(),
                    cancel.clone(),
                ));
            }
            // Handshake failures are per-connection; keep listening.
            Err(e) => warn!(error = %e, "inbound connection rejected"),
        }
    }
    debug!("listener stopped");
}

async fn handle_connection(
    mut reader: BoxedReader,
    writer: ConnWriter,
    remote: SocketAddr,
    settings: Arc<MeshSettings>,
    events: EventsHandle,
    binder: Arc<dyn InboundBinder>,
    cancel: CancellationToken,
) {
    let ctx = DispatchContext {
        settings,
        events,
        pending: Arc::new(PendingTable::new()),
        writer: writer.clone(),
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = drive_connection(&mut reader, &ctx, remote, binder.as_ref()) => result,
    };
    if let Err(e) = result {
        warn!(remote = %remote, error = %e, "inbound connection failed");
    }

    ctx.pending.fail_all();
    writer.shutdown().await;
    debug!(remote = %remote, "inbound connection closed");
}

/// Frame loop for one inbound connection. While unbound, small async
/// frames are buffered and probed for a connect request; everything else
/// is dispatched as usual.
async fn drive_connection(
    reader: &mut BoxedReader,
    ctx: &DispatchContext,
    remote: SocketAddr,
    binder: &dyn InboundBinder,
) -> Result<()> {
    let mut peer = Peer::new(remote.ip().to_string(), remote.port());
    let mut bound = false;

    loop {
        let header = match frame::read_header(reader).await? {
            Some(h) => h,
            None => {
                debug!(remote = %remote, "remote closed the connection");
                return Ok(());
            }
        };

        if !bound
            && header.kind == FrameKind::Async
            && header.content_length <= CONNECT_REQUEST_MAX
        {
            let payload = FrameBody::new(reader, header.content_length)
                .read_to_end(ctx.settings.stream_buffer_size)
                .await?;
            if let Some(request) = ConnectRequest::decode(&payload) {
                let announced = request.peer();
                match binder.bind_inbound(announced.clone()).await {
                    Some(directory_peer) => {
                        info!(remote = %remote, peer = %directory_peer, "inbound connection bound");
                        peer = directory_peer;
                        bound = true;
                    }
                    None => {
                        debug!(remote = %remote, peer = %announced, "connect request declined");
                    }
                }
                // The handshake frame itself is never delivered to handlers.
                continue;
            }
            ctx.handle_buffered_async(payload, &peer).await?;
            continue;
        }

        ctx.handle_frame(&header, reader, &peer).await?;
    }
}
