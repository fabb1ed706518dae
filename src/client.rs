//! Outbound connection supervisor.
//!
//! One supervisor task per configured peer. It owns the whole lifecycle of
//! the outbound link: connect, authenticate, announce local identity, run
//! the read loop, and, when the link drops, wait the configured interval
//! and reconnect. The retry cadence is fixed: no backoff growth, no attempt
//! cap, repeating until the peer is removed. That is intentional protocol
//! behavior, not an oversight.
//!
//! Removing the peer cancels the supervisor; the cancellation check runs
//! before every reconnect attempt and inside every wait, so a removed peer
//! never dials again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{run_read_loop, DispatchContext, PendingTable};
use crate::error::MeshError;
use crate::events::EventsHandle;
use crate::frame::{FrameKind, NO_CORRELATION};
use crate::handshake::ConnectRequest;
use crate::peer::{LinkState, Peer};
use crate::settings::MeshSettings;
use crate::transport::{self, ConnWriter};

/// The live session a supervisor currently holds, shared with senders.
#[derive(Clone)]
pub(crate) struct ActiveLink {
    pub writer: ConnWriter,
    pub pending: Arc<PendingTable>,
}

/// Handle owned by the mesh coordinator; dropping it does not stop the
/// task; call [`stop`](SupervisorHandle::stop).
pub(crate) struct SupervisorHandle {
    active: Arc<Mutex<Option<ActiveLink>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn spawn(
        peer: Peer,
        link: Arc<LinkState>,
        local: Peer,
        settings: Arc<MeshSettings>,
        events: EventsHandle,
    ) -> Self {
        let active: Arc<Mutex<Option<ActiveLink>>> = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            peer,
            link,
            local,
            settings,
            events,
            active.clone(),
            cancel.clone(),
        ));

        Self {
            active,
            cancel,
            task,
        }
    }

    /// Snapshot of the current session, if the link is up.
    pub fn active(&self) -> Option<ActiveLink> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop the supervisor: cancel the state machine, unblock every sync
    /// call still waiting on this link, and close the connection.
    pub async fn stop(self) {
        self.cancel.cancel();
        let active = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(active) = active {
            active.pending.fail_all();
            active.writer.shutdown().await;
        }
        if tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .is_err()
        {
            warn!("supervisor task did not wind down in time");
        }
    }
}

/// The per-peer state machine: Connecting → Authenticating → Connected →
/// Disconnected → (wait) → Connecting, forever, until cancelled.
#[allow(clippy::too_many_arguments)]
async fn run(
    peer: Peer,
    link: Arc<LinkState>,
    local: Peer,
    settings: Arc<MeshSettings>,
    events: EventsHandle,
    active: Arc<Mutex<Option<ActiveLink>>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Connecting (the preshared-key exchange rides inside connect).
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            conn = transport::connect(&peer, &settings) => conn,
        };

        let (mut reader, writer) = match conn {
            Ok(halves) => halves,
            Err(e) => {
                match &e {
                    MeshError::Authentication { .. } => {
                        warn!(peer = %peer, "authentication failed");
                        events.get().on_authentication_failed(&peer).await;
                    }
                    _ => debug!(peer = %peer, error = %e, "connect failed"),
                }
                if !settings.automatic_reconnect {
                    break;
                }
                if wait_for_retry(&settings, &cancel).await {
                    break;
                }
                continue;
            }
        };

        // Announce local identity so the remote can bind this connection
        // (and auto-add the reciprocal peer).
        let hello = ConnectRequest::new(local.host.clone(), local.port).encode();
        if let Err(e) = writer
            .write_frame(FrameKind::Async, NO_CORRELATION, &hello)
            .await
        {
            debug!(peer = %peer, error = %e, "failed to send connect request");
            if !settings.automatic_reconnect {
                break;
            }
            if wait_for_retry(&settings, &cancel).await {
                break;
            }
            continue;
        }

        // Connected.
        let pending = Arc::new(PendingTable::new());
        let session = ActiveLink {
            writer: writer.clone(),
            pending: pending.clone(),
        };
        *active.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        link.mark_connected();
        info!(peer = %peer, "peer connected");
        if !events.get().on_peer_connected(&peer).await {
            debug!(peer = %peer, "peer-connected handler returned false");
        }

        let ctx = DispatchContext {
            settings: settings.clone(),
            events: events.clone(),
            pending: pending.clone(),
            writer: writer.clone(),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = run_read_loop(&mut reader, &ctx, &peer) => result,
        };
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "connection failed");
        }

        // Disconnected: tear the session down exactly once.
        active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        pending.fail_all();
        writer.shutdown().await;
        link.mark_disconnected();
        info!(peer = %peer, "peer disconnected");
        if !events.get().on_peer_disconnected(&peer).await {
            debug!(peer = %peer, "peer-disconnected handler returned false");
        }

        if cancel.is_cancelled() || !settings.automatic_reconnect {
            break;
        }
        if wait_for_retry(&settings, &cancel).await {
            break;
        }
    }
    debug!(peer = %peer, "supervisor stopped");
}

/// Sleep the fixed reconnect interval. Returns true if cancelled, so the
/// caller checks the peer is still wanted before the next attempt.
async fn wait_for_retry(settings: &MeshSettings, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(settings.reconnect_interval) => false,
    }
}
