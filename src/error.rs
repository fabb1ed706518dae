//! Error taxonomy for the mesh.
//!
//! Failures local to one peer connection never affect other peers' links.
//! Connect and authentication errors are absorbed by the supervisor's
//! reconnect loop and only become visible through health queries; everything
//! else surfaces to the caller that triggered it.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    /// Invalid settings detected at construction. Fatal: no mesh is built.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transport-level connect failure. Recovered by the reconnect loop.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Preshared-key mismatch during the connection handshake.
    #[error("authentication with {addr} failed")]
    Authentication { addr: String },

    /// Malformed frame on the wire. Closes the offending connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A sync call's deadline passed before a response arrived.
    #[error("sync request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Operation referenced a (host, port) that is not in the directory.
    #[error("unknown peer {host}:{port}")]
    UnknownPeer { host: String, port: u16 },

    /// Peer is known but its outbound link is currently down.
    #[error("peer {host}:{port} is not connected")]
    NotConnected { host: String, port: u16 },

    /// The connection closed while a request was outstanding on it.
    #[error("connection closed")]
    ConnectionClosed,

    /// Broadcast reached some peers but not all of them.
    #[error("broadcast failed for {failed} of {total} connected peers")]
    Broadcast { failed: usize, total: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MeshError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        MeshError::Protocol(msg.into())
    }
}
