//! Process-wide mesh configuration.
//!
//! A [`MeshSettings`] is constructed once, validated when the [`Mesh`] is
//! built, and never mutated after `start()`. Every supervisor and the
//! listener read from the same shared copy.
//!
//! [`Mesh`]: crate::Mesh

use std::time::Duration;

use crate::error::{MeshError, Result};

/// Preshared keys are exactly 16 bytes on the wire.
pub const PRESHARED_KEY_LEN: usize = 16;

/// Default buffer size for chunked payload reads.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 65536;

#[derive(Clone, Debug)]
pub struct MeshSettings {
    /// Reconnect automatically when an outbound link drops.
    pub automatic_reconnect: bool,

    /// Fixed interval between reconnect attempts. No backoff growth and no
    /// attempt cap: the supervisor retries at this cadence until the peer is
    /// removed. Intentional behavior inherited from the protocol.
    pub reconnect_interval: Duration,

    /// Shared secret used to mutually authenticate mesh members. When set,
    /// every connection (both directions) performs the key exchange before
    /// any frame traffic. Must be exactly [`PRESHARED_KEY_LEN`] bytes.
    pub preshared_key: Option<Vec<u8>>,

    /// Accept peers whose TLS certificates cannot be verified.
    pub accept_invalid_certificates: bool,

    /// Require TLS client certificates from connecting peers.
    pub mutually_authenticate: bool,

    /// Deliver payloads to handlers as buffered byte vectors. When false,
    /// handlers receive a bounded stream of exactly `content_length` bytes
    /// via the stream callbacks instead.
    pub buffer_payloads: bool,

    /// Chunk size for reading payloads off the wire.
    pub stream_buffer_size: usize,

    /// When an unknown peer announces itself on an inbound connection, add
    /// the reciprocal outbound peer automatically (subject to the
    /// `on_peer_connect_request` callback).
    pub automatic_bind_peer: bool,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            automatic_reconnect: true,
            reconnect_interval: Duration::from_millis(1000),
            preshared_key: None,
            accept_invalid_certificates: true,
            mutually_authenticate: false,
            buffer_payloads: true,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            automatic_bind_peer: true,
        }
    }
}

impl MeshSettings {
    /// Validate settings at mesh construction time.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.stream_buffer_size == 0 {
            return Err(MeshError::Configuration(
                "stream buffer size must be greater than zero".into(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(MeshError::Configuration(
                "reconnect interval must be greater than zero".into(),
            ));
        }
        if let Some(key) = &self.preshared_key {
            if key.len() != PRESHARED_KEY_LEN {
                return Err(MeshError::Configuration(format!(
                    "preshared key must be exactly {} bytes (got {})",
                    PRESHARED_KEY_LEN,
                    key.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MeshSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_buffer_size_rejected() {
        let settings = MeshSettings {
            stream_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(MeshError::Configuration(_))
        ));
    }

    #[test]
    fn zero_reconnect_interval_rejected() {
        let settings = MeshSettings {
            reconnect_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn short_preshared_key_rejected() {
        let settings = MeshSettings {
            preshared_key: Some(b"too short".to_vec()),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = MeshSettings {
            preshared_key: Some(vec![7u8; PRESHARED_KEY_LEN]),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }
}
