//! Mesh self-assembly handshake.
//!
//! Immediately after a connection is established (and authenticated), the
//! dialing side announces its own listener endpoint with a [`ConnectRequest`]
//! carried as the payload of one `Async` frame. The accepting side uses it to
//! bind the inbound connection to a logical peer and, when automatic binding
//! is enabled, to add the reciprocal outbound peer. This is what turns a
//! one-sided `add_peer` into a bidirectional mesh link.
//!
//! The payload is a JSON object with keys `"Ip"` and `"Port"`; the field
//! names are fixed by the wire format.

use serde::{Deserialize, Serialize};

use crate::peer::Peer;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "Ip")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

impl ConnectRequest {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Two string/int fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Try to interpret an async payload as a connect request. Returns `None`
    /// for ordinary application traffic.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.ip.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_match_protocol() {
        let req = ConnectRequest::new("192.168.1.5", 8000);
        let json = String::from_utf8(req.encode()).unwrap();
        assert!(json.contains("\"Ip\""), "got {json}");
        assert!(json.contains("\"Port\""), "got {json}");
    }

    #[test]
    fn round_trip() {
        let req = ConnectRequest::new("10.0.0.2", 9001);
        let decoded = ConnectRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.peer(), Peer::new("10.0.0.2", 9001));
    }

    #[test]
    fn application_payloads_are_not_connect_requests() {
        assert!(ConnectRequest::decode(b"hello there").is_none());
        assert!(ConnectRequest::decode(b"{\"Topic\":\"x\"}").is_none());
        assert!(ConnectRequest::decode(b"").is_none());
    }
}
