//! # Meshkit - Full-Mesh Peer Messaging Library
//!
//! Meshkit connects a set of cooperating nodes into a full mesh: every node
//! listens for inbound connections and maintains one supervised outbound
//! connection to each configured peer. On top of those links it provides:
//!
//! - **Async messaging**: fire-and-forget byte payloads to one peer or all
//! - **Sync messaging**: request/response with correlation ids and timeouts
//! - **Streamed delivery**: large payloads handed to handlers as a stream
//!   instead of being buffered in memory
//! - **Self-healing links**: dropped connections reconnect on a fixed
//!   interval until the peer is removed
//! - **Auto-binding**: unknown inbound peers can be adopted automatically,
//!   so a node list propagates itself into a full mesh
//!
//! ## Architecture
//!
//! Each node runs both roles at once:
//! - One **outbound supervisor** task per peer owns that link's lifecycle
//!   (connect, authenticate, announce, read, reconnect)
//! - One **inbound listener** accepts connections and resolves the remote's
//!   identity from its connect-request announcement
//! - A shared **directory** is the single source of truth for membership
//!   and link health
//!
//! Connections optionally run over TLS and can be gated by a 16-byte
//! preshared key exchanged before any framing.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `mesh` | High-level [`Mesh`] API combining all components |
//! | `peer` | Peer identity, link state, membership directory |
//! | `frame` | Wire framing: headers, correlation ids, streamed bodies |
//! | `handshake` | Peer-identity announcement exchanged after connect |
//! | `transport` | TCP/TLS dialing, listening, preshared-key exchange |
//! | `client` | Outbound connection supervisor with reconnect |
//! | `server` | Inbound listener and connection binding |
//! | `dispatch` | Frame routing, sync correlation, handler callbacks |
//! | `events` | Application callback trait |
//! | `settings` | Tunables with production defaults |

mod client;
mod dispatch;
mod error;
mod events;
mod frame;
mod handshake;
mod mesh;
mod peer;
mod server;
mod settings;
mod transport;

pub use error::{MeshError, Result};
pub use events::{DefaultEvents, MeshEvents};
pub use frame::FrameBody;
pub use handshake::ConnectRequest;
pub use mesh::Mesh;
pub use peer::{Peer, PeerStatus};
pub use settings::MeshSettings;
