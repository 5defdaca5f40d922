//! Embeddable websocket server core.
//!
//! `gossamer` owns the connection service: a single-threaded loop that
//! multiplexes the public listening socket, one loopback rendezvous
//! socket per protocol, and every accepted client connection. The
//! upgrade/framing codec sits behind the [`WireEngine`] seam; user
//! protocols receive callbacks as connections are established, receive
//! data, get broadcast to, and close.
//!
//! [`Server::create`] binds the listener, launches the service loop on
//! a background thread and returns a handle whose
//! [`broadcast`](Server::broadcast) is safe to call from any thread:
//! payloads travel to the loop over the protocol's rendezvous socket
//! and are fanned out to every established connection of that
//! protocol.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod support;
pub mod logging;
pub mod config;
pub mod transport;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod table;
pub mod rendezvous;
pub mod service;
pub mod server;

/// Bytes callers must keep free in front of any payload destined for
/// the framing layer, so frame headers can be written in place.
pub const SEND_BUFFER_PRE_PADDING: usize = 12;
/// Bytes callers must keep free after such a payload for trailing
/// framing.
pub const SEND_BUFFER_POST_PADDING: usize = 1;

/// Default descriptor table capacity: listener, rendezvous slots and
/// client connections all count against it.
pub const MAX_CLIENTS: usize = 100;
/// Upper bound on the number of protocols a single server can carry.
pub const MAX_PROTOCOLS: usize = 10;
/// Largest payload a single broadcast can carry.
pub const MAX_BROADCAST_PAYLOAD: usize = 2048;
/// Capacity of the per-connection handshake scratch buffer.
pub const MAX_HEADER_NAME_LEN: usize = 64;

pub use crate::config::ServerConfig;
pub use crate::connection::{Connection, ConnectionState, TokenKind};
pub use crate::engine::{Advance, WireEngine, WireEvent};
pub use crate::protocol::{CallbackReason, ConnId, Protocol, Protocols};
pub use crate::server::Server;
pub use crate::service::ServiceCtx;
pub use crate::support::{ErrorType, NetworkError, NetworkResult};
