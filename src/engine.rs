//! Seam between the connection service and the handshake/framing
//! codec. The codec is an external collaborator: it consumes raw bytes
//! off a connection, captures handshake tokens into the record, and
//! surfaces typed events. Every state transition, allocation and
//! callback dispatch stays on the service side of the seam.

use crate::connection::Connection;
use crate::support::NetworkResult;

/// Verdict returned by [`WireEngine::feed_bytes`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Advance {
    /// Keep servicing the connection.
    Continue,
    /// Unrecoverable handshake or framing state; tear the connection
    /// down.
    Close,
}

/// Events the engine surfaces while consuming bytes. The service
/// applies them in the order they were pushed.
#[derive(Debug, Eq, PartialEq)]
pub enum WireEvent {
    /// The upgrade handshake completed and selected a protocol, by
    /// table index.
    Established { protocol: usize },
    /// A complete application message for an established connection.
    Message(Vec<u8>),
    /// A non-upgrade HTTP request; the payload is the requested URI.
    HttpRequest(Vec<u8>),
}

/// Contract of the handshake/framing codec.
pub trait WireEngine: Send {
    /// Consumes bytes freshly read off `conn`. Parsed handshake tokens
    /// go into the record's token table; completed upgrades, decoded
    /// messages and plain HTTP requests are pushed to `out`.
    fn feed_bytes(&mut self, conn: &mut Connection, buf: &[u8], out: &mut Vec<WireEvent>) -> Advance;

    /// Frames `payload` and hands it to the connection's transport.
    /// Buffers built for this purpose must keep
    /// [`SEND_BUFFER_PRE_PADDING`](crate::SEND_BUFFER_PRE_PADDING)
    /// bytes free in front and
    /// [`SEND_BUFFER_POST_PADDING`](crate::SEND_BUFFER_POST_PADDING)
    /// after, so framing can happen in place.
    fn emit_frame(&mut self, conn: &mut Connection, payload: &[u8]) -> NetworkResult<usize>;
}
