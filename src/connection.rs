use crate::logging;
use crate::transport::Transport;
use crate::MAX_HEADER_NAME_LEN;
use std::io;

/// Protocol revision assumed for a new connection; the handshake
/// overwrites it once the client declares which draft it speaks.
pub const INITIAL_IETF_REVISION: u32 = 76;

/// Lifecycle of a client connection. The progression is strictly
/// `Http -> Established -> Dead`; `Dead` is terminal and no callback
/// ever fires on a dead record (the close notification fires while
/// the record is being torn down, before it goes dead for good).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    /// Accepted, upgrade handshake not yet complete.
    Http,
    /// Handshake done, frames flow.
    Established,
    Dead,
}

/// Handshake header tokens captured during the upgrade. The token
/// table is indexed by this closed set.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TokenKind {
    GetUri,
    Host,
    Connection,
    Key1,
    Key2,
    Protocol,
    Upgrade,
    Origin,
    Draft,
    Challenge,
}

pub const TOKEN_COUNT: usize = 10;

/// Per-client connection record. Owns the transport, the handshake
/// scratch buffers and the per-session user space; everything is
/// released together when the record is destroyed.
pub struct Connection {
    transport: Transport,
    state: ConnectionState,

    // Handshake scratch
    name_buffer: [u8; MAX_HEADER_NAME_LEN],
    name_buffer_pos: usize,
    tokens: [Option<Box<[u8]>>; TOKEN_COUNT],

    // Bound protocol; the head of the table until the handshake
    // selects one.
    protocol_index: usize,

    // Allocated zeroed when the connection establishes, sized by the
    // selected protocol. `None` on an established record means the
    // space is currently lent to a running callback.
    user_space: Option<Box<[u8]>>,

    ietf_spec_revision: u32,

    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(transport: Transport, log: L) -> Connection {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        Connection {
            transport,
            state: ConnectionState::Http,
            name_buffer: [0; MAX_HEADER_NAME_LEN],
            name_buffer_pos: 0,
            tokens: Default::default(),
            protocol_index: 0,
            user_space: None,
            ietf_spec_revision: INITIAL_IETF_REVISION,
            log,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Advances the lifecycle. Transitions out of `Dead` are refused.
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state == ConnectionState::Dead {
            return;
        }

        logging::trace!(self.log, "connection state change";
                        "from" => ?self.state,
                        "to" => ?state);

        self.state = state;
    }

    #[inline]
    pub fn protocol_index(&self) -> usize {
        self.protocol_index
    }

    #[inline]
    pub(crate) fn bind_protocol(&mut self, index: usize) {
        self.protocol_index = index;
    }

    #[inline]
    pub fn ietf_spec_revision(&self) -> u32 {
        self.ietf_spec_revision
    }

    /// Engine-facing: records the draft revision the client declared.
    #[inline]
    pub fn set_ietf_spec_revision(&mut self, revision: u32) {
        self.ietf_spec_revision = revision;
    }
}

impl Connection {
    /// The captured token, if the handshake has produced one.
    #[inline]
    pub fn token(&self, kind: TokenKind) -> Option<&[u8]> {
        self.tokens[kind as usize].as_deref()
    }

    /// Engine-facing: stores an owned copy of a parsed token.
    #[inline]
    pub fn set_token(&mut self, kind: TokenKind, content: &[u8]) {
        self.tokens[kind as usize] = Some(content.into());
    }

    #[inline]
    pub fn take_token(&mut self, kind: TokenKind) -> Option<Box<[u8]>> {
        self.tokens[kind as usize].take()
    }

    pub(crate) fn clear_tokens(&mut self) {
        for token in self.tokens.iter_mut() {
            *token = None;
        }
    }

    /// Bytes accumulated in the handshake scratch buffer.
    #[inline]
    pub fn name_buffer(&self) -> &[u8] {
        &self.name_buffer[..self.name_buffer_pos]
    }

    /// Engine-facing: appends one byte to the scratch buffer. Returns
    /// false when the buffer is full.
    #[inline]
    pub fn push_name_byte(&mut self, byte: u8) -> bool {
        if self.name_buffer_pos == MAX_HEADER_NAME_LEN {
            return false;
        }
        self.name_buffer[self.name_buffer_pos] = byte;
        self.name_buffer_pos += 1;
        true
    }

    #[inline]
    pub fn clear_name_buffer(&mut self) {
        self.name_buffer_pos = 0;
    }
}

impl Connection {
    pub(crate) fn alloc_user_space(&mut self, len: usize) {
        self.user_space = Some(vec![0u8; len].into_boxed_slice());
    }

    #[inline]
    pub(crate) fn take_user_space(&mut self) -> Option<Box<[u8]>> {
        self.user_space.take()
    }

    #[inline]
    pub(crate) fn restore_user_space(&mut self, space: Box<[u8]>) {
        self.user_space = Some(space);
    }

    #[inline]
    pub(crate) fn has_user_space(&self) -> bool {
        self.user_space.is_some()
    }
}

impl Connection {
    #[inline]
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf)
    }

    #[inline]
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }

    #[inline]
    pub(crate) fn socket(&self) -> &mio::net::TcpStream {
        self.transport.socket()
    }

    #[inline]
    pub(crate) fn shutdown_transport(&mut self) {
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportMode;
    use std::net::TcpListener;

    fn connection() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let transport = TransportMode::Plain.accept(accepted).unwrap();
        (Connection::new(transport, None), client)
    }

    #[test]
    fn test_new_connection_defaults() {
        let (conn, _client) = connection();

        assert_eq!(conn.state(), ConnectionState::Http);
        assert_eq!(conn.protocol_index(), 0);
        assert_eq!(conn.ietf_spec_revision(), INITIAL_IETF_REVISION);
        assert!(!conn.has_user_space());
        assert_eq!(conn.name_buffer(), b"");
        assert_eq!(conn.token(TokenKind::Host), None);
    }

    #[test]
    fn test_state_is_monotonic() {
        let (mut conn, _client) = connection();

        conn.set_state(ConnectionState::Established);
        assert_eq!(conn.state(), ConnectionState::Established);

        conn.set_state(ConnectionState::Dead);
        assert_eq!(conn.state(), ConnectionState::Dead);

        // dead is terminal
        conn.set_state(ConnectionState::Established);
        assert_eq!(conn.state(), ConnectionState::Dead);
        conn.set_state(ConnectionState::Http);
        assert_eq!(conn.state(), ConnectionState::Dead);
    }

    #[test]
    fn test_token_table_ownership() {
        let (mut conn, _client) = connection();

        conn.set_token(TokenKind::Host, b"example.com");
        conn.set_token(TokenKind::Protocol, b"chat");

        assert_eq!(conn.token(TokenKind::Host), Some(&b"example.com"[..]));
        assert_eq!(conn.token(TokenKind::Protocol), Some(&b"chat"[..]));
        assert_eq!(conn.token(TokenKind::Origin), None);

        let taken = conn.take_token(TokenKind::Host).unwrap();
        assert_eq!(&taken[..], b"example.com");
        assert_eq!(conn.token(TokenKind::Host), None);

        conn.clear_tokens();
        assert_eq!(conn.token(TokenKind::Protocol), None);
    }

    #[test]
    fn test_name_buffer_bounds() {
        let (mut conn, _client) = connection();

        for _ in 0..MAX_HEADER_NAME_LEN {
            assert!(conn.push_name_byte(b'a'));
        }
        assert!(!conn.push_name_byte(b'a'));
        assert_eq!(conn.name_buffer().len(), MAX_HEADER_NAME_LEN);

        conn.clear_name_buffer();
        assert_eq!(conn.name_buffer(), b"");
        assert!(conn.push_name_byte(b'b'));
        assert_eq!(conn.name_buffer(), b"b");
    }

    #[test]
    fn test_user_space_lifecycle() {
        let (mut conn, _client) = connection();

        conn.alloc_user_space(8);
        assert!(conn.has_user_space());

        let mut space = conn.take_user_space().unwrap();
        assert_eq!(&space[..], &[0u8; 8][..]);
        assert!(!conn.has_user_space());

        space[0] = 42;
        conn.restore_user_space(space);
        assert_eq!(conn.take_user_space().unwrap()[0], 42);
    }
}
