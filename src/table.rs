use crate::connection::Connection;
use crate::logging;
use crate::protocol::ConnId;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::time::Duration;

/// What a descriptor table slot is servicing. The tag travels with
/// the registration token, so a slot can never be mistaken for the
/// wrong kind of descriptor.
pub enum SlotKind {
    /// The public listening socket; always slot 0.
    Listener(TcpListener),
    /// Loop-side rendezvous listener for the protocol at `index`;
    /// slots 1..=protocol count, one per protocol, in table order.
    BroadcastListener { index: usize, listener: TcpListener },
    /// An accepted rendezvous stream delivering broadcast payloads
    /// for the protocol at `index`.
    BroadcastPipe { index: usize, stream: TcpStream },
    /// A live client connection.
    Client(Box<Connection>),
}

impl SlotKind {
    #[inline]
    pub fn is_client(&self) -> bool {
        match self {
            SlotKind::Client(_) => true,
            _ => false,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            SlotKind::Listener(_) => "listener",
            SlotKind::BroadcastListener { .. } => "broadcast_listener",
            SlotKind::BroadcastPipe { .. } => "broadcast_pipe",
            SlotKind::Client(_) => "client",
        }
    }
}

pub struct Slot {
    pub token: Token,
    pub kind: SlotKind,
}

/// Ordered descriptor table. Slot order is the service order: slot 0
/// is the listener, then one rendezvous listener per protocol, then
/// client connections. The descriptor and its tag live in the same
/// slot, so reaps permute them together by construction.
///
/// Registration tokens are never reused; a freshly appended slot
/// cannot observe readiness left over from a reaped one.
pub struct PollTable {
    poll: Poll,
    slots: Vec<Slot>,
    capacity: usize,
    next_token: usize,
    log: logging::Logger,
}

impl PollTable {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        capacity: usize,
        log: L,
    ) -> NetworkResult<PollTable> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        Ok(PollTable {
            poll: Poll::new()?,
            slots: Vec::with_capacity(capacity),
            capacity,
            next_token: 0,
            log,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }

    /// Handle for the connection at `index`, valid while the record
    /// occupies a slot.
    #[inline]
    pub fn conn_id(&self, index: usize) -> ConnId {
        ConnId(self.slots[index].token.0)
    }

    /// One readiness wait across every registered descriptor.
    #[inline]
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(events, timeout)
    }

    /// Appends a slot at the end of the table, registering it for
    /// read readiness under a fresh token. Fails with `TableFull`
    /// once the configured capacity is reached.
    pub fn append(&mut self, kind: SlotKind) -> NetworkResult<usize> {
        if self.slots.len() >= self.capacity {
            return Err(NetworkError::Fatal(ErrorType::TableFull));
        }

        let token = Token(self.next_token);
        self.register(&kind, token)?;
        self.next_token += 1;

        logging::trace!(self.log, "slot appended";
                        "slot" => self.slots.len(),
                        "kind" => kind.describe(),
                        "token" => token.0);

        self.slots.push(Slot { token, kind });

        Ok(self.slots.len() - 1)
    }

    /// Removes slot `index`: deregisters the descriptor and shifts
    /// the entries above it left. Any resource release beyond the
    /// descriptor itself is the caller's business before reaping.
    pub fn reap(&mut self, index: usize) -> Slot {
        let slot = self.slots.remove(index);

        logging::trace!(self.log, "slot reaped";
                        "slot" => index,
                        "kind" => slot.kind.describe(),
                        "token" => slot.token.0);

        self.deregister(&slot.kind);

        slot
    }

    fn register(&self, kind: &SlotKind, token: Token) -> NetworkResult<()> {
        let interest = Ready::readable();
        let opts = PollOpt::level();

        let result = match kind {
            SlotKind::Listener(listener) => self.poll.register(listener, token, interest, opts),
            SlotKind::BroadcastListener { listener, .. } => {
                self.poll.register(listener, token, interest, opts)
            }
            SlotKind::BroadcastPipe { stream, .. } => {
                self.poll.register(stream, token, interest, opts)
            }
            SlotKind::Client(conn) => self.poll.register(conn.socket(), token, interest, opts),
        };

        result.map_err(Into::into)
    }

    fn deregister(&self, kind: &SlotKind) {
        let result = match kind {
            SlotKind::Listener(listener) => self.poll.deregister(listener),
            SlotKind::BroadcastListener { listener, .. } => self.poll.deregister(listener),
            SlotKind::BroadcastPipe { stream, .. } => self.poll.deregister(stream),
            SlotKind::Client(conn) => self.poll.deregister(conn.socket()),
        };

        if let Err(err) = result {
            logging::debug!(self.log, "slot deregistration failed"; "error" => %err);
        }
    }
}

impl PollTable {
    /// The connection occupying slot `index`, if that slot is a
    /// client.
    #[inline]
    pub fn client(&self, index: usize) -> Option<&Connection> {
        match self.slots.get(index) {
            Some(Slot {
                kind: SlotKind::Client(conn),
                ..
            }) => Some(conn),
            _ => None,
        }
    }

    #[inline]
    pub fn client_mut(&mut self, index: usize) -> Option<&mut Connection> {
        match self.slots.get_mut(index) {
            Some(Slot {
                kind: SlotKind::Client(conn),
                ..
            }) => Some(conn),
            _ => None,
        }
    }

    /// Resolves an opaque handle to its record. Stale handles (the
    /// record was torn down) resolve to `None`.
    pub fn find_client(&self, id: ConnId) -> Option<&Connection> {
        self.slots.iter().find_map(|slot| match &slot.kind {
            SlotKind::Client(conn) if slot.token.0 == id.0 => Some(&**conn),
            _ => None,
        })
    }

    pub fn find_client_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.iter_mut().find_map(|slot| match &mut slot.kind {
            SlotKind::Client(conn) if slot.token.0 == id.0 => Some(&mut **conn),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportMode;

    fn bind() -> TcpListener {
        TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap()
    }

    /// A client slot backed by a real loopback connection. The peer
    /// end is returned so it stays open for the duration of the test.
    fn client_slot() -> (SlotKind, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let transport = TransportMode::Plain.accept(accepted).unwrap();
        (
            SlotKind::Client(Box::new(Connection::new(transport, None))),
            peer,
        )
    }

    #[test]
    fn test_append_assigns_fresh_tokens() {
        let mut table = PollTable::new(8, None).unwrap();

        assert_eq!(table.append(SlotKind::Listener(bind())).unwrap(), 0);
        assert_eq!(
            table
                .append(SlotKind::BroadcastListener {
                    index: 0,
                    listener: bind()
                })
                .unwrap(),
            1
        );

        assert_eq!(table.slot(0).token, Token(0));
        assert_eq!(table.slot(1).token, Token(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_append_full() {
        let mut table = PollTable::new(2, None).unwrap();

        table.append(SlotKind::Listener(bind())).unwrap();
        table
            .append(SlotKind::BroadcastListener {
                index: 0,
                listener: bind(),
            })
            .unwrap();

        let result = table.append(SlotKind::Listener(bind()));
        assert_eq!(result.err().unwrap(), NetworkError::Fatal(ErrorType::TableFull));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reap_preserves_pairing() {
        let mut table = PollTable::new(8, None).unwrap();

        table.append(SlotKind::Listener(bind())).unwrap();
        let (slot_a, _peer_a) = client_slot();
        let (slot_b, _peer_b) = client_slot();
        let (slot_c, _peer_c) = client_slot();
        table.append(slot_a).unwrap();
        table.append(slot_b).unwrap();
        table.append(slot_c).unwrap();

        let reaped = table.reap(2);
        assert_eq!(reaped.token, Token(2));

        // entries above the reaped slot shifted left, tags intact
        assert_eq!(table.len(), 3);
        assert_eq!(table.slot(1).token, Token(1));
        assert_eq!(table.slot(2).token, Token(3));
        assert!(table.slot(1).kind.is_client());
        assert!(table.slot(2).kind.is_client());
    }

    #[test]
    fn test_token_never_reused_after_reap() {
        let mut table = PollTable::new(8, None).unwrap();

        let (slot_a, _peer_a) = client_slot();
        table.append(slot_a).unwrap();
        table.reap(0);

        let (slot_b, _peer_b) = client_slot();
        table.append(slot_b).unwrap();
        assert_eq!(table.slot(0).token, Token(1));
    }

    #[test]
    fn test_stale_handle_resolves_to_none() {
        let mut table = PollTable::new(8, None).unwrap();

        let (slot_a, _peer_a) = client_slot();
        let index = table.append(slot_a).unwrap();
        let id = table.conn_id(index);

        assert!(table.find_client(id).is_some());

        table.reap(index);
        assert!(table.find_client(id).is_none());
        assert!(table.find_client_mut(id).is_none());
    }

    #[test]
    fn test_handles_do_not_cross_slots() {
        let mut table = PollTable::new(8, None).unwrap();

        let (slot_a, _peer_a) = client_slot();
        let (slot_b, _peer_b) = client_slot();
        let a = table.append(slot_a).unwrap();
        table.append(slot_b).unwrap();

        let id_a = table.conn_id(a);
        table.reap(a);

        // slot 0 is now the second connection; the old handle must
        // not resolve to it
        assert!(table.find_client(id_a).is_none());
        assert!(table.slot(0).kind.is_client());
    }
}
