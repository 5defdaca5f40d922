use crate::connection::{Connection, ConnectionState};
use crate::engine::{Advance, WireEngine, WireEvent};
use crate::logging;
use crate::protocol::{CallbackReason, ConnId, Protocol, Protocols};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::table::{PollTable, SlotKind};
use crate::transport::TransportMode;
use crate::{MAX_BROADCAST_PAYLOAD, SEND_BUFFER_PRE_PADDING};
use hashbrown::HashMap;
use mio::unix::UnixReady;
use mio::{Events, Ready, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 256;

/// Outcome of a single loop iteration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Turn {
    Continue,
    Fatal,
}

/// Outcome of servicing one slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Serviced {
    Keep,
    Reap,
}

enum AcceptTarget {
    Client,
    Pipe(usize),
}

/// The single-threaded connection service. One instance owns the
/// descriptor table, the framing engine and the fan-out scratch
/// buffer; every record mutation and every callback invocation
/// happens on the thread driving [`Service::run`].
pub(crate) struct Service {
    table: PollTable,
    protocols: Arc<Protocols>,
    engine: Box<dyn WireEngine>,
    mode: TransportMode,
    events: Events,
    scratch: Box<[u8]>,
    stop: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Service {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        table: PollTable,
        protocols: Arc<Protocols>,
        engine: Box<dyn WireEngine>,
        mode: TransportMode,
        stop: Arc<AtomicBool>,
        log: L,
    ) -> Service {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        Service {
            table,
            protocols,
            engine,
            mode,
            events: Events::with_capacity(EVENTS_CAPACITY),
            scratch: vec![
                0u8;
                SEND_BUFFER_PRE_PADDING
                    + MAX_BROADCAST_PAYLOAD
                    + crate::SEND_BUFFER_POST_PADDING
            ]
            .into_boxed_slice(),
            stop,
            log,
        }
    }

    /// Runs until the listener dies or the stop flag is raised.
    /// Dropping the service closes every descriptor it still holds.
    pub(crate) fn run(mut self) {
        logging::info!(self.log, "service loop running"; "slots" => self.table.len());

        loop {
            if self.stop.load(Ordering::Relaxed) {
                logging::info!(self.log, "service loop stopping");
                return;
            }

            if self.turn() == Turn::Fatal {
                logging::crit!(self.log, "listen socket dead, terminating service");
                return;
            }
        }
    }

    /// One iteration: readiness wait, accept phase, service phase.
    /// All accepts in an iteration happen before any servicing.
    fn turn(&mut self) -> Turn {
        let ready = match self.wait() {
            Ok(ready) => ready,
            Err(err) => {
                logging::crit!(self.log, "readiness wait failed"; "error" => %err);
                return Turn::Fatal;
            }
        };

        if is_dead(ready.get(self.table.slot(0).token)) {
            return Turn::Fatal;
        }

        self.accept_phase(&ready);
        self.service_phase(&ready);

        Turn::Continue
    }

    fn wait(&mut self) -> io::Result<ReadySet> {
        self.table.poll(&mut self.events, Some(POLL_TIMEOUT))?;

        let mut ready = ReadySet::default();
        for event in &self.events {
            ready.merge(event.token(), event.readiness());
        }

        Ok(ready)
    }

    /// Walks the listener and the rendezvous listeners in slot order,
    /// accepting at most one connection per readable slot.
    fn accept_phase(&mut self, ready: &ReadySet) {
        for index in 0..=self.protocols.len() {
            if !ready.get(self.table.slot(index).token).is_readable() {
                continue;
            }
            self.accept_one(index);
        }
    }

    fn accept_one(&mut self, index: usize) {
        let target = match self.table.slot(index).kind {
            SlotKind::Listener(_) => AcceptTarget::Client,
            SlotKind::BroadcastListener { index, .. } => AcceptTarget::Pipe(index),
            _ => return,
        };

        let accepted = match self.table.slot(index).kind {
            SlotKind::Listener(ref listener) => listener.accept_std(),
            SlotKind::BroadcastListener { ref listener, .. } => listener.accept_std(),
            _ => return,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                logging::warn!(self.log, "accept failed"; "slot" => index, "error" => %err);
                return;
            }
        };

        // the freshly accepted descriptor is closed on the spot when
        // the table has no room for it
        if self.table.len() >= self.table.capacity() {
            logging::warn!(self.log, "descriptor table full, dropping connection"; "peer" => %peer);
            return;
        }

        let result = match target {
            AcceptTarget::Client => self.accept_client(stream, peer),
            AcceptTarget::Pipe(protocol) => self.accept_pipe(protocol, stream),
        };

        if let Err(err) = result {
            logging::warn!(self.log, "accepted socket not added"; "slot" => index, "error" => ?err);
        }
    }

    fn accept_client(&mut self, stream: std::net::TcpStream, peer: SocketAddr) -> NetworkResult<()> {
        let transport = match self.mode.accept(stream) {
            Ok(transport) => transport,
            Err(NetworkError::Fatal(ErrorType::TlsNegotiation)) => {
                // browsers probe with parameters they do not intend
                // to use, so a failed negotiation is not an event
                logging::debug!(self.log, "tls negotiation failed, discarding"; "peer" => %peer);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let conn = Connection::new(transport, &self.log);
        let slot = self.table.append(SlotKind::Client(Box::new(conn)))?;

        logging::debug!(self.log, "client accepted"; "slot" => slot, "peer" => %peer);

        Ok(())
    }

    fn accept_pipe(&mut self, protocol: usize, stream: std::net::TcpStream) -> NetworkResult<()> {
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_stream(stream)?;

        let slot = self.table.append(SlotKind::BroadcastPipe {
            index: protocol,
            stream,
        })?;

        logging::debug!(self.log, "rendezvous pipe attached"; "slot" => slot, "protocol" => protocol);

        Ok(())
    }

    /// Walks the client zone in slot order. A reap aborts the phase:
    /// the indices above the reaped slot have shifted, so the rest of
    /// the table is serviced after the next readiness wait.
    fn service_phase(&mut self, ready: &ReadySet) {
        let mut index = self.protocols.len() + 1;

        while index < self.table.len() {
            let slot_ready = ready.get(self.table.slot(index).token);

            if is_dead(slot_ready) {
                logging::debug!(self.log, "slot dead"; "slot" => index);
                self.teardown(index);
                self.table.reap(index);
                return;
            }

            if !slot_ready.is_readable() {
                index += 1;
                continue;
            }

            match self.service_slot(index) {
                Serviced::Keep => index += 1,
                Serviced::Reap => {
                    self.teardown(index);
                    self.table.reap(index);
                    return;
                }
            }
        }
    }

    fn service_slot(&mut self, index: usize) -> Serviced {
        enum Todo {
            Pipe(usize),
            Client,
        }

        let todo = match self.table.slot(index).kind {
            SlotKind::BroadcastPipe { index, .. } => Todo::Pipe(index),
            SlotKind::Client(_) => Todo::Client,
            // listeners are the accept phase's business
            _ => return Serviced::Keep,
        };

        match todo {
            Todo::Pipe(protocol) => self.deliver_broadcast(index, protocol),
            Todo::Client => self.service_client(index),
        }
    }

    /// A rendezvous pipe turned readable: pull one payload into the
    /// padded scratch buffer and fan it out to every established
    /// connection of the pipe's protocol.
    fn deliver_broadcast(&mut self, index: usize, protocol: usize) -> Serviced {
        let read = {
            let payload_zone =
                &mut self.scratch[SEND_BUFFER_PRE_PADDING..SEND_BUFFER_PRE_PADDING + MAX_BROADCAST_PAYLOAD];
            match self.table.slot_mut(index).kind {
                SlotKind::BroadcastPipe { ref mut stream, .. } => {
                    use std::io::Read;
                    stream.read(payload_zone)
                }
                _ => return Serviced::Keep,
            }
        };

        match read {
            Ok(0) => {
                // foreign side dropped its sender
                logging::debug!(self.log, "rendezvous pipe closed"; "protocol" => protocol);
                Serviced::Reap
            }
            Ok(len) => {
                logging::trace!(self.log, "broadcast payload"; "protocol" => protocol, "len" => len);
                fan_out(
                    &mut self.table,
                    &self.protocols,
                    &mut *self.engine,
                    &self.log,
                    protocol,
                    &self.scratch[SEND_BUFFER_PRE_PADDING..SEND_BUFFER_PRE_PADDING + len],
                );
                Serviced::Keep
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Serviced::Keep,
            Err(err) => {
                logging::warn!(self.log, "error receiving broadcast payload"; "error" => %err);
                Serviced::Keep
            }
        }
    }

    fn service_client(&mut self, index: usize) -> Serviced {
        let read = match self.table.client_mut(index) {
            Some(conn) => conn.read(&mut self.scratch),
            None => return Serviced::Keep,
        };

        let len = match read {
            Ok(0) => {
                logging::debug!(self.log, "peer closed"; "slot" => index);
                return Serviced::Reap;
            }
            Ok(len) => len,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Serviced::Keep,
            Err(err) => {
                logging::debug!(self.log, "connection read error"; "slot" => index, "error" => %err);
                return Serviced::Reap;
            }
        };

        let mut events = Vec::new();
        let advance = match self.table.client_mut(index) {
            Some(conn) => self.engine.feed_bytes(conn, &self.scratch[..len], &mut events),
            None => return Serviced::Keep,
        };

        for event in events {
            if !self.apply_event(index, event) {
                return Serviced::Reap;
            }
        }

        match advance {
            Advance::Continue => Serviced::Keep,
            Advance::Close => {
                logging::debug!(self.log, "framing fatal"; "slot" => index);
                Serviced::Reap
            }
        }
    }

    /// Applies one engine event. Returns false when the event itself
    /// condemns the connection.
    fn apply_event(&mut self, index: usize, event: WireEvent) -> bool {
        match event {
            WireEvent::Established { protocol } => {
                if self.protocols.get(protocol).is_none() {
                    logging::error!(self.log, "engine selected unknown protocol"; "protocol" => protocol);
                    return false;
                }
                establish(
                    &mut self.table,
                    &self.protocols,
                    &mut *self.engine,
                    &self.log,
                    index,
                    protocol,
                );
                true
            }
            WireEvent::Message(payload) => {
                let established = self
                    .table
                    .client(index)
                    .map(|conn| conn.state() == ConnectionState::Established)
                    .unwrap_or(false);

                if !established {
                    logging::debug!(self.log, "message for unestablished connection dropped"; "slot" => index);
                    return true;
                }

                fire(
                    &mut self.table,
                    &self.protocols,
                    &mut *self.engine,
                    &self.log,
                    index,
                    CallbackReason::Receive,
                    &payload,
                );
                true
            }
            WireEvent::HttpRequest(uri) => {
                fire(
                    &mut self.table,
                    &self.protocols,
                    &mut *self.engine,
                    &self.log,
                    index,
                    CallbackReason::Http,
                    &uri,
                );
                true
            }
        }
    }

    fn teardown(&mut self, index: usize) {
        teardown_slot(
            &mut self.table,
            &self.protocols,
            &mut *self.engine,
            &self.log,
            index,
        );
    }
}

/// Per-iteration readiness, aggregated by token.
#[derive(Default)]
struct ReadySet {
    map: HashMap<Token, Ready>,
}

impl ReadySet {
    fn merge(&mut self, token: Token, ready: Ready) {
        let entry = self.map.entry(token).or_insert_with(Ready::empty);
        *entry = *entry | ready;
    }

    fn get(&self, token: Token) -> Ready {
        self.map.get(&token).copied().unwrap_or_else(Ready::empty)
    }
}

fn is_dead(ready: Ready) -> bool {
    let unix = UnixReady::from(ready);
    unix.is_hup() || unix.is_error()
}

/// Transitions the connection at `index` to established: binds the
/// selected protocol, allocates the zeroed per-session user space and
/// fires the `Established` callback.
fn establish(
    table: &mut PollTable,
    protocols: &Protocols,
    engine: &mut dyn WireEngine,
    log: &logging::Logger,
    index: usize,
    protocol: usize,
) {
    let session_len = protocols.get(protocol).map(Protocol::session_len).unwrap_or(0);

    match table.client_mut(index) {
        Some(conn) => {
            conn.bind_protocol(protocol);
            conn.alloc_user_space(session_len);
            conn.set_state(ConnectionState::Established);
        }
        None => return,
    }

    logging::debug!(log, "connection established"; "slot" => index, "protocol" => protocol);

    fire(table, protocols, engine, log, index, CallbackReason::Established, &[]);
}

/// Synchronous fan-out: delivers `payload` to every established
/// connection bound to `protocol`, in slot order. This is both the
/// rendezvous delivery path and the in-loop broadcast fast path.
fn fan_out(
    table: &mut PollTable,
    protocols: &Protocols,
    engine: &mut dyn WireEngine,
    log: &logging::Logger,
    protocol: usize,
    payload: &[u8],
) {
    let mut index = protocols.len() + 1;
    let mut delivered = 0usize;

    while index < table.len() {
        let matched = match table.client(index) {
            Some(conn) => {
                conn.state() == ConnectionState::Established && conn.protocol_index() == protocol
            }
            None => false,
        };

        if matched {
            fire(table, protocols, engine, log, index, CallbackReason::Broadcast, payload);
            delivered += 1;
        }

        index += 1;
    }

    logging::trace!(log, "broadcast fan out"; "protocol" => protocol, "delivered" => delivered);
}

/// Invokes the protocol callback for the connection at `index`. The
/// per-session user space is lent to the callback for the duration of
/// the call; an established record whose space is already lent out is
/// skipped, which keeps re-entrant fan-out off the connection whose
/// callback is currently running.
fn fire(
    table: &mut PollTable,
    protocols: &Protocols,
    engine: &mut dyn WireEngine,
    log: &logging::Logger,
    index: usize,
    reason: CallbackReason,
    payload: &[u8],
) {
    let id = table.conn_id(index);

    let (protocol_index, mut space) = {
        let conn = match table.client_mut(index) {
            Some(conn) => conn,
            None => return,
        };

        if conn.state() == ConnectionState::Dead {
            return;
        }

        let space = conn.take_user_space();
        if space.is_none() && conn.state() == ConnectionState::Established {
            return;
        }

        (conn.protocol_index(), space)
    };

    invoke(
        table,
        protocols,
        engine,
        log,
        id,
        protocol_index,
        space.as_mut().map(|space| &mut space[..]),
        reason,
        payload,
    );

    if let Some(space) = space {
        if let Some(conn) = table.client_mut(index) {
            conn.restore_user_space(space);
        }
    }
}

/// Tears down the connection at slot `index`: marks it dead, fires
/// `Closed` exactly once iff it had established, releases the token
/// buffers and shuts the transport down. No-op on rendezvous slots
/// and on records that are already dead, so an error and a peer close
/// observed for the same slot release resources only once. The caller
/// reaps the slot afterwards.
fn teardown_slot(
    table: &mut PollTable,
    protocols: &Protocols,
    engine: &mut dyn WireEngine,
    log: &logging::Logger,
    index: usize,
) {
    let id = table.conn_id(index);

    let (was_established, protocol_index, mut space) = {
        let conn = match table.client_mut(index) {
            Some(conn) => conn,
            None => return,
        };

        if conn.state() == ConnectionState::Dead {
            return;
        }

        let was_established = conn.state() == ConnectionState::Established;
        conn.set_state(ConnectionState::Dead);

        (was_established, conn.protocol_index(), conn.take_user_space())
    };

    if was_established {
        invoke(
            table,
            protocols,
            engine,
            log,
            id,
            protocol_index,
            space.as_mut().map(|space| &mut space[..]),
            CallbackReason::Closed,
            &[],
        );
    }

    if let Some(conn) = table.client_mut(index) {
        conn.clear_tokens();
        conn.shutdown_transport();
    }

    logging::debug!(log, "connection torn down"; "slot" => index, "established" => was_established);

    // the user space drops here: its last use was the Closed callback
}

fn invoke(
    table: &mut PollTable,
    protocols: &Protocols,
    engine: &mut dyn WireEngine,
    log: &logging::Logger,
    id: ConnId,
    protocol_index: usize,
    space: Option<&mut [u8]>,
    reason: CallbackReason,
    payload: &[u8],
) {
    let callback = match protocols.get(protocol_index) {
        Some(protocol) => protocol.callback(),
        None => return,
    };

    let mut ctx = ServiceCtx {
        table,
        protocols,
        engine,
        log,
    };

    let user: &mut [u8] = match space {
        Some(space) => space,
        None => &mut [],
    };

    callback(&mut ctx, id, reason, user, payload);
}

/// Handed to every protocol callback: the window through which
/// callbacks reach the rest of the service.
pub struct ServiceCtx<'a> {
    table: &'a mut PollTable,
    protocols: &'a Protocols,
    engine: &'a mut dyn WireEngine,
    log: &'a logging::Logger,
}

impl<'a> ServiceCtx<'a> {
    /// Synchronously delivers `payload` to every established
    /// connection of the named protocol. This is the in-loop
    /// broadcast path: no rendezvous traffic, delivery completes
    /// before this returns.
    pub fn broadcast(&mut self, protocol: &str, payload: &[u8]) -> NetworkResult<()> {
        let index = match self.protocols.by_name(protocol) {
            Some(protocol) => protocol.index(),
            None => return Err(NetworkError::Fatal(ErrorType::UnknownProtocol)),
        };

        fan_out(
            &mut *self.table,
            self.protocols,
            &mut *self.engine,
            self.log,
            index,
            payload,
        );

        Ok(())
    }

    /// Frames and writes `payload` to one connection; the framing
    /// engine does the wire work. A stale handle reports `Gone`.
    pub fn write(&mut self, conn: ConnId, payload: &[u8]) -> NetworkResult<usize> {
        let conn = match self.table.find_client_mut(conn) {
            Some(conn) => conn,
            None => return Err(NetworkError::Fatal(ErrorType::Gone)),
        };

        self.engine.emit_frame(conn, payload)
    }

    /// The protocol a connection is bound to: the head of the table
    /// until its handshake selects one. A stale handle reports `None`.
    pub fn protocol(&self, conn: ConnId) -> Option<&Protocol> {
        let index = self.table.find_client(conn)?.protocol_index();
        self.protocols.get(index)
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        self.log
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::connection::TokenKind;
    use std::sync::Mutex;

    /// Scripted stand-in for the handshake/framing codec. Bytes are
    /// accumulated per connection in the record's scratch buffer and
    /// parsed as newline-terminated commands:
    ///
    /// - `join <index>` completes the upgrade for protocol `<index>`
    /// - `msg <text>` delivers `<text>` as an application message
    /// - `http <uri>` reports a plain HTTP request for `<uri>`
    /// - `die` declares the connection unrecoverable
    pub(crate) struct LineEngine;

    impl LineEngine {
        fn parse(conn: &mut Connection, line: &[u8], out: &mut Vec<WireEvent>) -> Advance {
            if line == b"die" {
                return Advance::Close;
            }

            if let Some(rest) = strip_prefix(line, b"join ") {
                let protocol = match std::str::from_utf8(rest).ok().and_then(|s| s.parse().ok()) {
                    Some(protocol) => protocol,
                    None => return Advance::Close,
                };
                conn.set_token(TokenKind::Protocol, rest);
                conn.set_ietf_spec_revision(13);
                out.push(WireEvent::Established { protocol });
            } else if let Some(rest) = strip_prefix(line, b"msg ") {
                out.push(WireEvent::Message(rest.to_vec()));
            } else if let Some(rest) = strip_prefix(line, b"http ") {
                out.push(WireEvent::HttpRequest(rest.to_vec()));
            }

            Advance::Continue
        }
    }

    fn strip_prefix<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
        if line.starts_with(prefix) {
            Some(&line[prefix.len()..])
        } else {
            None
        }
    }

    impl WireEngine for LineEngine {
        fn feed_bytes(
            &mut self,
            conn: &mut Connection,
            buf: &[u8],
            out: &mut Vec<WireEvent>,
        ) -> Advance {
            for &byte in buf {
                if byte == b'\n' {
                    let line = conn.name_buffer().to_vec();
                    conn.clear_name_buffer();
                    if Self::parse(conn, &line, out) == Advance::Close {
                        return Advance::Close;
                    }
                } else if !conn.push_name_byte(byte) {
                    return Advance::Close;
                }
            }

            Advance::Continue
        }

        fn emit_frame(&mut self, conn: &mut Connection, payload: &[u8]) -> NetworkResult<usize> {
            conn.write(payload).map_err(Into::into)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Note {
        pub protocol: String,
        pub conn: usize,
        pub reason: CallbackReason,
        pub payload: Vec<u8>,
    }

    pub(crate) type Journal = Arc<Mutex<Vec<Note>>>;

    pub(crate) fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// A protocol whose callback records every invocation.
    pub(crate) fn recording_protocol(name: &str, journal: &Journal) -> Protocol {
        let journal = journal.clone();
        let protocol_name = name.to_string();

        Protocol::new(
            name,
            16,
            Box::new(move |_ctx, conn, reason, _user, payload| {
                journal.lock().unwrap().push(Note {
                    protocol: protocol_name.clone(),
                    conn: conn.0,
                    reason,
                    payload: payload.to_vec(),
                });
            }),
        )
    }

    pub(crate) fn notes(journal: &Journal) -> Vec<Note> {
        journal.lock().unwrap().clone()
    }
}
