use crate::config::ServerConfig;
use crate::engine::WireEngine;
use crate::logging;
use crate::protocol::{Protocol, Protocols};
use crate::rendezvous::{open_loop_side, ForeignSender};
use crate::service::Service;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::table::{PollTable, SlotKind};
use crate::transport::{TlsAcceptor, TransportMode};
use crate::MAX_PROTOCOLS;
use mio::net::TcpListener;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Handle to a running websocket server.
///
/// [`Server::create`] returns once the background service loop is
/// running and the foreign-side rendezvous sockets are connected;
/// from then on [`Server::broadcast`] is safe from any thread.
/// Dropping the handle raises the service stop flag (observed at the
/// next readiness timeout at the latest) and closes the foreign
/// rendezvous ends.
pub struct Server {
    port: u16,
    protocols: Arc<Protocols>,
    senders: Vec<ForeignSender>,
    stop: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Server {
    /// Creates the listening server and launches the service loop.
    /// Steps, in order: listener bind, privilege drop, descriptor
    /// table init, per-protocol rendezvous setup, service thread
    /// spawn, foreign-side rendezvous connect. Any failure is fatal
    /// and leaves nothing running.
    pub fn create<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &ServerConfig,
        protocols: Vec<Protocol>,
        engine: Box<dyn WireEngine>,
        log: L,
    ) -> NetworkResult<Server> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        if protocols.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::Config));
        }
        if protocols.len() > MAX_PROTOCOLS {
            return Err(NetworkError::Fatal(ErrorType::TableFull));
        }

        let mode = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => TransportMode::Secure(TlsAcceptor::load(cert, key)?),
            _ => TransportMode::Plain,
        };

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        let listener = TcpListener::bind(&addr)?;
        let port = listener.local_addr()?.port();

        logging::info!(log, "listening"; "port" => port, "secure" => mode.is_secure());

        // binding a privileged port is the only reason to be running
        // elevated, so the ids drop right after the bind
        drop_privileges(config, &log)?;

        let mut table = PollTable::new(config.max_clients, &log)?;
        table.append(SlotKind::Listener(listener))?;

        // rendezvous loop sides, one per protocol, in table order
        let mut entries = protocols;
        for (index, protocol) in entries.iter_mut().enumerate() {
            let (listener, rendezvous_port) = open_loop_side()?;
            protocol.stamp(index, rendezvous_port);
            table.append(SlotKind::BroadcastListener { index, listener })?;

            logging::debug!(log, "rendezvous open";
                            "protocol" => protocol.name(),
                            "port" => rendezvous_port);
        }

        let protocols = Arc::new(Protocols::new(entries));
        let stop = Arc::new(AtomicBool::new(false));

        let service = Service::new(
            table,
            protocols.clone(),
            engine,
            mode,
            stop.clone(),
            &log,
        );

        thread::Builder::new()
            .name("gossamer-service".into())
            .spawn(move || service.run())
            .map_err(NetworkError::from)?;

        // the loop-side listeners already exist, so these connects
        // ride the accept backlog; no settling needed
        let mut senders = Vec::with_capacity(protocols.len());
        for protocol in protocols.iter() {
            match ForeignSender::connect(protocol.broadcast_port()) {
                Ok(sender) => senders.push(sender),
                Err(err) => {
                    // the loop is already running; stop it before
                    // reporting the bootstrap failure
                    stop.store(true, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }

        logging::info!(log, "service running"; "protocols" => protocols.len());

        Ok(Server {
            port,
            protocols,
            senders,
            stop,
            log,
        })
    }

    /// Port the server is listening on. Useful with a `port: 0`
    /// bootstrap where the OS picks one.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The protocol table, stamped with indices and rendezvous ports.
    #[inline]
    pub fn protocols(&self) -> &Protocols {
        &self.protocols
    }

    /// Ships a payload to every established connection of the named
    /// protocol. Safe from any thread: the payload travels over the
    /// protocol's rendezvous socket and the service loop fans it out
    /// to the matching connections.
    pub fn broadcast(&self, protocol: &str, payload: &[u8]) -> NetworkResult<()> {
        let index = match self.protocols.by_name(protocol) {
            Some(protocol) => protocol.index(),
            None => return Err(NetworkError::Fatal(ErrorType::UnknownProtocol)),
        };

        self.senders[index].send(payload)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        logging::debug!(self.log, "server handle dropped, stopping service");
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn drop_privileges(config: &ServerConfig, log: &logging::Logger) -> NetworkResult<()> {
    if let Some(gid) = config.gid {
        if unsafe { libc::setgid(gid as libc::gid_t) } != 0 {
            logging::error!(log, "setgid failed";
                            "gid" => gid,
                            "error" => %io::Error::last_os_error());
            return Err(NetworkError::Fatal(ErrorType::PrivilegeDrop));
        }
    }

    if let Some(uid) = config.uid {
        if unsafe { libc::setuid(uid as libc::uid_t) } != 0 {
            logging::error!(log, "setuid failed";
                            "uid" => uid,
                            "error" => %io::Error::last_os_error());
            return Err(NetworkError::Fatal(ErrorType::PrivilegeDrop));
        }
    }

    Ok(())
}
