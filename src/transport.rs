use crate::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;

/// Server-side TLS context. Built once at bootstrap from the
/// configured certificate and key, owned by the transport mode for
/// the lifetime of the server.
pub struct TlsAcceptor {
    config: Arc<rustls::ServerConfig>,
}

impl TlsAcceptor {
    /// Loads the PEM certificate chain and private key. Any failure
    /// here is bootstrap-fatal.
    pub fn load(cert_path: &Path, key_path: &Path) -> NetworkResult<TlsAcceptor> {
        let certs = read_certs(cert_path)?;
        let key = read_key(key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;

        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }

    /// Runs the server-side negotiation on a freshly accepted socket.
    /// The socket goes blocking for the duration; the negotiation
    /// either completes or fails before the stream can join the poll
    /// table. A failure discards the connection without ceremony:
    /// browsers probe with parameters they do not intend to use.
    fn negotiate(&self, mut stream: std::net::TcpStream) -> NetworkResult<Transport> {
        stream.set_nonblocking(false)?;

        let mut session = rustls::ServerConnection::new(self.config.clone())
            .map_err(|_| NetworkError::Fatal(ErrorType::TlsNegotiation))?;

        while session.is_handshaking() {
            session
                .complete_io(&mut stream)
                .map_err(|_| NetworkError::Fatal(ErrorType::TlsNegotiation))?;
        }

        stream.set_nonblocking(true)?;

        Ok(Transport::Secure(SecureStream {
            stream: TcpStream::from_stream(stream)?,
            session: Box::new(session),
        }))
    }
}

fn read_certs(path: &Path) -> NetworkResult<Vec<rustls::Certificate>> {
    let file = File::open(path).map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;

    if certs.is_empty() {
        return Err(NetworkError::Fatal(ErrorType::TlsConfig));
    }

    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn read_key(path: &Path) -> NetworkResult<rustls::PrivateKey> {
    let file = File::open(path).map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;

    if keys.is_empty() {
        // not PKCS#8, retry the file as a legacy RSA key
        let file = File::open(path).map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file))
            .map_err(|_| NetworkError::Fatal(ErrorType::TlsConfig))?;
    }

    match keys.into_iter().next() {
        Some(key) => Ok(rustls::PrivateKey(key)),
        None => Err(NetworkError::Fatal(ErrorType::TlsConfig)),
    }
}

/// Which transport variant accepted sockets are wrapped in. Selected
/// at bootstrap and fixed for the lifetime of the server.
pub enum TransportMode {
    Plain,
    Secure(TlsAcceptor),
}

impl TransportMode {
    #[inline]
    pub fn is_secure(&self) -> bool {
        match self {
            TransportMode::Plain => false,
            TransportMode::Secure(_) => true,
        }
    }

    /// Wraps a freshly accepted socket.
    pub fn accept(&self, stream: std::net::TcpStream) -> NetworkResult<Transport> {
        match self {
            TransportMode::Plain => {
                stream.set_nonblocking(true)?;
                Ok(Transport::Plain(TcpStream::from_stream(stream)?))
            }
            TransportMode::Secure(acceptor) => acceptor.negotiate(stream),
        }
    }
}

pub struct SecureStream {
    stream: TcpStream,
    session: Box<rustls::ServerConnection>,
}

impl SecureStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(count) => return Ok(count),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // no plaintext buffered, pull more records off the wire
                    let count = self.session.read_tls(&mut self.stream)?;
                    if count == 0 {
                        return Ok(0);
                    }
                    self.session
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.session.writer().write(buf)?;
        self.flush_tls();
        Ok(count)
    }

    /// Best-effort flush of pending TLS records. A socket that cannot
    /// take them right now keeps the records buffered in the session;
    /// a dead socket surfaces on the next read.
    fn flush_tls(&mut self) {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(0) | Err(_) => break,
                Ok(_) => (),
            }
        }
    }
}

/// Unified read/write/shutdown over a plain or TLS-terminated socket.
/// Once a connection is accepted this is the only component touching
/// it; the descriptor table sees [`Transport::socket`] solely for
/// readiness registration.
pub enum Transport {
    Plain(TcpStream),
    Secure(SecureStream),
}

impl Transport {
    /// Handle used for poll registration.
    #[inline]
    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Secure(secure) => &secure.stream,
        }
    }

    #[inline]
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Secure(secure) => secure.read(buf),
        }
    }

    #[inline]
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Secure(secure) => secure.write(buf),
        }
    }

    /// Orderly close: bidirectional half-close on the plain variant,
    /// close_notify then socket shutdown on the secure one. Errors are
    /// ignored, this only runs on the teardown path.
    pub fn shutdown(&mut self) {
        match self {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Secure(secure) => {
                secure.session.send_close_notify();
                let _ = secure.session.write_tls(&mut secure.stream);
                let _ = secure.stream.shutdown(Shutdown::Both);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn accepted_pair() -> (Transport, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let transport = TransportMode::Plain.accept(accepted).unwrap();
        (transport, client)
    }

    #[test]
    fn test_plain_roundtrip() {
        let (mut transport, mut client) = accepted_pair();

        client.write_all(b"upgrade me").unwrap();

        let mut buf = [0u8; 32];
        let count = loop {
            match transport.read(&mut buf) {
                Ok(count) => break count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("unexpected read error {:?}", err),
            }
        };
        assert_eq!(&buf[..count], b"upgrade me");

        let written = transport.write(b"101").unwrap();
        assert_eq!(written, 3);

        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"101");
    }

    #[test]
    fn test_plain_read_would_block() {
        let (mut transport, _client) = accepted_pair();

        let mut buf = [0u8; 8];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_plain_shutdown_closes_peer() {
        let (mut transport, mut client) = accepted_pair();

        transport.shutdown();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_tls_load_missing_files() {
        let result = TlsAcceptor::load(Path::new("/no/such/cert.pem"), Path::new("/no/such/key.pem"));
        assert_eq!(result.err().unwrap(), NetworkError::Fatal(ErrorType::TlsConfig));
    }

    #[test]
    fn test_tls_load_garbage_pem() {
        let dir = std::env::temp_dir();
        let cert = dir.join("gossamer_test_garbage_cert.pem");
        let key = dir.join("gossamer_test_garbage_key.pem");
        std::fs::write(&cert, b"not a certificate").unwrap();
        std::fs::write(&key, b"not a key").unwrap();

        let result = TlsAcceptor::load(&cert, &key);
        assert_eq!(result.err().unwrap(), NetworkError::Fatal(ErrorType::TlsConfig));

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
