use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error model used throughout the crate. `Wait` means the
/// operation cannot make progress yet and should be retried on the
/// next readiness event; `Fatal` means the connection (or, during
/// bootstrap, the whole server) is done for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// The descriptor table is at capacity.
    TableFull,
    /// A broadcast payload exceeds the rendezvous channel bound.
    PayloadTooLarge,
    AddrParse,
    /// A handle that no longer resolves to anything live: a
    /// connection torn down out from under its holder, or a
    /// rendezvous channel whose writer died mid-send.
    Gone,
    UnknownProtocol,
    /// Certificate or key material could not be loaded.
    TlsConfig,
    /// The server-side secure negotiation failed on accept.
    TlsNegotiation,
    PrivilegeDrop,
    Config,
    /// The framing engine declared the connection unrecoverable.
    Framing,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_folds_to_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_wait_is_not_a_failure() {
        let wait: NetworkResult<()> = Err(NetworkError::Wait);
        let fatal: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::TableFull));
        let ok: NetworkResult<()> = Ok(());

        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
        assert!(!ok.has_failed());
    }
}
