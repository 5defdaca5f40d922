//! Per-protocol rendezvous channel linking foreign callers to the
//! service loop. The loop side is a loopback listener on an OS-chosen
//! port, registered in the descriptor table right after the public
//! listener; the foreign side is a connected stream held by the
//! server handle. The channel carries nothing but broadcast payloads,
//! one payload per write, one payload per read.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::MAX_BROADCAST_PAYLOAD;
use mio::net::TcpListener;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Mutex;

/// Binds the loop-side end for one protocol. The chosen port is
/// recorded in the protocol descriptor so the foreign side knows
/// where to connect.
pub fn open_loop_side() -> NetworkResult<(TcpListener, u16)> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let listener = TcpListener::bind(&addr)?;
    let port = listener.local_addr()?.port();

    Ok((listener, port))
}

/// Foreign-side sender for one protocol. The mutex keeps writers
/// serialized, which is what preserves both the one-payload-per-write
/// framing and the per-caller delivery order.
pub struct ForeignSender {
    stream: Mutex<TcpStream>,
}

impl ForeignSender {
    /// Connects the foreign side to a loop-side rendezvous port.
    pub fn connect(port: u16) -> NetworkResult<ForeignSender> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        Ok(ForeignSender {
            stream: Mutex::new(stream),
        })
    }

    /// Ships one payload to the loop. Empty payloads are dropped
    /// before they reach the socket; a zero-byte stream write would
    /// never wake the loop.
    pub fn send(&self, payload: &[u8]) -> NetworkResult<()> {
        if payload.len() > MAX_BROADCAST_PAYLOAD {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        if payload.is_empty() {
            return Ok(());
        }

        // a poisoned lock means a writer died mid-send; the channel
        // can no longer be trusted to frame payloads
        let mut stream = match self.stream.lock() {
            Ok(stream) => stream,
            Err(_) => return Err(NetworkError::Fatal(ErrorType::Gone)),
        };
        stream.write_all(payload)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_loop_side_gets_a_port() {
        let (_listener, port) = open_loop_side().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_send_and_receive() {
        let (listener, port) = open_loop_side().unwrap();
        let sender = ForeignSender::connect(port).unwrap();

        let (mut pipe, _) = loop {
            match listener.accept_std() {
                Ok(pair) => break pair,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("accept failed {:?}", err),
            }
        };

        // an empty payload must not wake the loop
        sender.send(b"").unwrap();
        sender.send(b"hi").unwrap();

        // accept_std hands out a nonblocking stream
        let mut buf = [0u8; 16];
        let count = loop {
            match pipe.read(&mut buf) {
                Ok(count) => break count,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("read failed {:?}", err),
            }
        };
        assert_eq!(&buf[..count], b"hi");
    }

    #[test]
    fn test_payload_cap() {
        let (_listener, port) = open_loop_side().unwrap();
        let sender = ForeignSender::connect(port).unwrap();

        let oversize = vec![0u8; MAX_BROADCAST_PAYLOAD + 1];
        let result = sender.send(&oversize);
        assert_eq!(
            result.err().unwrap(),
            NetworkError::Fatal(ErrorType::PayloadTooLarge)
        );

        let exact = vec![0u8; MAX_BROADCAST_PAYLOAD];
        sender.send(&exact).unwrap();
    }
}
