use socket2::{Domain, Protocol, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use thiserror::Error;

/// Socket-level failures. "Would block" is not among them, see `Transfer`.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is closed")]
    InvalidState,
    #[error("connect failed: {0}")]
    ConnectFailed(std::io::Error),
    #[error("send failed: {0}")]
    SendFailed(std::io::Error),
    #[error("recv failed: {0}")]
    RecvFailed(std::io::Error),
    #[error("socket option failed: {0}")]
    OptionFailed(std::io::Error),
}

/// Outcome of one non-blocking send or recv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved. For `recv`, `Bytes(0)` means the peer closed.
    Bytes(usize),
    /// The call would have blocked; retry on the next readiness event.
    WouldBlock,
}

/// Result of a non-blocking `Socket::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    /// Completion is signalled by write readiness; check `Socket::take_error` then.
    InProgress,
}

/// The byte-stream contract a `Session` drives. `Socket` is the production implementation.
pub trait Transport {
    /// Send from `buf`. Partial sends are possible; the caller retries the rest.
    fn send(&mut self, buf: &[u8]) -> Result<Transfer, SocketError>;
    /// Receive into `buf`. `Bytes(0)` means the peer closed.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Transfer, SocketError>;
    fn is_open(&self) -> bool;
    /// Idempotent.
    fn close(&mut self);
}

/// A connected TCP socket.
///
/// `close` shuts the connection down but keeps the descriptor until the `Socket` is dropped,
/// so the owner can still deregister it from a poller.
pub struct Socket {
    stream: TcpStream,
    open: bool,
}

impl Socket {
    /// Connect to `addr`. With `non_blocking`, returns `InProgress` instead of waiting for the handshake.
    pub fn connect(
        addr: SocketAddr,
        non_blocking: bool,
    ) -> Result<(Socket, ConnectStatus), SocketError> {
        let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(SocketError::ConnectFailed)?;
        if non_blocking {
            sock.set_nonblocking(true)
                .map_err(SocketError::ConnectFailed)?;
        }
        let status = match sock.connect(&addr.into()) {
            Ok(()) => ConnectStatus::Connected,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == ErrorKind::WouldBlock =>
            {
                ConnectStatus::InProgress
            }
            Err(err) => return Err(SocketError::ConnectFailed(err)),
        };
        let stream: TcpStream = sock.into();
        let _ = stream.set_nodelay(true);
        Ok((Socket::from_stream(stream), status))
    }

    /// Wrap an already connected stream, e.g. one returned by accept.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream, open: true }
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<(), SocketError> {
        if !self.open {
            return Err(SocketError::InvalidState);
        }
        self.stream
            .set_nonblocking(!blocking)
            .map_err(SocketError::OptionFailed)
    }

    /// Pending `SO_ERROR`. After an in-progress connect turns writable, `Ok(None)` means connected.
    pub fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        self.stream.take_error()
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Transport for Socket {
    fn send(&mut self, buf: &[u8]) -> Result<Transfer, SocketError> {
        if !self.open {
            return Err(SocketError::InvalidState);
        }
        loop {
            match self.stream.write(buf) {
                Ok(bytes) => return Ok(Transfer::Bytes(bytes)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(SocketError::SendFailed(err)),
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Transfer, SocketError> {
        if !self.open {
            return Err(SocketError::InvalidState);
        }
        loop {
            match self.stream.read(buf) {
                Ok(bytes) => return Ok(Transfer::Bytes(bytes)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(SocketError::RecvFailed(err)),
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            // NotConnected when the peer is already gone is fine.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd())
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    pub fn test_blocking_connect_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut client, status) = Socket::connect(addr, false).unwrap();
        assert_eq!(status, ConnectStatus::Connected);
        let (accepted, _) = listener.accept().unwrap();
        let mut server = Socket::from_stream(accepted);

        assert_eq!(client.send(b"ping").unwrap(), Transfer::Bytes(4));
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).unwrap(), Transfer::Bytes(4));
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    pub fn test_nonblocking_recv_would_block_then_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut client, _) = Socket::connect(addr, false).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut server = Socket::from_stream(accepted);
        server.set_blocking(false).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).unwrap(), Transfer::WouldBlock);
        client.close();
        server.set_blocking(true).unwrap();
        assert_eq!(server.recv(&mut buf).unwrap(), Transfer::Bytes(0));
    }

    #[test]
    pub fn test_closed_socket_is_invalid_state() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, _) = Socket::connect(listener.local_addr().unwrap(), false).unwrap();
        client.close();
        client.close();
        assert!(!client.is_open());
        assert!(matches!(client.send(b"x"), Err(SocketError::InvalidState)));
        assert!(matches!(
            client.recv(&mut [0u8; 4]),
            Err(SocketError::InvalidState)
        ));
    }
}
