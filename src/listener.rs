use crate::socket::Socket;
use socket2::{Domain, Protocol, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to listen on {addr}: {source}")]
    OpenFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    AcceptFailed(std::io::Error),
    #[error("listener is closed")]
    InvalidState,
}

/// Non-blocking listening socket.
pub struct Listener {
    sock: Option<TcpListener>,
}

impl Listener {
    /// Bind and listen on `addr` with the given backlog. The socket is non-blocking.
    pub fn open(addr: SocketAddr, backlog: i32) -> Result<Self, ListenerError> {
        let open_failed = |source| ListenerError::OpenFailed { addr, source };
        let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(open_failed)?;
        sock.set_reuse_address(true).map_err(open_failed)?;
        sock.bind(&addr.into()).map_err(open_failed)?;
        sock.listen(backlog).map_err(open_failed)?;
        sock.set_nonblocking(true).map_err(open_failed)?;
        Ok(Self {
            sock: Some(sock.into()),
        })
    }

    /// Accept one pending connection as a non-blocking `Socket`.
    /// Returns `Ok(None)` when nothing is pending.
    pub fn accept(&self) -> Result<Option<(Socket, SocketAddr)>, ListenerError> {
        let listener = self.sock.as_ref().ok_or(ListenerError::InvalidState)?;
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(ListenerError::AcceptFailed)?;
                    let _ = stream.set_nodelay(true);
                    return Ok(Some((Socket::from_stream(stream), addr)));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ListenerError::AcceptFailed(err)),
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.sock
            .as_ref()
            .ok_or(ListenerError::InvalidState)?
            .local_addr()
            .map_err(ListenerError::AcceptFailed)
    }

    /// Borrow the descriptor for poller registration.
    pub fn borrow_fd(&self) -> Result<BorrowedFd<'_>, ListenerError> {
        self.sock
            .as_ref()
            .map(|sock| sock.as_fd())
            .ok_or(ListenerError::InvalidState)
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    /// Idempotent. Deregister from any poller first.
    pub fn close(&mut self) {
        self.sock = None;
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |sock| sock.as_raw_fd())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpStream;

    #[test]
    pub fn test_accept_drains_until_empty() {
        let listener = Listener::open("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(listener.accept().unwrap().is_none());

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();
        let mut accepted = 0;
        let timer = crate::utils::Timer::new_millis(1000);
        while accepted < 2 && !timer.expired() {
            if listener.accept().unwrap().is_some() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    pub fn test_closed_listener() {
        let mut listener = Listener::open("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        listener.close();
        assert!(!listener.is_open());
        assert!(matches!(listener.accept(), Err(ListenerError::InvalidState)));
    }
}
