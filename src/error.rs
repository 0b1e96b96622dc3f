use crate::listener::ListenerError;
use crate::session::SessionError;
use crate::socket::SocketError;
use thiserror::Error;

/// Failures that stop a reactor from starting or polling.
/// Per-connection failures never surface here; the reactors handle them (evict or reconnect).
#[derive(Debug, Error)]
pub enum Error {
    #[error("reactor is already started")]
    AlreadyStarted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
