use crate::buffer::{BufferError, RecvBuffer, SendBuffer};
use crate::framer::{FrameError, MessageFramer};
use crate::socket::{Socket, SocketError, Transfer, Transport};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Size of the stack scratch buffer each recv call reads into.
pub const RECV_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// `SocketError`, `RecvBufferError`, `SendBufferError` raised by I/O and `PeerClosed` mean the session has been closed.
/// `NotOpen`, `AlreadyOpen`, `InvalidArgs` and `Frame` are caller mistakes and change nothing.
/// A `SendBufferError` from `queue_send` (usually overflow) does not close the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not open")]
    NotOpen,
    #[error("session is already open")]
    AlreadyOpen,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("socket error: {0}")]
    SocketError(#[from] SocketError),
    #[error("recv buffer error: {0}")]
    RecvBufferError(BufferError),
    #[error("send buffer error: {0}")]
    SendBufferError(BufferError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("internal session error")]
    InternalError,
    #[error("peer closed the connection")]
    PeerClosed,
}

/// Event sink of a `Session`, given to it at construction.
///
/// Every method is invoked synchronously from the session call that triggered it. The handler is
/// moved out of the session while its own method runs, so a callback may freely call back into the
/// session (queue a reply, close it). Notifications caused by such nested calls are delivered right
/// after the running callback returns.
pub trait SessionHandler<T: Transport = Socket>: Sized {
    /// Bytes were appended to the recv buffer. Called once per readable pass.
    fn on_recv(&mut self, _session: &mut Session<Self, T>) {}
    /// `sent` bytes left the send buffer.
    fn on_send(&mut self, _session: &mut Session<Self, T>, _sent: usize) {}
    /// The session has closed. Called exactly once per open/close cycle.
    fn on_close(&mut self, _session: &Session<Self, T>) {}
    /// The send buffer went from empty to non-empty (`true`) or back (`false`).
    fn on_write_interest_changed(&mut self, _session: &Session<Self, T>, _enabled: bool) {}
}

impl<T: Transport> SessionHandler<T> for () {}

/// `Session` owns one connected transport plus a recv and a send buffer, and moves bytes between them
/// with non-blocking loops driven by readiness events.
///
/// Sending never touches the socket directly: `queue_send` only appends to the send buffer and the
/// bytes leave on the next `on_writable` (or `flush`).
pub struct Session<H, T = Socket> {
    socket: T,
    recv_buf: RecvBuffer,
    send_buf: SendBuffer,
    state: SessionState,
    handler: Option<H>,
    last_active: Instant,
    write_interest: bool, // last value reported through on_write_interest_changed
    close_pending: bool,  // closed while the handler was out; on_close not delivered yet
}

impl<H: SessionHandler<T>, T: Transport> Session<H, T> {
    /// Create a closed session. Call `open` before any I/O.
    pub fn new(socket: T, recv_buffer_size: usize, send_buffer_size: usize, handler: H) -> Self {
        Self {
            socket,
            recv_buf: RecvBuffer::new(recv_buffer_size),
            send_buf: SendBuffer::new(send_buffer_size),
            state: SessionState::Closed,
            handler: Some(handler),
            last_active: Instant::now(),
            write_interest: false,
            close_pending: false,
        }
    }

    /// Closed -> Opening -> Open. Any failure rolls back to Closed.
    pub fn open(&mut self) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Open | SessionState::Opening) {
            return Err(SessionError::AlreadyOpen);
        }
        self.state = SessionState::Opening;
        if let Err(err) = self.recv_buf.open() {
            self.state = SessionState::Closed;
            return Err(SessionError::RecvBufferError(err));
        }
        if let Err(err) = self.send_buf.open() {
            self.recv_buf.close();
            self.state = SessionState::Closed;
            return Err(SessionError::SendBufferError(err));
        }
        if !self.socket.is_open() {
            self.recv_buf.close();
            self.send_buf.close();
            self.state = SessionState::Closed;
            return Err(SessionError::SocketError(SocketError::InvalidState));
        }
        self.state = SessionState::Open;
        self.write_interest = false;
        self.last_active = Instant::now();
        Ok(())
    }

    /// Close the socket and both buffers, then notify `on_close`. No-op when already closed.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Closing) {
            return;
        }
        self.state = SessionState::Closing;
        self.socket.close();
        self.recv_buf.close();
        self.send_buf.close();
        self.state = SessionState::Closed;
        self.write_interest = false;
        if self.handler.is_some() {
            self.notify(|handler, session| handler.on_close(session));
        } else {
            self.close_pending = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.socket.is_open()
    }

    /// Read until the socket would block, appending everything to the recv buffer, then notify `on_recv` once.
    ///
    /// A 0-byte read closes with `PeerClosed`; bytes read earlier in the same pass are still delivered first.
    /// A recv buffer that cannot take a chunk is fatal: reading is never paused.
    pub fn on_readable(&mut self) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }
        let mut scratch = [0u8; RECV_CHUNK_SIZE];
        let mut received = 0usize;
        loop {
            match self.socket.recv(&mut scratch) {
                Ok(Transfer::WouldBlock) => break,
                Ok(Transfer::Bytes(0)) => {
                    if received > 0 {
                        self.notify(|handler, session| handler.on_recv(session));
                    }
                    self.close();
                    return Err(SessionError::PeerClosed);
                }
                Ok(Transfer::Bytes(n)) => {
                    if let Err(err) = self.recv_buf.write(&scratch[..n]) {
                        self.close();
                        return Err(SessionError::RecvBufferError(err));
                    }
                    received += n;
                    self.last_active = Instant::now();
                }
                Err(err) => {
                    self.close();
                    return Err(SessionError::SocketError(err));
                }
            }
        }
        self.notify(|handler, session| handler.on_recv(session));
        Ok(())
    }

    /// Send queued bytes until the send buffer is empty or the socket would block.
    /// Only the bytes the socket accepted are consumed; `on_send` fires after each accepted chunk.
    pub fn on_writable(&mut self) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }
        while !self.send_buf.is_empty() {
            let (head, _) = self
                .send_buf
                .as_slices()
                .map_err(SessionError::SendBufferError)?;
            let sent = match self.socket.send(head) {
                Ok(Transfer::WouldBlock) => break,
                Ok(Transfer::Bytes(0)) => {
                    self.close();
                    return Err(SessionError::SocketError(SocketError::SendFailed(
                        ErrorKind::WriteZero.into(),
                    )));
                }
                Ok(Transfer::Bytes(n)) => n,
                Err(err) => {
                    self.close();
                    return Err(SessionError::SocketError(err));
                }
            };
            if let Err(err) = self.send_buf.consume(sent) {
                self.close();
                return Err(SessionError::SendBufferError(err));
            }
            self.last_active = Instant::now();
            self.notify(|handler, session| handler.on_send(session, sent));
            if !self.is_open() {
                return Ok(()); // closed by on_send
            }
        }
        self.sync_write_interest();
        Ok(())
    }

    /// Push queued bytes now instead of waiting for a writable event.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.on_writable()
    }

    /// Append `data` to the send buffer, all or nothing. Does not touch the socket.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.send_buf
            .write(data)
            .map_err(SessionError::SendBufferError)?;
        self.last_active = Instant::now();
        self.sync_write_interest();
        Ok(())
    }

    /// Queue `payload` as one length-prefixed frame. Either the whole frame is queued or nothing.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }
        let header = MessageFramer::encode_header(payload.len())?;
        if header.len() + payload.len() > self.send_buf.free_space() {
            return Err(SessionError::SendBufferError(BufferError::Overflow));
        }
        self.send_buf
            .write(&header)
            .map_err(SessionError::SendBufferError)?;
        if !payload.is_empty() {
            self.send_buf
                .write(payload)
                .map_err(SessionError::SendBufferError)?;
        }
        self.last_active = Instant::now();
        self.sync_write_interest();
        Ok(())
    }

    /// Run `f` with the handler moved out, exactly like a session callback: `f` may call back into
    /// the session, and the close / write-interest notifications it causes are delivered afterwards.
    /// Returns `None` when called from inside a running callback.
    pub fn with_handler<R>(&mut self, f: impl FnOnce(&mut H, &mut Self) -> R) -> Option<R> {
        let mut handler = self.handler.take()?;
        let result = f(&mut handler, self);
        self.handler = Some(handler);
        self.replay_deferred();
        Some(result)
    }

    //----------------------------- private -----------------------------------------------

    fn notify(&mut self, callback: impl FnOnce(&mut H, &mut Self)) {
        self.with_handler(callback);
    }

    fn replay_deferred(&mut self) {
        if self.close_pending {
            self.close_pending = false;
            self.notify(|handler, session| handler.on_close(session));
        } else {
            self.sync_write_interest();
        }
    }

    fn sync_write_interest(&mut self) {
        if self.handler.is_none() || self.state != SessionState::Open {
            return; // replayed when the running callback returns
        }
        let wanted = !self.send_buf.is_empty();
        if wanted != self.write_interest {
            self.write_interest = wanted;
            self.notify(|handler, session| handler.on_write_interest_changed(session, wanted));
        }
    }
}

impl<H, T> Session<H, T> {
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// No successful read, send or enqueue for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether write readiness is currently wanted, as last reported to the handler.
    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn recv_buffer(&self) -> &RecvBuffer {
        &self.recv_buf
    }

    pub fn recv_buffer_mut(&mut self) -> &mut RecvBuffer {
        &mut self.recv_buf
    }

    pub fn send_buffer(&self) -> &SendBuffer {
        &self.send_buf
    }

    pub fn socket(&self) -> &T {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut T {
        &mut self.socket
    }

    /// `None` only while the handler's own callback is running.
    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    pub fn handler_mut(&mut self) -> Option<&mut H> {
        self.handler.as_mut()
    }

    pub fn into_handler(mut self) -> Option<H> {
        self.handler.take()
    }
}

impl<H> Session<H, Socket> {
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    pub enum Step {
        Data(&'static [u8]),
        Eof,
        Fail,
    }

    /// In-memory transport: recv replays a script, send accepts up to a byte budget.
    pub struct ScriptedTransport {
        pub reads: VecDeque<Step>,
        pub sent: Vec<u8>,
        pub send_budget: usize,
        pub max_per_send: usize,
        pub open: bool,
    }

    impl ScriptedTransport {
        pub fn new(reads: Vec<Step>) -> Self {
            Self {
                reads: reads.into(),
                sent: Vec::new(),
                send_budget: usize::MAX,
                max_per_send: usize::MAX,
                open: true,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, buf: &[u8]) -> Result<Transfer, SocketError> {
            let n = buf.len().min(self.send_budget).min(self.max_per_send);
            if n == 0 {
                return Ok(Transfer::WouldBlock);
            }
            self.send_budget -= n;
            self.sent.extend_from_slice(&buf[..n]);
            Ok(Transfer::Bytes(n))
        }
        fn recv(&mut self, buf: &mut [u8]) -> Result<Transfer, SocketError> {
            match self.reads.pop_front() {
                None => Ok(Transfer::WouldBlock),
                Some(Step::Data(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(Transfer::Bytes(data.len()))
                }
                Some(Step::Eof) => Ok(Transfer::Bytes(0)),
                Some(Step::Fail) => Err(SocketError::RecvFailed(
                    ErrorKind::ConnectionReset.into(),
                )),
            }
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn close(&mut self) {
            self.open = false;
        }
    }

    #[derive(Default)]
    pub struct Recorder {
        pub recv_calls: usize,
        pub received: Vec<u8>,
        pub sends: Vec<usize>,
        pub closes: usize,
        pub interest: Vec<bool>,
        pub echo: bool,
        pub close_when_flushed: bool,
    }

    impl SessionHandler<ScriptedTransport> for Recorder {
        fn on_recv(&mut self, session: &mut Session<Self, ScriptedTransport>) {
            self.recv_calls += 1;
            let mut buf = [0u8; 256];
            while let Ok(n) = session.recv_buffer_mut().read(&mut buf) {
                self.received.extend_from_slice(&buf[..n]);
                if self.echo {
                    session.queue_send(&buf[..n]).unwrap();
                }
            }
        }
        fn on_send(&mut self, session: &mut Session<Self, ScriptedTransport>, sent: usize) {
            self.sends.push(sent);
            if self.close_when_flushed && !session.has_pending_send() {
                session.close();
            }
        }
        fn on_close(&mut self, session: &Session<Self, ScriptedTransport>) {
            assert_eq!(session.state(), SessionState::Closed);
            self.closes += 1;
        }
        fn on_write_interest_changed(
            &mut self,
            _session: &Session<Self, ScriptedTransport>,
            enabled: bool,
        ) {
            self.interest.push(enabled);
        }
    }

    fn open_session(
        reads: Vec<Step>,
        recv_size: usize,
        send_size: usize,
        handler: Recorder,
    ) -> Session<Recorder, ScriptedTransport> {
        let mut session = Session::new(ScriptedTransport::new(reads), recv_size, send_size, handler);
        session.open().unwrap();
        session
    }

    fn recorder(session: &Session<Recorder, ScriptedTransport>) -> &Recorder {
        session.handler().unwrap()
    }

    #[test]
    pub fn test_open_close_lifecycle() {
        let mut session = Session::new(ScriptedTransport::new(vec![]), 64, 64, Recorder::default());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.queue_send(b"x"), Err(SessionError::NotOpen)));
        session.open().unwrap();
        assert!(session.is_open());
        assert!(matches!(session.open(), Err(SessionError::AlreadyOpen)));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.socket().is_open());
        assert!(!session.recv_buffer().is_open());
        assert!(!session.send_buffer().is_open());
        assert_eq!(recorder(&session).closes, 1);
        assert!(matches!(session.on_readable(), Err(SessionError::NotOpen)));
        assert!(matches!(session.on_writable(), Err(SessionError::NotOpen)));
    }

    #[test]
    pub fn test_open_fails_on_closed_socket() {
        let mut transport = ScriptedTransport::new(vec![]);
        transport.open = false;
        let mut session = Session::new(transport, 64, 64, Recorder::default());
        assert!(matches!(
            session.open(),
            Err(SessionError::SocketError(SocketError::InvalidState))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.recv_buffer().is_open());

        let mut session = Session::new(ScriptedTransport::new(vec![]), 0, 64, Recorder::default());
        assert!(matches!(
            session.open(),
            Err(SessionError::RecvBufferError(BufferError::InternalError))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    pub fn test_peer_closed() {
        let mut session = open_session(vec![Step::Eof], 64, 64, Recorder::default());
        assert!(matches!(session.on_readable(), Err(SessionError::PeerClosed)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_open());
        assert_eq!(recorder(&session).closes, 1);
        assert_eq!(recorder(&session).recv_calls, 0);
        session.close();
        assert_eq!(recorder(&session).closes, 1);
    }

    #[test]
    pub fn test_reads_are_batched_into_one_notification() {
        let reads = vec![Step::Data(b"ab"), Step::Data(b"cd"), Step::Data(b"ef")];
        let mut session = open_session(reads, 64, 64, Recorder::default());
        session.on_readable().unwrap();
        assert_eq!(recorder(&session).recv_calls, 1);
        assert_eq!(recorder(&session).received, b"abcdef");
        assert!(session.is_open());
    }

    #[test]
    pub fn test_data_before_eof_is_delivered() {
        let mut session = open_session(vec![Step::Data(b"bye"), Step::Eof], 64, 64, Recorder::default());
        assert!(matches!(session.on_readable(), Err(SessionError::PeerClosed)));
        assert_eq!(recorder(&session).received, b"bye");
        assert_eq!(recorder(&session).recv_calls, 1);
        assert_eq!(recorder(&session).closes, 1);
    }

    #[test]
    pub fn test_full_recv_buffer_is_fatal() {
        let mut session = open_session(vec![Step::Data(b"12345678")], 4, 64, Recorder::default());
        assert!(matches!(
            session.on_readable(),
            Err(SessionError::RecvBufferError(BufferError::Overflow))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(recorder(&session).closes, 1);
    }

    #[test]
    pub fn test_socket_error_closes() {
        let mut session = open_session(vec![Step::Fail], 64, 64, Recorder::default());
        assert!(matches!(
            session.on_readable(),
            Err(SessionError::SocketError(SocketError::RecvFailed(_)))
        ));
        assert_eq!(recorder(&session).closes, 1);
    }

    #[test]
    pub fn test_queue_send_then_writable_drains_and_disables_interest_once() {
        let mut session = open_session(vec![], 64, 64, Recorder::default());
        session.queue_send(b"hello").unwrap();
        assert!(session.write_interest());
        assert_eq!(session.socket().sent, b""); // nothing written until writable
        session.on_writable().unwrap();
        assert_eq!(session.socket().sent, b"hello");
        assert!(session.send_buffer().is_empty());
        assert_eq!(recorder(&session).interest, vec![true, false]);
        assert_eq!(recorder(&session).sends, vec![5]);
        session.on_writable().unwrap();
        assert_eq!(recorder(&session).interest, vec![true, false]);
    }

    #[test]
    pub fn test_partial_send_waits_for_next_writable() {
        let mut session = open_session(vec![], 64, 64, Recorder::default());
        session.socket_mut().send_budget = 5;
        session.socket_mut().max_per_send = 3;
        session.queue_send(b"abcdefgh").unwrap();
        session.on_writable().unwrap();
        assert_eq!(session.socket().sent, b"abcde");
        assert_eq!(session.send_buffer().len(), 3);
        assert_eq!(recorder(&session).interest, vec![true]);

        session.socket_mut().send_budget = usize::MAX;
        session.on_writable().unwrap();
        assert_eq!(session.socket().sent, b"abcdefgh");
        assert_eq!(recorder(&session).sends, vec![3, 2, 3]);
        assert_eq!(recorder(&session).interest, vec![true, false]);
    }

    #[test]
    pub fn test_close_from_send_callback() {
        let handler = Recorder {
            close_when_flushed: true,
            ..Default::default()
        };
        let mut session = open_session(vec![], 64, 64, handler);
        session.queue_send(b"last words").unwrap();
        session.on_writable().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.socket().sent, b"last words");
        assert_eq!(recorder(&session).closes, 1);
    }

    #[test]
    pub fn test_queue_send_overflow_keeps_session_open() {
        let mut session = open_session(vec![], 64, 4, Recorder::default());
        assert!(matches!(
            session.queue_send(b"too long"),
            Err(SessionError::SendBufferError(BufferError::Overflow))
        ));
        assert!(session.is_open());
        assert!(!session.has_pending_send());
        assert!(recorder(&session).interest.is_empty());
    }

    #[test]
    pub fn test_echo_from_recv_callback_enables_interest_after_callback() {
        let handler = Recorder {
            echo: true,
            ..Default::default()
        };
        let mut session = open_session(vec![Step::Data(b"ping")], 64, 64, handler);
        session.on_readable().unwrap();
        assert_eq!(recorder(&session).interest, vec![true]);
        session.flush().unwrap();
        assert_eq!(session.socket().sent, b"ping");
        assert_eq!(recorder(&session).interest, vec![true, false]);
    }

    #[test]
    pub fn test_send_frame() {
        let mut session = open_session(vec![], 64, 16, Recorder::default());
        session.send_frame(b"abc").unwrap();
        session.flush().unwrap();
        assert_eq!(session.socket().sent, [0, 0, 0, 3, b'a', b'b', b'c']);
        // 4 + 13 > 16: nothing is queued.
        assert!(matches!(
            session.send_frame(&[7u8; 13]),
            Err(SessionError::SendBufferError(BufferError::Overflow))
        ));
        assert!(!session.has_pending_send());
        assert!(matches!(
            session.send_frame(&vec![0u8; crate::framer::MAX_PAYLOAD + 1]),
            Err(SessionError::Frame(FrameError::Overflow(_)))
        ));
    }

    #[test]
    pub fn test_idle() {
        let session = open_session(vec![], 64, 64, Recorder::default());
        assert!(!session.is_idle(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.is_idle(Duration::from_millis(1)));
    }
}
