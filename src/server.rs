use crate::config::ServerConfig;
use crate::error::Error;
use crate::flat_storage::FlatStorage;
use crate::listener::Listener;
use crate::protocol::Protocol;
use crate::session::{Session, SessionError, SessionHandler};
use crate::socket::Socket;
use polling::{Event, Events, PollMode, Poller};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, info, warn};

#[cfg(target_pointer_width = "64")]
type HalfUsize = u32;
#[cfg(target_pointer_width = "32")]
type HalfUsize = u16;

/// Poller key of the listening socket. Never produced by `ConnId::to_usize` in practice,
/// since slots are dense and stay far below `HalfUsize::MAX`.
const LISTENER_KEY: usize = usize::MAX - 1;

/// Identity of one accepted connection: its slot in the session registry plus a version that changes
/// every time a slot is reused, so an event queued for a connection that was closed (and whose slot
/// was handed to a new one) in the same poll batch is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    slot: HalfUsize, // must be half of usize
    ver: HalfUsize,  // must be half of usize
}

impl ConnId {
    /// convert to poller event key
    pub fn to_usize(&self) -> usize {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        ((self.ver as usize) << halfbits) | (self.slot as usize)
    }
    /// convert from poller event key
    pub fn from_usize(val: usize) -> Self {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        Self {
            slot: val as HalfUsize,
            ver: (val >> halfbits) as HalfUsize,
        }
    }
    /// `None` when `slot` does not fit in half a usize.
    fn new(slot: usize, ver: HalfUsize) -> Option<Self> {
        let slot = HalfUsize::try_from(slot).ok()?;
        Some(Self { slot, ver })
    }
    fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.slot, self.ver)
    }
}

/// Session handler of every server connection: forwards session events to the connection's
/// `Protocol` and keeps the poller registration in step with the send buffer.
pub struct ServerLink<P> {
    proto: P,
    poller: Rc<Poller>,
    id: ConnId,
    peer: SocketAddr,
}

impl<P> ServerLink<P> {
    pub fn id(&self) -> ConnId {
        self.id
    }
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
    pub fn protocol(&self) -> &P {
        &self.proto
    }
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.proto
    }
}

/// A server-side session.
pub type Connection<P> = Session<ServerLink<P>>;

impl<P: Protocol> SessionHandler for ServerLink<P> {
    fn on_recv(&mut self, session: &mut Connection<P>) {
        self.proto.on_recv(session);
    }
    fn on_send(&mut self, session: &mut Connection<P>, sent: usize) {
        self.proto.on_send(session, sent);
    }
    fn on_close(&mut self, session: &Connection<P>) {
        debug!(conn = %self.id, peer = %self.peer, "connection closed");
        self.proto.on_close(session);
    }
    fn on_write_interest_changed(&mut self, session: &Connection<P>, enabled: bool) {
        let interest = if enabled {
            Event::all(self.id.to_usize())
        } else {
            Event::readable(self.id.to_usize())
        };
        if let Err(err) = self
            .poller
            .modify_with_mode(session.socket(), interest, PollMode::Level)
        {
            warn!(conn = %self.id, error = %err, "failed to update write interest");
        }
    }
}

/// `ServerReactor` accepts connections on one listening socket and drives one `Session` per
/// connection, each with its own `Protocol` instance built by the factory given to `new`.
///
/// Everything runs on the thread calling `process_events` (or `run`).
pub struct ServerReactor<P> {
    config: ServerConfig,
    poller: Rc<Poller>,
    listener: Option<Listener>,
    sessions: FlatStorage<Connection<P>>,
    new_protocol: Box<dyn FnMut(SocketAddr) -> P>,
    events: Events,
    ready: Vec<Event>,
    next_ver: HalfUsize,
    running: bool,
}

impl<P: Protocol> ServerReactor<P> {
    pub fn new(
        config: ServerConfig,
        new_protocol: impl FnMut(SocketAddr) -> P + 'static,
    ) -> Result<Self, Error> {
        Ok(Self {
            config,
            poller: Rc::new(Poller::new()?),
            listener: None,
            sessions: FlatStorage::new(),
            new_protocol: Box::new(new_protocol),
            events: Events::new(),
            ready: Vec::new(),
            next_ver: 0,
            running: false,
        })
    }

    /// Open the listener and register it for read readiness.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.listener.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let listener = Listener::open(self.config.addr, self.config.backlog)?;
        // SAFETY: the listener is deleted from the poller in `stop` before it is dropped.
        unsafe {
            self.poller
                .add_with_mode(&listener, Event::readable(LISTENER_KEY), PollMode::Level)?;
        }
        info!(addr = %listener.local_addr()?, backlog = self.config.backlog, "listening");
        self.listener = Some(listener);
        self.running = true;
        Ok(())
    }

    /// `start` if needed, then process events until `stop` or a poller failure.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.listener.is_none() {
            self.start()?;
        }
        while self.running {
            self.process_events()?;
        }
        Ok(())
    }

    /// Close every connection and the listener.
    pub fn stop(&mut self) {
        self.running = false;
        let ids: Vec<ConnId> = self.sessions.iter().filter_map(|(_, conn)| conn_id(conn)).collect();
        for id in ids {
            if let Some(conn) = self.sessions.get_mut(id.slot()) {
                conn.close();
            }
            self.remove(id);
        }
        if let Some(mut listener) = self.listener.take() {
            if let Ok(fd) = listener.borrow_fd() {
                if let Err(err) = self.poller.delete(fd) {
                    warn!(error = %err, "failed to deregister listener");
                }
            }
            listener.close();
            info!("server stopped");
        }
    }

    /// One cycle: wait up to `tick`, dispatch every ready event, then evict idle connections.
    /// Returns the number of events dispatched.
    pub fn process_events(&mut self) -> Result<usize, Error> {
        if !self.running {
            return Ok(0);
        }
        self.events.clear();
        match self.poller.wait(&mut self.events, Some(self.config.tick)) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(Error::Io(err)),
        }
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter());
        for ev in &ready {
            if ev.key == LISTENER_KEY {
                self.accept_all();
            } else {
                self.dispatch(ev);
            }
        }
        let count = ready.len();
        self.ready = ready;
        self.evict_idle();
        Ok(count)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Iterate over open connections.
    pub fn connections(&self) -> impl Iterator<Item = &Connection<P>> {
        self.sessions.iter().map(|(_, conn)| conn)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection<P>> {
        self.sessions
            .get(id.slot())
            .filter(|conn| conn_id(conn) == Some(id))
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection<P>> {
        self.sessions
            .get_mut(id.slot())
            .filter(|conn| conn_id(conn) == Some(id))
    }

    //----------------------------- private -----------------------------------------------

    fn accept_all(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok(Some((socket, peer))) => self.add_connection(socket, peer),
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn add_connection(&mut self, socket: Socket, peer: SocketAddr) {
        let Some(id) = ConnId::new(self.sessions.next_key(), self.next_ver.wrapping_add(1)) else {
            warn!(%peer, connections = self.sessions.len(), "connection table full, rejecting");
            return;
        };
        self.next_ver = id.ver;
        let link = ServerLink {
            proto: (self.new_protocol)(peer),
            poller: Rc::clone(&self.poller),
            id,
            peer,
        };
        let mut conn = Session::new(
            socket,
            self.config.recv_buffer_size,
            self.config.send_buffer_size,
            link,
        );
        if let Err(err) = conn.open() {
            warn!(%peer, error = %err, "failed to open session");
            return;
        }
        // SAFETY: `remove` deletes the socket from the poller before the session is dropped.
        if let Err(err) = unsafe {
            self.poller.add_with_mode(
                conn.socket(),
                Event::readable(id.to_usize()),
                PollMode::Level,
            )
        } {
            warn!(%peer, error = %err, "failed to register connection");
            conn.close();
            return;
        }
        let fd = conn.fd();
        let slot = self.sessions.add(conn);
        debug_assert_eq!(slot, id.slot());
        debug!(conn = %id, %peer, fd, "connection accepted");
    }

    fn dispatch(&mut self, ev: &Event) {
        let id = ConnId::from_usize(ev.key);
        let Some(conn) = self.connection_mut(id) else {
            debug!(conn = %id, "event for a removed connection");
            return;
        };
        if ev.is_err().unwrap_or(false) {
            debug!(conn = %id, "socket error");
            conn.close();
        } else {
            let hangup = ev.is_interrupt();
            if ev.readable || hangup {
                if let Err(err) = conn.on_readable() {
                    log_session_error(id, "read", &err);
                }
            }
            if hangup {
                debug!(conn = %id, "hangup");
                conn.close();
            } else if ev.writable && conn.is_open() {
                if let Err(err) = conn.on_writable() {
                    log_session_error(id, "write", &err);
                }
            }
        }
        if !conn.is_open() {
            self.remove(id);
        }
    }

    fn evict_idle(&mut self) {
        let timeout = self.config.idle_timeout;
        let idle: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|(_, conn)| conn.is_idle(timeout))
            .filter_map(|(_, conn)| conn_id(conn))
            .collect();
        for id in idle {
            if let Some(conn) = self.sessions.get_mut(id.slot()) {
                info!(conn = %id, timeout = ?timeout, "evicting idle connection");
                conn.close();
            }
            self.remove(id);
        }
    }

    /// Deregister and drop a closed session.
    fn remove(&mut self, id: ConnId) {
        if let Some(conn) = self.sessions.remove(id.slot()) {
            if let Err(err) = self.poller.delete(conn.socket()) {
                warn!(conn = %id, error = %err, "failed to deregister connection");
            }
        }
    }
}

impl<P> Drop for ServerReactor<P> {
    fn drop(&mut self) {
        // Sources must leave the poller before their descriptors close.
        for (_, conn) in self.sessions.iter() {
            let _ = self.poller.delete(conn.socket());
        }
        if let Some(listener) = &self.listener {
            if let Ok(fd) = listener.borrow_fd() {
                let _ = self.poller.delete(fd);
            }
        }
    }
}

fn conn_id<P>(conn: &Connection<P>) -> Option<ConnId> {
    conn.handler().map(|link| link.id)
}

fn log_session_error(id: ConnId, op: &str, err: &SessionError) {
    match err {
        SessionError::PeerClosed => debug!(conn = %id, "peer closed"),
        _ => warn!(conn = %id, op, error = %err, "connection failed"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::Timer;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    #[derive(Default)]
    struct RecvCounter {
        recvs: usize,
    }

    impl Protocol for RecvCounter {
        fn on_recv(&mut self, _conn: &mut Connection<Self>) {
            self.recvs += 1;
        }
    }

    fn started() -> ServerReactor<RecvCounter> {
        let config = ServerConfig::default()
            .with_addr("127.0.0.1:0".parse().unwrap())
            .with_tick(Duration::from_millis(10));
        let mut server = ServerReactor::new(config, |_| RecvCounter::default()).unwrap();
        server.start().unwrap();
        server
    }

    fn ids(server: &ServerReactor<RecvCounter>) -> Vec<ConnId> {
        server.connections().filter_map(conn_id).collect()
    }

    fn accept_one(server: &mut ServerReactor<RecvCounter>) -> (TcpStream, ConnId) {
        let stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let before = ids(server);
        let timer = Timer::new_millis(2000);
        while server.connection_count() == before.len() && !timer.expired() {
            server.accept_all();
        }
        let id = ids(server)
            .into_iter()
            .find(|id| !before.contains(id))
            .unwrap();
        (stream, id)
    }

    #[test]
    pub fn test_conn_id_key_round_trip() {
        let id = ConnId { slot: 7, ver: 3 };
        assert_eq!(ConnId::from_usize(id.to_usize()), id);
        assert_ne!(id.to_usize(), LISTENER_KEY);
        assert_eq!(id.to_string(), "7:3");
        let reused = ConnId { slot: 7, ver: 4 };
        assert_ne!(reused.to_usize(), id.to_usize());
    }

    #[test]
    pub fn test_conn_id_slot_must_fit_half_usize() {
        assert_eq!(ConnId::new(5, 2), Some(ConnId { slot: 5, ver: 2 }));
        assert_eq!(ConnId::new(HalfUsize::MAX as usize + 1, 1), None);
    }

    #[test]
    pub fn test_event_for_reused_slot_is_ignored() {
        let mut server = started();
        let (_old_stream, old_id) = accept_one(&mut server);
        server.connection_mut(old_id).unwrap().close();
        server.remove(old_id);
        assert_eq!(server.connection_count(), 0);

        let (mut stream, new_id) = accept_one(&mut server);
        assert_eq!(new_id.slot(), old_id.slot());
        assert_ne!(new_id, old_id);
        stream.write_all(b"pending").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        server.dispatch(&Event::readable(old_id.to_usize()));
        assert!(server.connection(old_id).is_none());
        let conn = server.connection(new_id).unwrap();
        assert!(conn.is_open());
        assert!(conn.recv_buffer().is_empty());
        assert_eq!(conn.handler().unwrap().protocol().recvs, 0);

        server.dispatch(&Event::readable(new_id.to_usize()));
        let conn = server.connection(new_id).unwrap();
        assert_eq!(conn.handler().unwrap().protocol().recvs, 1);
        assert_eq!(conn.recv_buffer().len(), 7);
    }
}
