use crate::config::ClientConfig;
use crate::error::Error;
use crate::session::{Session, SessionError, SessionHandler};
use crate::socket::{ConnectStatus, Socket};
use crate::utils::Timer;
use polling::{Event, Events, PollMode, Poller};
use std::io::ErrorKind;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// The only source a client poller ever holds.
const CLIENT_KEY: usize = 0;

/// Application side of a `ClientReactor`. It survives reconnects: the same value is handed to
/// every new session.
pub trait ClientHandler: Sized {
    /// The connection is established (first connect or any reconnect).
    fn on_connected(&mut self, _session: &mut ClientSession<Self>) {}
    /// New bytes are waiting in `session.recv_buffer_mut()`.
    fn on_recv(&mut self, session: &mut ClientSession<Self>);
    fn on_send(&mut self, _session: &mut ClientSession<Self>, _sent: usize) {}
    fn on_close(&mut self, _session: &ClientSession<Self>) {}
}

/// Session handler of the client connection. Write interest is only pushed to the poller once
/// the connect has completed; until then the socket stays registered for both directions.
pub struct ClientLink<A> {
    app: A,
    poller: Rc<Poller>,
    connecting: bool,
}

impl<A> ClientLink<A> {
    pub fn app(&self) -> &A {
        &self.app
    }
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }
}

pub type ClientSession<A> = Session<ClientLink<A>>;

impl<A: ClientHandler> SessionHandler for ClientLink<A> {
    fn on_recv(&mut self, session: &mut ClientSession<A>) {
        self.app.on_recv(session);
    }
    fn on_send(&mut self, session: &mut ClientSession<A>, sent: usize) {
        self.app.on_send(session, sent);
    }
    fn on_close(&mut self, session: &ClientSession<A>) {
        self.app.on_close(session);
    }
    fn on_write_interest_changed(&mut self, session: &ClientSession<A>, enabled: bool) {
        if self.connecting {
            return; // re-registered when the connect completes
        }
        if let Err(err) = self.poller.modify_with_mode(
            session.socket(),
            interest(false, enabled),
            PollMode::Level,
        ) {
            warn!(error = %err, "failed to update write interest");
        }
    }
}

/// Read readiness always; write readiness while connecting or while sends are pending.
fn interest(connecting: bool, want_send: bool) -> Event {
    if connecting || want_send {
        Event::all(CLIENT_KEY)
    } else {
        Event::readable(CLIENT_KEY)
    }
}

/// `ClientReactor` keeps one connection to `ClientConfig::server_addr` alive.
///
/// The connect is non-blocking; its completion is detected on the first writable event. Once
/// established, a lost connection (error, hangup, peer close) is torn down and retried after
/// `reconnect_backoff`, for as long as the reactor runs. A connect rejected by the server
/// (`SO_ERROR` on completion) stops the reactor instead.
pub struct ClientReactor<A> {
    config: ClientConfig,
    poller: Rc<Poller>,
    events: Events,
    session: Option<ClientSession<A>>,
    parked: Option<A>, // the app while there is no session
    reconnect: Option<Timer>,
    running: bool,
}

impl<A: ClientHandler> ClientReactor<A> {
    pub fn new(config: ClientConfig, app: A) -> Result<Self, Error> {
        Ok(Self {
            config,
            poller: Rc::new(Poller::new()?),
            events: Events::new(),
            session: None,
            parked: Some(app),
            reconnect: None,
            running: false,
        })
    }

    /// Issue the first connect. Fails if the connect is refused right away.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.running || self.session.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.connect()?;
        self.running = true;
        Ok(())
    }

    /// `start` if needed, then process events until `stop` (or a rejected connect).
    pub fn run(&mut self) -> Result<(), Error> {
        if !self.running {
            self.start()?;
        }
        while self.running {
            self.process_events()?;
        }
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn stop(&mut self) {
        self.running = false;
        self.reconnect = None;
        self.teardown();
    }

    /// One cycle: wait up to `tick`, dispatch, then handle a lost connection or a due reconnect.
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
        let ready: Vec<Event> = self.events.iter().collect();
        for ev in &ready {
            if ev.key == CLIENT_KEY {
                self.dispatch(ev);
            }
        }

        if self.session.as_ref().is_some_and(|session| !session.is_open()) {
            self.teardown();
            if self.running {
                self.schedule_reconnect();
            }
        }
        if self.running && self.reconnect.as_ref().is_some_and(Timer::expired) {
            self.reconnect = None;
            if let Err(err) = self.connect() {
                warn!(addr = %self.config.server_addr, error = %err, "reconnect failed");
                self.schedule_reconnect();
            }
        }
        Ok(ready.len())
    }

    /// Queue raw bytes. Allowed while the connect is still in progress.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.session
            .as_mut()
            .ok_or(SessionError::NotOpen)?
            .queue_send(data)
    }

    /// Queue one length-prefixed frame.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        self.session
            .as_mut()
            .ok_or(SessionError::NotOpen)?
            .send_frame(payload)
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|session| {
            session.is_open() && session.handler().is_some_and(|link| !link.connecting)
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn session(&self) -> Option<&ClientSession<A>> {
        self.session.as_ref()
    }

    pub fn app(&self) -> Option<&A> {
        match &self.session {
            Some(session) => session.handler().map(ClientLink::app),
            None => self.parked.as_ref(),
        }
    }

    pub fn app_mut(&mut self) -> Option<&mut A> {
        match &mut self.session {
            Some(session) => session.handler_mut().map(ClientLink::app_mut),
            None => self.parked.as_mut(),
        }
    }

    //----------------------------- private -----------------------------------------------

    fn connect(&mut self) -> Result<(), Error> {
        if self.parked.is_none() {
            return Err(Error::Session(SessionError::InternalError));
        }
        let addr = self.config.server_addr;
        let (socket, status) = Socket::connect(addr, true)?;
        let connecting = status == ConnectStatus::InProgress;
        let poller = Rc::new(Poller::new()?);
        // SAFETY: `teardown` deletes the socket from the poller before the session is dropped.
        unsafe {
            poller.add_with_mode(&socket, interest(connecting, false), PollMode::Level)?;
        }
        let Some(app) = self.parked.take() else {
            return Err(Error::Session(SessionError::InternalError));
        };
        let link = ClientLink {
            app,
            poller: Rc::clone(&poller),
            connecting,
        };
        let mut session = Session::new(
            socket,
            self.config.recv_buffer_size,
            self.config.send_buffer_size,
            link,
        );
        if let Err(err) = session.open() {
            let _ = poller.delete(session.socket());
            self.parked = session.into_handler().map(|link| link.app);
            return Err(err.into());
        }
        self.poller = poller;
        self.session = Some(session);
        if connecting {
            debug!(%addr, "connect in progress");
        } else {
            self.on_connect_completed();
        }
        Ok(())
    }

    fn dispatch(&mut self, ev: &Event) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_open() {
            return;
        }
        if ev.is_err().unwrap_or(false) {
            warn!(addr = %self.config.server_addr, "connection error");
            session.close();
            return;
        }
        if ev.is_interrupt() {
            if ev.readable && session.handler().is_some_and(|link| !link.connecting) {
                match session.on_readable() {
                    Ok(()) | Err(SessionError::PeerClosed) => {}
                    Err(err) => warn!(error = %err, "read on hangup failed"),
                }
            }
            info!(addr = %self.config.server_addr, "connection hung up");
            session.close();
            return;
        }

        if session.handler().is_some_and(|link| link.connecting) {
            if !ev.writable {
                return;
            }
            match session.socket().take_error() {
                Ok(None) => self.on_connect_completed(),
                Ok(Some(err)) | Err(err) => {
                    warn!(addr = %self.config.server_addr, error = %err, "connect failed");
                    session.close();
                    self.running = false;
                    return;
                }
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if ev.readable && session.is_open() {
            match session.on_readable() {
                Ok(()) => {}
                Err(SessionError::PeerClosed) => info!("server closed the connection"),
                Err(err) => warn!(error = %err, "read failed"),
            }
        }
        if ev.writable && session.is_open() {
            if let Err(err) = session.on_writable() {
                warn!(error = %err, "write failed");
            }
        }
    }

    fn on_connect_completed(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(link) = session.handler_mut() {
            link.connecting = false;
        }
        let registration = interest(false, session.has_pending_send());
        if let Err(err) = self
            .poller
            .modify_with_mode(session.socket(), registration, PollMode::Level)
        {
            warn!(error = %err, "failed to update interest");
        }
        info!(addr = %self.config.server_addr, fd = session.fd(), "connected");
        session.with_handler(|link, session| link.app.on_connected(session));
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            if let Err(err) = self.poller.delete(session.socket()) {
                debug!(error = %err, "failed to deregister socket");
            }
            self.parked = session.into_handler().map(|link| link.app);
        }
    }

    fn schedule_reconnect(&mut self) {
        info!(
            addr = %self.config.server_addr,
            backoff = ?self.config.reconnect_backoff,
            "reconnect scheduled"
        );
        self.reconnect = Some(Timer::new(self.config.reconnect_backoff));
    }
}

impl<A> Drop for ClientReactor<A> {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            let _ = self.poller.delete(session.socket());
        }
    }
}
