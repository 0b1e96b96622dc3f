//! # Single-threaded readiness-driven TCP engine.
//!
//! Supported platforms: Linux (and other Unix systems supported by `polling`).
//!
//! reactnet multiplexes one listening socket and many peer connections on one thread. Each connection is a
//! [`Session`]: a non-blocking socket plus a recv and a send ring buffer. Two wire protocols are built on top:
//! - [`MessageFramer`]: `[u32 big-endian length][payload]` frames, up to 1 MiB.
//! - [`HttpParser`]: incremental HTTP/1.x request parser tolerating any fragmentation.
//!
//! There are two reactors:
//! - [`ServerReactor`] accepts connections and gives each one its own [`Protocol`] instance
//!   ([`HttpHandler`], [`EchoHandler`], [`FrameEchoHandler`] or your own). Idle connections are evicted.
//! - [`ClientReactor`] keeps one outbound connection alive, reconnecting after a backoff.
//!
//! Sends are never written straight to the socket. They are queued into the session's send buffer and
//! flushed on write readiness; the reactors only register write interest while the send buffer is non-empty.
//!
//! ## Examples
//!
//! ### HTTP server
//!
//! ```rust,no_run
//! use reactnet::{HttpHandler, ServerConfig, ServerReactor};
//!
//! let config = ServerConfig::default().with_addr("127.0.0.1:8080".parse().unwrap());
//! let mut server = ServerReactor::new(config, |_peer| HttpHandler::default()).unwrap();
//! server.run().unwrap();
//! ```
//!
//! ### Frame client
//!
//! ```rust,no_run
//! use reactnet::{ClientConfig, ClientHandler, ClientReactor, ClientSession, MessageFramer};
//!
//! struct Printer;
//! impl ClientHandler for Printer {
//!     fn on_connected(&mut self, session: &mut ClientSession<Self>) {
//!         session.send_frame(b"hello").unwrap();
//!     }
//!     fn on_recv(&mut self, session: &mut ClientSession<Self>) {
//!         while let Ok(Some(frame)) = MessageFramer::pop_frame(session.recv_buffer_mut()) {
//!             println!("{}", String::from_utf8_lossy(&frame.payload));
//!         }
//!     }
//! }
//!
//! let config = ClientConfig::default().with_server_addr("127.0.0.1:3000".parse().unwrap());
//! let mut client = ClientReactor::new(config, Printer).unwrap();
//! client.run().unwrap();
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod flat_storage;
pub mod framer;
pub mod http;
pub mod listener;
pub mod protocol;
pub mod ring_buffer;
pub mod server;
pub mod session;
pub mod socket;
pub mod utils;

pub use buffer::{BufferError, RecvBuffer, SendBuffer};
pub use client::{ClientHandler, ClientReactor, ClientSession};
pub use config::{ClientConfig, ServerConfig};
pub use error::Error;
pub use framer::{Frame, FrameError, MessageFramer};
pub use http::{HttpParseError, HttpParser, HttpRequest, HttpResponse, ParserLimits};
pub use protocol::{EchoHandler, FrameEchoHandler, HttpHandler, Protocol};
pub use ring_buffer::RingBuffer;
pub use server::{ConnId, Connection, ServerReactor};
pub use session::{Session, SessionError, SessionHandler, SessionState};
pub use socket::{Socket, SocketError, Transfer, Transport};
