use crate::framer::MessageFramer;
use crate::http::{HttpParser, HttpRequest, HttpResponse, ParserLimits};
use crate::server::Connection;
use tracing::{debug, warn};

/// Per-connection application logic of a `ServerReactor`.
///
/// Callbacks run on the reactor thread with the connection's session, which they may use to read
/// the recv buffer, queue replies or close the connection.
pub trait Protocol: Sized {
    /// New bytes are waiting in `conn.recv_buffer_mut()`.
    fn on_recv(&mut self, conn: &mut Connection<Self>);
    /// `sent` queued bytes reached the socket.
    fn on_send(&mut self, _conn: &mut Connection<Self>, _sent: usize) {}
    fn on_close(&mut self, _conn: &Connection<Self>) {}
}

fn queue_or_close<P>(conn: &mut Connection<P>, bytes: &[u8]) -> bool
where
    P: Protocol,
{
    match conn.queue_send(bytes) {
        Ok(()) => true,
        Err(err) => {
            warn!(fd = conn.fd(), error = %err, "reply does not fit, closing");
            conn.close();
            false
        }
    }
}

//====================================================================================
//            HTTP
//====================================================================================

/// HTTP/1.1 endpoint with a fixed route table:
/// - `GET /health` -> 200 `ok`
/// - `POST /echo` -> 200 with the request body
/// - `GET /echo?msg=X` -> 200 `X`
/// - anything else -> 404
///
/// A malformed request gets a 400 and the connection is closed once it is flushed,
/// the same as a request carrying `Connection: close`.
pub struct HttpHandler {
    parser: HttpParser,
    close_after_send: bool,
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

impl HttpHandler {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            parser: HttpParser::new(limits),
            close_after_send: false,
        }
    }

    pub fn route(req: HttpRequest) -> HttpResponse {
        let method = req.method.as_str();
        let target = req.target.as_str();
        let mut resp = HttpResponse::new(200);
        if method == "GET" && target == "/health" {
            resp.set_text_body("ok");
        } else if method == "POST" && target == "/echo" {
            resp.set_header("Content-Type", "application/octet-stream")
                .set_body(req.body);
        } else if let (Some(msg), "GET") = (target.strip_prefix("/echo?msg="), method) {
            resp.set_text_body(msg);
        } else {
            resp = HttpResponse::new(404);
            resp.set_text_body("not found");
        }
        resp
    }

    fn flush_and_close(&mut self, conn: &mut Connection<Self>) {
        self.close_after_send = true;
        if !conn.has_pending_send() {
            conn.close();
        }
    }
}

impl Protocol for HttpHandler {
    fn on_recv(&mut self, conn: &mut Connection<Self>) {
        if self.close_after_send {
            return; // closing; ignore anything pipelined behind the last request
        }
        loop {
            let req = match self.parser.try_parse(conn.recv_buffer_mut()) {
                Ok(Some(req)) => req,
                Ok(None) => return,
                Err(err) => {
                    debug!(fd = conn.fd(), error = %err, "bad request");
                    let mut resp = HttpResponse::new(400);
                    resp.set_text_body("bad request");
                    if queue_or_close(conn, &resp.to_bytes(false)) {
                        self.flush_and_close(conn);
                    }
                    return;
                }
            };
            let keep_alive = !req.wants_close();
            debug!(fd = conn.fd(), method = %req.method, target = %req.target, "request");
            let resp = Self::route(req);
            if !queue_or_close(conn, &resp.to_bytes(keep_alive)) {
                return;
            }
            if !keep_alive {
                self.flush_and_close(conn);
                return;
            }
        }
    }

    fn on_send(&mut self, conn: &mut Connection<Self>, _sent: usize) {
        if self.close_after_send && !conn.has_pending_send() {
            conn.close();
        }
    }
}

//====================================================================================
//            Raw echo
//====================================================================================

/// Echoes every received byte. When the send buffer is full the rest stays in the recv buffer
/// and is picked up again as the send buffer drains.
#[derive(Default)]
pub struct EchoHandler {
    echoed: usize,
}

impl EchoHandler {
    /// Bytes echoed so far.
    pub fn echoed(&self) -> usize {
        self.echoed
    }

    fn pump(&mut self, conn: &mut Connection<Self>) {
        let mut chunk = [0u8; 4096];
        while conn.is_open() {
            let room = conn.send_buffer().free_space().min(chunk.len());
            if room == 0 {
                return;
            }
            let Ok(n) = conn.recv_buffer_mut().read(&mut chunk[..room]) else {
                return; // drained
            };
            if !queue_or_close(conn, &chunk[..n]) {
                return;
            }
            self.echoed += n;
        }
    }
}

impl Protocol for EchoHandler {
    fn on_recv(&mut self, conn: &mut Connection<Self>) {
        self.pump(conn);
    }
    fn on_send(&mut self, conn: &mut Connection<Self>, _sent: usize) {
        self.pump(conn);
    }
}

//====================================================================================
//            Frame echo
//====================================================================================

/// Sends every length-prefixed frame back unchanged. A frame declaring more than
/// `framer::MAX_PAYLOAD` bytes closes the connection.
#[derive(Default)]
pub struct FrameEchoHandler {
    frames: usize,
}

impl FrameEchoHandler {
    /// Frames echoed so far.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl Protocol for FrameEchoHandler {
    fn on_recv(&mut self, conn: &mut Connection<Self>) {
        loop {
            match MessageFramer::pop_frame(conn.recv_buffer_mut()) {
                Ok(Some(frame)) => {
                    if let Err(err) = conn.send_frame(&frame.payload) {
                        warn!(fd = conn.fd(), error = %err, "failed to echo frame, closing");
                        conn.close();
                        return;
                    }
                    self.frames += 1;
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(fd = conn.fd(), error = %err, "bad frame, closing");
                    conn.close();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(method: &str, target: &str, body: &[u8]) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            body: body.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    pub fn test_routes() {
        let resp = HttpHandler::route(request("GET", "/health", b""));
        assert_eq!((resp.status, resp.body.as_slice()), (200, b"ok".as_slice()));

        let resp = HttpHandler::route(request("POST", "/echo", b"\x00\x01payload"));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"\x00\x01payload");
        assert!(resp
            .headers
            .contains(&("Content-Type".into(), "application/octet-stream".into())));

        let resp = HttpHandler::route(request("GET", "/echo?msg=hi", b""));
        assert_eq!((resp.status, resp.body.as_slice()), (200, b"hi".as_slice()));

        for (method, target) in [("GET", "/nope"), ("POST", "/health"), ("PUT", "/echo")] {
            let resp = HttpHandler::route(request(method, target, b""));
            assert_eq!(resp.status, 404);
            assert_eq!(resp.reason, "Not Found");
        }
    }
}
