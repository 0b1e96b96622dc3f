use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Settings of a `ServerReactor`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    /// A connection with no traffic for this long is closed by the sweep after each poll.
    pub idle_timeout: Duration,
    /// Upper bound of one poller wait, i.e. how often the idle sweep runs on a quiet server.
    pub tick: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: 100,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::from_secs(30),
            tick: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }
    pub fn with_buffer_sizes(mut self, recv_buffer_size: usize, send_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self.send_buffer_size = send_buffer_size;
        self
    }
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Settings of a `ClientReactor`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Delay between losing the connection and the next connect attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound of one poller wait; reconnect deadlines are checked at this granularity.
    pub tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect_backoff: Duration::from_secs(1),
            tick: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn with_server_addr(mut self, server_addr: SocketAddr) -> Self {
        self.server_addr = server_addr;
        self
    }
    pub fn with_buffer_sizes(mut self, recv_buffer_size: usize, send_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self.send_buffer_size = send_buffer_size;
        self
    }
    pub fn with_reconnect_backoff(mut self, reconnect_backoff: Duration) -> Self {
        self.reconnect_backoff = reconnect_backoff;
        self
    }
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_defaults_and_setters() {
        let server = ServerConfig::default();
        assert_eq!(server.addr.port(), 8080);
        assert_eq!(server.backlog, 100);
        assert_eq!(server.idle_timeout, Duration::from_secs(30));
        let server = server
            .with_buffer_sizes(1024, 2048)
            .with_idle_timeout(Duration::from_millis(50));
        assert_eq!((server.recv_buffer_size, server.send_buffer_size), (1024, 2048));
        assert_eq!(server.idle_timeout, Duration::from_millis(50));

        let client = ClientConfig::default();
        assert_eq!(client.server_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(client.reconnect_backoff, Duration::from_secs(1));
        assert_eq!(client.tick, Duration::from_millis(100));
    }
}
