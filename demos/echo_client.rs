use clap::Parser;
use reactnet::{ClientConfig, ClientHandler, ClientReactor, ClientSession, MessageFramer};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sends `count` frames to an echo server, one at a time, and reports the round-trip latency.
#[derive(Debug, Parser)]
#[command(name = "echo_client", version, about)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:3000")]
    server: SocketAddr,
    #[arg(long, default_value = "hello")]
    message: String,
    #[arg(long, default_value_t = 1000)]
    count: usize,
    /// Seconds to wait before reconnecting after the connection drops.
    #[arg(long, default_value_t = 1)]
    backoff_secs: u64,
}

struct PingPong {
    message: Vec<u8>,
    remaining: usize,
    sent_at: Instant,
    total: Duration,
    received: usize,
}

impl PingPong {
    fn send_next(&mut self, session: &mut ClientSession<Self>) {
        if self.remaining == 0 {
            return;
        }
        self.sent_at = Instant::now();
        if let Err(err) = session.send_frame(&self.message) {
            warn!(error = %err, "send failed");
            session.close();
        }
    }
}

impl ClientHandler for PingPong {
    fn on_connected(&mut self, session: &mut ClientSession<Self>) {
        info!(remaining = self.remaining, "connected");
        self.send_next(session);
    }

    fn on_recv(&mut self, session: &mut ClientSession<Self>) {
        while let Ok(Some(frame)) = MessageFramer::pop_frame(session.recv_buffer_mut()) {
            if frame.payload != self.message {
                warn!(len = frame.payload.len(), "unexpected echo");
            }
            self.total += self.sent_at.elapsed();
            self.received += 1;
            self.remaining = self.remaining.saturating_sub(1);
            self.send_next(session);
        }
    }

    fn on_close(&mut self, _session: &ClientSession<Self>) {
        info!(received = self.received, "disconnected");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = ClientConfig::default()
        .with_server_addr(cli.server)
        .with_reconnect_backoff(Duration::from_secs(cli.backoff_secs));
    let app = PingPong {
        message: cli.message.into_bytes(),
        remaining: cli.count,
        sent_at: Instant::now(),
        total: Duration::ZERO,
        received: 0,
    };
    let mut client = ClientReactor::new(config, app)?;
    client.start()?;
    while client.is_running() && client.app().is_some_and(|app| app.remaining > 0) {
        client.process_events()?;
    }
    client.stop();
    if let Some(app) = client.app() {
        let avg = app.total.checked_div(app.received as u32).unwrap_or_default();
        println!("received {} echoes, average round trip {:?}", app.received, avg);
    }
    Ok(())
}
