use clap::Parser;
use reactnet::{HttpHandler, ParserLimits, ServerConfig, ServerReactor};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// HTTP/1.1 server answering /health and /echo.
#[derive(Debug, Parser)]
#[command(name = "http_server", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,
    /// Per-connection recv and send buffer size in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    buffer_size: usize,
    /// Close connections idle for this many seconds.
    #[arg(long, default_value_t = 30)]
    idle_secs: u64,
    /// Largest accepted request body in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    max_body: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = ServerConfig::default()
        .with_addr(cli.addr)
        .with_buffer_sizes(cli.buffer_size, cli.buffer_size)
        .with_idle_timeout(Duration::from_secs(cli.idle_secs));
    let limits = ParserLimits::default().with_max_body_bytes(cli.max_body);
    let mut server = ServerReactor::new(config, move |_peer| HttpHandler::new(limits))?;
    server.run()?;
    Ok(())
}
