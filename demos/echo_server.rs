use clap::Parser;
use reactnet::{EchoHandler, FrameEchoHandler, ServerConfig, ServerReactor};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Echo server: sends every length-prefixed frame back, or every raw byte with `--raw`.
#[derive(Debug, Parser)]
#[command(name = "echo_server", version, about)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:3000")]
    addr: SocketAddr,
    /// Echo raw bytes instead of frames.
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = ServerConfig::default().with_addr(cli.addr);
    if cli.raw {
        ServerReactor::new(config, |_peer| EchoHandler::default())?.run()?;
    } else {
        ServerReactor::new(config, |_peer| FrameEchoHandler::default())?.run()?;
    }
    Ok(())
}
