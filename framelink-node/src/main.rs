// framelink daemon: echo server or line-oriented client over the packet
// runtime.

mod config;

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use framelink_core::{
    Connection, EndpointSettings, Packet, PacketClient, PacketHandler, PacketServer,
};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("framelink-node {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();
    info!(role = ?cfg.role, host = %cfg.endpoint.host, port = %cfg.endpoint.port, "starting");
    match cfg.role {
        config::Role::Server => run_server(cfg.endpoint),
        config::Role::Client => run_client(cfg.endpoint),
    }
}

/// Echoes every received packet back on its connection.
struct Echo;

impl PacketHandler for Echo {
    fn on_packet(&self, conn: &Connection, packet: Packet) {
        info!(peer = %conn.peer_addr(), len = packet.len(), "echoing packet");
        if let Err(e) = conn.send(packet.payload()) {
            warn!(peer = %conn.peer_addr(), error = %e, "echo send failed");
        }
    }
}

/// Prints every received packet as a line.
struct PrintLine;

impl PacketHandler for PrintLine {
    fn on_packet(&self, conn: &Connection, packet: Packet) {
        println!(
            "{} -> {}",
            conn.peer_addr(),
            String::from_utf8_lossy(packet.payload())
        );
    }
}

fn run_server(endpoint: EndpointSettings) -> anyhow::Result<()> {
    let server = PacketServer::new(
        endpoint,
        Arc::new(|_peer: SocketAddr| Arc::new(Echo) as Arc<dyn PacketHandler>),
    );
    server.start().context("start server")?;
    println!("listening; type 'quit' to stop");
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim() == "quit" {
            break;
        }
    }
    server.stop();
    Ok(())
}

fn run_client(endpoint: EndpointSettings) -> anyhow::Result<()> {
    let client = PacketClient::new(endpoint, Arc::new(PrintLine));
    client.connect().context("connect")?;
    println!("connected; each line is sent as one packet, 'quit' disconnects");
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim() == "quit" {
            break;
        }
        if let Err(e) = client.send(line.as_bytes()) {
            warn!(error = %e, "send failed; disconnecting");
            break;
        }
    }
    client.disconnect();
    Ok(())
}
