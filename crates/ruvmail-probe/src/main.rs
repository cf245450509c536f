mod events;
mod listen;
mod ping;

use clap::{Parser, Subcommand};
use ruvmail_transport::{parse_peer_entry, Identity, PeerId, RuvNode, RuvNodeConfig};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "ruvmail-probe", about = "Connectivity probe for the ruvmail transport")]
struct Cli {
    /// Local UDP address to bind (overrides RUVMAIL_BIND_ADDR).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Known peer as hex@host:port. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Hex-encoded 32-byte secret key. A fresh identity is generated if absent.
    #[arg(long)]
    secret_hex: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Echo every inbound stream back to its sender.
    Listen,

    /// Open one stream per ping to a peer and time the echo.
    Ping {
        /// Target peer identity (hex).
        #[arg(long)]
        connect: String,
        /// Number of pings.
        #[arg(long, default_value = "10")]
        count: u32,
        /// Delay between pings in ms.
        #[arg(long, default_value = "1000")]
        delay: u64,
        /// Payload size in bytes.
        #[arg(long, default_value = "64")]
        size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    let mut config = RuvNodeConfig::new();
    if let Some(bind) = cli.bind {
        config = config.bind_addr(bind);
    }
    for entry in &cli.peers {
        let (id, addr) = parse_peer_entry(entry)?;
        config = config.peer(id, addr);
    }

    let identity = match &cli.secret_hex {
        Some(secret) => Identity::from_secret_hex(secret)?,
        None => Identity::generate(),
    };
    let node = RuvNode::bind(identity, config)?;

    eprintln!("ruvmail-probe v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Peer ID: {}", node.id());
    eprintln!("Socket:  {}", node.local_socket_addr()?);
    eprintln!();

    match cli.command {
        Command::Listen => listen::run(node, start).await?,
        Command::Ping {
            connect,
            count,
            delay,
            size,
        } => {
            let target: PeerId = connect
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid peer id '{connect}': {e}"))?;
            ping::run(
                node,
                ping::PingConfig {
                    target,
                    count,
                    delay_ms: delay,
                    payload_size: size,
                },
                start,
            )
            .await?;
        }
    }

    Ok(())
}
