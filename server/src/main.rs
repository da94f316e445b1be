use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig};
use shared::utils::{get_timestamp, parse_key, parse_protocol_id};
use shared::CryptoContext;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Key shared with the token authority when none is given on the command line
const DEFAULT_PRIVATE_KEY: &str =
    "606abe6ec91910ea9a6562f66f2b30e44371d62cd19927266b3c60f4b715aba1";

#[derive(Parser, Debug)]
#[command(author, version, about = "Echo server for the secure connection protocol")]
struct Args {
    /// Address to bind the UDP socket to
    #[arg(short, long, default_value = "127.0.0.1:40000")]
    bind: SocketAddr,

    /// Address clients connect to, if different from the bind address
    #[arg(long)]
    public_address: Option<SocketAddr>,

    /// Protocol id, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x1122334455667788")]
    protocol_id: String,

    /// 32-byte private key as 64 hex characters
    #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
    private_key: String,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Updates per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let protocol_id = parse_protocol_id(&args.protocol_id)?;
    let private_key = parse_key(&args.private_key)?;
    let public_address = args.public_address.unwrap_or(args.bind);

    let socket = UdpSocket::bind(args.bind).await?;
    let config = ServerConfig::new(protocol_id, private_key, public_address, args.max_clients);
    let mut server = Server::new(CryptoContext::init(), socket, config, get_timestamp())?;
    info!(
        "Listening on {} as {}",
        server.transport().local_addr()?,
        server.config().public_address
    );
    server.start();

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                server.update(get_timestamp());
                echo_payloads(&mut server);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    server.shutdown();
    Ok(())
}

/// Sends every received payload straight back to its sender
fn echo_payloads(server: &mut Server<UdpSocket>) {
    for index in 0..server.max_clients() {
        while let Some(payload) = server.receive_packet(index) {
            if let Err(e) = server.send_packet(index, &payload) {
                error!("Failed to echo payload to slot {}: {}", index, e);
            }
        }
    }
}
