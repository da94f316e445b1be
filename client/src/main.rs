use clap::Parser;
use client::network::{Client, ClientConfig};
use client::state::ClientState;
use log::{error, info, warn};
use shared::utils::{get_timestamp, parse_key, parse_protocol_id};
use shared::{generate_server_info, CryptoContext, MAX_PAYLOAD_BYTES};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Key shared with the server when none is given on the command line
const DEFAULT_PRIVATE_KEY: &str =
    "606abe6ec91910ea9a6562f66f2b30e44371d62cd19927266b3c60f4b715aba1";

#[derive(Parser, Debug)]
#[command(author, version, about = "Test client for the secure connection protocol")]
struct Args {
    /// Server addresses to try, in order
    #[arg(short, long, default_value = "127.0.0.1:40000", num_args = 1..)]
    server: Vec<SocketAddr>,

    /// Protocol id, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x1122334455667788")]
    protocol_id: String,

    /// 32-byte private key as 64 hex characters, used to mint our own token
    #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
    private_key: String,

    /// Client id to put in the connect token; random if omitted
    #[arg(short, long)]
    client_id: Option<u64>,

    /// Connect token lifetime in seconds
    #[arg(short, long, default_value = "30")]
    expire: u64,

    /// Updates per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Disconnect after this many echoed payloads (0 runs until Ctrl-C)
    #[arg(short = 'n', long, default_value = "0")]
    packets: u64,
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
    let client_id = args.client_id.unwrap_or_else(rand::random);

    let mut ctx = CryptoContext::init();
    let server_info = generate_server_info(
        &mut ctx,
        &args.server,
        args.expire,
        client_id,
        protocol_id,
        get_timestamp(),
        &private_key,
    )?;
    info!("Issued connect token for client {:#018x}", client_id);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut client = Client::new(ctx, socket, ClientConfig::default())?;
    info!("Bound to {}", client.transport().local_addr()?);
    client.connect_with_server_info(&server_info, &private_key, get_timestamp())?;

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let payload: Vec<u8> = (0..MAX_PAYLOAD_BYTES).map(|i| i as u8).collect();
    let mut echoed = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.update(get_timestamp());

                if client.state() == ClientState::Connected {
                    if let Err(e) = client.send_packet(&payload) {
                        error!("Failed to send payload: {}", e);
                    }
                }

                while let Some(received) = client.receive_packet() {
                    if received != payload {
                        warn!("Echo did not match ({} bytes)", received.len());
                    }
                    echoed += 1;
                }

                if args.packets > 0 && echoed >= args.packets {
                    info!("Received {} echoes", echoed);
                    client.disconnect();
                    break;
                }
                if client.state().is_finished() {
                    info!("Connection ended: {}", client.state());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                client.disconnect();
                break;
            }
        }
    }

    client.shutdown();
    Ok(())
}
