use clap::Parser;
use clap_derive::Parser;
use oscbridge::bridge::{Bridge, BridgeCommand};
use oscbridge::config::BridgeConfig;
use oscbridge::udp::UdpEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, Level};

#[derive(Parser)]
struct Args {
    /// address:port the TCP listener binds to (peers connect here)
    tcp_listen_addr: String,

    /// address:port the UDP socket binds to (the controller sends commands here)
    udp_listen_addr: String,

    /// address:port all peer messages are forwarded to
    controller_addr: String,

    #[clap(long, default_value = "/tcp")]
    route_path: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let tcp_listen_addr: SocketAddr = args.tcp_listen_addr.parse()?;
    let udp_listen_addr: SocketAddr = args.udp_listen_addr.parse()?;
    let controller_addr: SocketAddr = args.controller_addr.parse()?;

    let mut config = BridgeConfig::new(tcp_listen_addr, udp_listen_addr, controller_addr);
    config.route_path = args.route_path;

    let endpoint = Arc::new(UdpEndpoint::bind(&config).await?);
    let bridge = Bridge::bind(&config, endpoint.clone()).await?;

    let (tx, rx) = mpsc::channel(64);

    let recv_endpoint = endpoint.clone();
    let recv_tx = tx.clone();
    tokio::spawn(async move { recv_endpoint.recv_loop(recv_tx).await });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("caught ctrl-c, shutting down");
                let _ = tx.send(BridgeCommand::Shutdown).await;
            }
            Err(e) => error!("listening for ctrl-c failed: {}", e),
        }
    });

    bridge.run(rx).await;
    Ok(())
}
