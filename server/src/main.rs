use clap::Parser;
use log::{error, info};
use server::acceptor::{self, Acceptor};
use server::avatars::DirAvatars;
use server::beacon::Beacon;
use server::ports;
use server::registry::Registry;
use server::router::Router;
use shared::{DEFAULT_DISCOVERY_PORT, DEFAULT_SERVER_PORT, DISCOVERY_INTERVAL_SECS};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Main-method of the application.
/// Parses command-line arguments, resolves ports, then runs the acceptor
/// and the discovery beacon until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to bind the chat listener to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Preferred chat port
        #[clap(short, long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
        /// Preferred UDP discovery port
        #[clap(short, long, default_value_t = DEFAULT_DISCOVERY_PORT)]
        discovery_port: u16,
        /// Fail instead of scanning upward when the chat port is taken
        #[clap(long)]
        no_port_fallback: bool,
        /// Fail instead of scanning upward when the discovery port is taken
        #[clap(long)]
        no_discovery_fallback: bool,
        /// Address the beacon broadcasts to
        #[clap(long, default_value = "255.255.255.255")]
        broadcast_addr: IpAddr,
        /// Seconds between presence broadcasts
        #[clap(long, default_value_t = DISCOVERY_INTERVAL_SECS)]
        beacon_interval: u64,
        /// Directory holding the avatar images
        #[clap(long, default_value = "assets/avatars")]
        avatar_dir: String,
    }

    // Parse command line arguments
    let args = Args::parse();

    // Resolve ports, falling back to nearby ones unless told not to
    let chat_port = ports::find_available_port(&args.host, args.port, !args.no_port_fallback)
        .ok_or_else(|| format!("no available chat port starting from {}", args.port))?;
    let discovery_port =
        ports::find_available_discovery_port(args.discovery_port, !args.no_discovery_fallback)
            .ok_or_else(|| {
                format!(
                    "no available discovery port starting from {}",
                    args.discovery_port
                )
            })?;

    // Wire the components together
    let registry = Arc::new(Registry::new());
    let avatars = Arc::new(DirAvatars::new(&args.avatar_dir));
    let router = Arc::new(Router::new(Arc::clone(&registry), avatars.clone()));
    let acceptor = Arc::new(Acceptor::new(registry, router, avatars));

    let listener = acceptor::bind(&args.host, chat_port).await?;
    let beacon = Beacon::new(
        args.broadcast_addr,
        discovery_port,
        chat_port,
        Duration::from_secs(args.beacon_interval),
    );

    let shutdown = CancellationToken::new();

    // Spawn the accept loop
    let acceptor_handle = tokio::spawn(acceptor.run(listener, shutdown.clone()));

    // Spawn the presence beacon
    let beacon_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = beacon.run(shutdown).await {
                error!("Discovery beacon failed: {}", e);
            }
        })
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = acceptor_handle => {
            if let Err(e) = result {
                error!("Acceptor task panicked: {}", e);
            }
        }
        result = beacon_handle => {
            if let Err(e) = result {
                error!("Beacon task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
        }
    }

    Ok(())
}
