use clap::Parser;
use client::config::Config;
use client::discovery::{DiscoveryService, DiscoveryState};
use client::monitor::LivenessMonitor;
use client::session::{Session, SessionEvent};
use log::info;
use shared::{Envelope, GENERAL_CHAT};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Username to join the chat with
    username: String,

    /// Pin the server address instead of discovering it (host:port)
    #[arg(short = 's', long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let username = args.username.trim().to_string();
    if username.is_empty() {
        return Err("username must not be blank".into());
    }

    let shutdown = CancellationToken::new();
    let discovery = Arc::new(DiscoveryService::new(Config::from_env()));
    if let Some(address) = &args.server {
        let (host, port) = parse_address(address)?;
        discovery.set_manual_override(host, port);
    }
    let _discovery_task = discovery.clone().spawn(shutdown.clone());

    let monitor = Arc::new(LivenessMonitor::new(discovery.clone()));
    let _monitor_task = monitor.clone().spawn(shutdown.clone());

    info!("Starting client...");
    info!("Commands: /msg <user> <text>, /avatar <name>, /invite <user>, /status, /quit");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    // Let discovery settle before dialing; Ctrl-C aborts the wait.
    let resolved = tokio::select! {
        addr = wait_for_server(&discovery) => Some(addr),
        _ = &mut interrupt => None,
    };
    let Some((host, port)) = resolved else {
        shutdown.cancel();
        return Ok(());
    };

    info!("Connecting to {}:{} as '{}'", host, port, username);
    let mut session = Session::connect(&host, port, &username).await?;
    println!("Connected. Type a message, or /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(SessionEvent::Message(envelope)) => print_envelope(&envelope),
                Some(SessionEvent::Disconnected) | None => {
                    println!("Connection to the server was lost.");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&line, &session, &discovery, &monitor) {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut interrupt => break,
        }
    }

    shutdown.cancel();
    Ok(())
}

/// Polls until discovery settles on an address.
async fn wait_for_server(discovery: &DiscoveryService) -> (String, u16) {
    let mut announced = None;
    loop {
        let state = discovery.state();
        if announced != Some(state) {
            match state {
                DiscoveryState::Searching => {
                    info!("Searching for a server on the local network...")
                }
                DiscoveryState::FailedFallback => info!("No server answered, assuming localhost"),
                _ => {}
            }
            announced = Some(state);
        }
        if let Some(addr) = discovery.server_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Executes one line of user input. Returns false when the client should
/// exit, either on /quit or once the session queue is gone.
fn handle_line(
    line: &str,
    session: &Session,
    discovery: &DiscoveryService,
    monitor: &LivenessMonitor,
) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return session.send(Envelope::Chat {
            sender: session.username().to_string(),
            recipient: GENERAL_CHAT.to_string(),
            text: line.to_string(),
        });
    };

    let (command, args) = match rest.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };

    match command {
        "quit" => false,
        "status" => {
            let server = match discovery.server_addr() {
                Some((host, port)) => format!("{}:{}", host, port),
                None => "unresolved".to_string(),
            };
            let link = if monitor.is_online() {
                "online"
            } else {
                "offline"
            };
            println!(
                "Discovery: {:?}, server {}, connection {}",
                discovery.state(),
                server,
                link
            );
            true
        }
        "avatar" => {
            if args.is_empty() {
                println!("Usage: /avatar <name>");
                true
            } else {
                session.send(Envelope::SetAvatar {
                    avatar: args.to_string(),
                })
            }
        }
        "invite" => {
            if args.is_empty() {
                println!("Usage: /invite <user>");
                true
            } else {
                session.send(Envelope::GameInvite {
                    opponent: args.to_string(),
                })
            }
        }
        "msg" => match args.split_once(' ') {
            Some((recipient, text)) if !text.trim().is_empty() => session.send(Envelope::Chat {
                sender: session.username().to_string(),
                recipient: recipient.to_string(),
                text: text.trim().to_string(),
            }),
            _ => {
                println!("Usage: /msg <user> <text>");
                true
            }
        },
        other => {
            println!("Unknown command '/{}'", other);
            true
        }
    }
}

/// Renders one inbound envelope for the terminal.
fn print_envelope(envelope: &Envelope) {
    match envelope {
        Envelope::Chat {
            sender,
            recipient,
            text,
        } if recipient == GENERAL_CHAT => println!("[general] {}: {}", sender, text),
        Envelope::Chat { sender, text, .. } => println!("[private] {}: {}", sender, text),
        Envelope::System { text, .. } => println!("* {}", text),
        Envelope::Userlist { users } => println!("Online now: {}", users.join(", ")),
        Envelope::Avatar { username, avatar } => println!("{} now appears as {}", username, avatar),
        Envelope::AvatarError {} => println!("The server rejected that avatar name."),
        other => info!("Game event: {:?}", other),
    }
}

/// Splits a `host:port` flag value.
fn parse_address(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid server address '{}', expected host:port", value))?;
    if host.is_empty() {
        return Err(format!(
            "invalid server address '{}', expected host:port",
            value
        ));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in server address '{}'", value))?;
    Ok((host.to_string(), port))
}
