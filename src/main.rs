//! `voice-mesh` command line.
//!
//! ```bash
//! # run the signaling relay
//! voice-mesh relay --listen 0.0.0.0:5500
//!
//! # join a room; type `m` + Enter to toggle mute, `q` to leave
//! voice-mesh join --url ws://127.0.0.1:5500 --room lobby --name Ada
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use voice_mesh::config::{
    DEFAULT_MAX_PARTICIPANTS, DEFAULT_NEGOTIATION_TIMEOUT, DEFAULT_RELAY_PORT, DEFAULT_STUN_SERVER,
};
use voice_mesh::{
    Error, ParticipantProfile, ReconnectPolicy, RelayConfig, RelayServer, RoomSession,
    RosterEntry, SessionConfig, SessionEvent, SignalingChannel, WebRtcBackend,
};

/// Full-mesh audio rooms over WebRTC
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "VOICE_MESH_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay until Ctrl-C
    Relay(RelayArgs),
    /// Join a room and talk
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address to accept WebSocket connections on
    #[arg(long, default_value_t = RelayConfig::default().listen, env = "VOICE_MESH_LISTEN")]
    listen: SocketAddr,

    /// Participants allowed per room
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_PARTICIPANTS,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
        env = "VOICE_MESH_MAX_PARTICIPANTS"
    )]
    max_participants: usize,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Relay WebSocket URL
    #[arg(long, default_value_t = format!("ws://127.0.0.1:{}", DEFAULT_RELAY_PORT), env = "VOICE_MESH_URL")]
    url: String,

    #[arg(long, env = "VOICE_MESH_ROOM")]
    room: String,

    /// Display name
    #[arg(long, env = "VOICE_MESH_NAME")]
    name: String,

    /// Profile id; random when omitted
    #[arg(long, env = "VOICE_MESH_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "VOICE_MESH_AVATAR")]
    avatar: Option<String>,

    /// STUN/TURN servers (comma-separated)
    #[arg(
        long = "ice-server",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER,
        env = "VOICE_MESH_ICE_SERVERS"
    )]
    ice_servers: Vec<String>,

    /// Join with the microphone muted
    #[arg(long)]
    muted: bool,

    /// Fail instead of joining listen-only when no microphone is available
    #[arg(long)]
    no_listen_only: bool,

    /// Seconds a peer link may take to connect; 0 disables the limit
    #[arg(long, default_value_t = DEFAULT_NEGOTIATION_TIMEOUT.as_secs(), env = "VOICE_MESH_NEGOTIATION_TIMEOUT")]
    negotiation_timeout: u64,

    /// Rejoin attempts after losing the relay
    #[arg(long, default_value_t = ReconnectPolicy::default().max_attempts, env = "VOICE_MESH_RECONNECT_ATTEMPTS")]
    reconnect_attempts: u32,
}

enum Outcome {
    Left,
    Disconnected,
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Relay(args) => run_relay(args).await,
        Command::Join(args) => run_join(args).await,
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let config = RelayConfig {
        listen: args.listen,
        max_participants: args.max_participants,
    };
    let server = RelayServer::bind(&config).await?;
    info!(
        addr = %server.local_addr()?,
        max_participants = config.max_participants,
        "relay ready"
    );
    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn run_join(args: JoinArgs) -> Result<()> {
    let backend = Arc::new(WebRtcBackend::new(args.ice_servers.clone())?);
    let profile = ParticipantProfile {
        id: args
            .user_id
            .clone()
            .unwrap_or_else(|| format!("user-{:08x}", rand::random::<u32>())),
        name: args.name.clone(),
        avatar: args.avatar.clone(),
    };
    let config = SessionConfig {
        ice_servers: args.ice_servers.clone(),
        negotiation_timeout: (args.negotiation_timeout > 0)
            .then(|| Duration::from_secs(args.negotiation_timeout)),
        listen_only_fallback: !args.no_listen_only,
        start_muted: args.muted,
    };
    let policy = ReconnectPolicy {
        max_attempts: args.reconnect_attempts,
        ..ReconnectPolicy::default()
    };

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut muted = config.start_muted;
    let mut attempts = 0;

    loop {
        match SignalingChannel::connect(&args.url).await {
            Ok(channel) => {
                let session_config = SessionConfig {
                    start_muted: muted,
                    ..config.clone()
                };
                let (session, events) = RoomSession::join(
                    Arc::clone(&backend),
                    channel,
                    args.room.clone(),
                    profile.clone(),
                    session_config,
                )
                .await?;
                attempts = 0;
                info!(room = %args.room, user = %profile.id, "in the room; m toggles mute, q leaves");

                if let Outcome::Left = drive(session, events, &mut input, &mut muted).await? {
                    return Ok(());
                }
                warn!("lost the relay");
            }
            Err(e) => warn!(url = %args.url, "could not reach relay: {}", e),
        }

        // every retry is a fresh join
        attempts += 1;
        if attempts > policy.max_attempts {
            bail!("Max reconnection attempts reached");
        }
        info!(attempt = attempts, max = policy.max_attempts, "reconnecting");
        sleep(policy.delay).await;
    }
}

async fn drive(
    session: RoomSession,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    input: &mut Input,
    muted: &mut bool,
) -> Result<Outcome> {
    let mut roster = session.roster();
    let mut roster_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            changed = roster.changed(), if roster_open => match changed {
                Ok(()) => show_roster(&roster.borrow_and_update()),
                Err(_) => roster_open = false,
            },
            line = input.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        let next = !*muted;
                        match session.set_muted(next).await {
                            Ok(()) => *muted = next,
                            Err(e) => warn!("could not change mute: {}", e),
                        }
                    }
                    "q" => return leave(session).await,
                    "" => {}
                    other => info!("unknown command {:?}; m toggles mute, q leaves", other),
                },
                Ok(None) => return leave(session).await,
                Err(e) => {
                    warn!("stdin failed: {}", e);
                    return leave(session).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return leave(session).await;
            }
        }
    }

    match session.finished().await {
        Ok(()) => Ok(Outcome::Left),
        Err(Error::ChannelDisconnected) => Ok(Outcome::Disconnected),
        Err(e) => Err(e.into()),
    }
}

async fn leave(session: RoomSession) -> Result<Outcome> {
    if let Err(e) = session.leave().await {
        warn!("leave did not complete cleanly: {}", e);
    }
    Ok(Outcome::Left)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ListenOnly { reason } => warn!("listen-only: {}", reason),
        SessionEvent::RelayError { message } => warn!("relay error: {}", message),
        SessionEvent::CandidateRejected { peer_id, reason }
        | SessionEvent::SinkFailed { peer_id, reason } => {
            warn!(%peer_id, event = event.name(), "{}", reason)
        }
        SessionEvent::PeerRemoved {
            peer_id,
            user_id,
            reason,
        } => info!(%peer_id, %user_id, ?reason, "peer removed"),
        other => info!(event = other.name(), "{:?}", other),
    }
}

fn show_roster(entries: &[RosterEntry]) {
    let members: Vec<String> = entries
        .iter()
        .map(|entry| {
            let mut label = entry.user.name.clone();
            if entry.is_local {
                label.push_str(" (you)");
            }
            if let Some(link) = entry.link {
                label.push_str(&format!(" [{}]", link));
            }
            if entry.muted {
                label.push_str(" [muted]");
            }
            label
        })
        .collect();
    info!(count = entries.len(), "room: {}", members.join(", "));
}
