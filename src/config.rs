use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_RELAY_PORT: u16 = 5500;
pub const DEFAULT_MAX_PARTICIPANTS: usize = 8;
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY_MS: u64 = 1000;

/// Participant-side settings for one room visit.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Drop a PeerLink that has not connected within this window.
    pub negotiation_timeout: Option<Duration>,
    /// Stay in the room without a microphone when capture is denied.
    pub listen_only_fallback: bool,
    pub start_muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            listen_only_fallback: true,
            start_muted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub max_participants: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

/// How the CLI retries after losing the signaling channel. Every retry is a
/// fresh JOIN, never a resume.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(RECONNECT_DELAY_MS),
        }
    }
}
