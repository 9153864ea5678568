//! Full-mesh WebRTC audio rooms: a signaling relay that only brokers
//! connection setup, and the participant side that keeps one peer
//! connection per other room member.

pub mod audio;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
#[cfg(test)]
mod testing;
pub mod webrtc;

pub use crate::config::{ReconnectPolicy, RelayConfig, SessionConfig};
pub use crate::error::{Error, Result};
pub use crate::events::{RemovalReason, SessionEvent};
pub use crate::peer::RosterEntry;
pub use crate::relay::{LocalRelay, RelayServer};
pub use crate::session::RoomSession;
pub use crate::signaling::{ParticipantProfile, SignalingChannel};
pub use crate::webrtc::WebRtcBackend;
