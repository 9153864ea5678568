use std::fmt;

use anyhow::Error as AnyhowError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::signaling::PeerId;

#[derive(Debug, Error)]
pub enum Error {
    /// Capture permission refused or no usable input device.
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    /// The signaling channel is gone; every PeerLink goes with it.
    #[error("signaling channel disconnected")]
    ChannelDisconnected,

    #[error("negotiation with {peer_id} rejected: {reason}")]
    NegotiationRejected { peer_id: PeerId, reason: String },

    #[error("connection to {peer_id} failed: {reason}")]
    ConnectionFailed { peer_id: PeerId, reason: String },

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

impl Error {
    pub fn negotiation_rejected(peer_id: &PeerId, reason: impl fmt::Display) -> Self {
        Error::NegotiationRejected {
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn connection_failed(peer_id: &PeerId, reason: impl fmt::Display) -> Self {
        Error::ConnectionFailed {
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Channel-level failures cascade to the whole session; everything else
    /// is isolated to a single PeerLink.
    pub fn is_channel_level(&self) -> bool {
        matches!(self, Error::ChannelDisconnected)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
