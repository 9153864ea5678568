//! Diagnostics surfaced to the application layer.
//!
//! Every per-link failure, protocol violation and lifecycle step of a room
//! session shows up here in addition to the `tracing` output.

use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::Role;
use crate::error::Error;
use crate::signaling::{PeerId, RoomId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// JOIN was sent.
    Joined { room: RoomId },
    /// Capture was refused and the session continues without a microphone.
    ListenOnly { reason: String },
    PeerAdded {
        peer_id: PeerId,
        user_id: UserId,
        role: Role,
    },
    PeerConnected { peer_id: PeerId },
    PeerRemoved {
        peer_id: PeerId,
        user_id: UserId,
        reason: RemovalReason,
    },
    /// ADD_PEER for a remote that already has a link; ignored.
    DuplicatePeer { peer_id: PeerId },
    /// An event cited a remote with no link; dropped.
    UnknownPeer {
        peer_id: PeerId,
        event: &'static str,
    },
    CandidateRejected { peer_id: PeerId, reason: String },
    SinkFailed { peer_id: PeerId, reason: String },
    /// The relay refused one of our events.
    RelayError { message: String },
    ChannelDisconnected,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemovalReason {
    /// REMOVE_PEER from the relay.
    Left,
    /// We left the room ourselves.
    LocalExit,
    /// The connection closed underneath us.
    Closed,
    NegotiationRejected(String),
    ConnectionFailed(String),
}

impl From<&Error> for RemovalReason {
    fn from(err: &Error) -> Self {
        match err {
            Error::NegotiationRejected { reason, .. } => {
                RemovalReason::NegotiationRejected(reason.clone())
            }
            Error::ConnectionFailed { reason, .. } => RemovalReason::ConnectionFailed(reason.clone()),
            other => RemovalReason::ConnectionFailed(other.to_string()),
        }
    }
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::ListenOnly { .. } => "listen_only",
            Self::PeerAdded { .. } => "peer_added",
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerRemoved { .. } => "peer_removed",
            Self::DuplicatePeer { .. } => "duplicate_peer",
            Self::UnknownPeer { .. } => "unknown_peer",
            Self::CandidateRejected { .. } => "candidate_rejected",
            Self::SinkFailed { .. } => "sink_failed",
            Self::RelayError { .. } => "relay_error",
            Self::ChannelDisconnected => "channel_disconnected",
            Self::Left => "left",
        }
    }
}

/// Sender half of the diagnostics stream. Nobody listening is fine.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!(event = e.0.name(), "no listener for session event");
        }
    }
}
