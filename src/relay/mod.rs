//! Signaling relay: a pure fan-out router keyed by room membership.
//!
//! The relay holds no per-pair negotiation state. It only decides who hears
//! about whom, and which side of each pair offers: the newcomer always
//! offers to every member already in the room.

pub mod local;
pub mod registry;
pub mod server;

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::signaling::{
    ClientMessage, IceCandidate, ParticipantProfile, PeerId, RoomId, ServerMessage,
    SessionDescription, UserId,
};
use registry::{Member, RoomRegistry};

pub use local::LocalRelay;
pub use server::RelayServer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("channel {0} is not open")]
    UnknownChannel(PeerId),
    #[error("already joined to room {room}")]
    AlreadyJoined { room: RoomId },
    #[error("not joined to any room")]
    NotJoined,
    #[error("joined to room {joined}, not {requested}")]
    RoomMismatch { joined: RoomId, requested: RoomId },
    #[error("peer {0} is not in this room")]
    UnknownPeer(PeerId),
    #[error("cannot relay to yourself")]
    SelfTarget,
    #[error("user id {0} does not belong to this channel")]
    ProfileMismatch(UserId),
    #[error("room {room} is full ({max} participants)")]
    RoomFull { room: RoomId, max: usize },
}

impl RelayError {
    /// Relays addressed to a participant that just left are an expected race,
    /// not something to bother the sender with.
    fn is_benign(&self) -> bool {
        matches!(self, RelayError::UnknownPeer(_))
    }
}

pub struct Relay {
    registry: RoomRegistry,
    channels: HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: RoomRegistry::new(config.max_participants),
            channels: HashMap::new(),
        }
    }

    /// Registers a new channel and returns its peer id.
    pub fn open_channel(&mut self, outbound: mpsc::UnboundedSender<ServerMessage>) -> PeerId {
        let peer_id = loop {
            let candidate = format!("peer-{:08x}", rand::random::<u32>());
            if !self.channels.contains_key(&candidate) {
                break candidate;
            }
        };
        self.channels.insert(peer_id.clone(), outbound);
        debug!(peer_id = %peer_id, "signaling channel opened");
        peer_id
    }

    /// Channel loss: implicit LEAVE, then forget the channel.
    pub fn close_channel(&mut self, peer_id: &PeerId) {
        self.depart(peer_id);
        if self.channels.remove(peer_id).is_some() {
            debug!(peer_id = %peer_id, "signaling channel closed");
        }
    }

    /// Handles one inbound event and reports failures back to the sender.
    pub fn dispatch(&mut self, from: &PeerId, msg: ClientMessage) {
        let event = msg.name();
        if let Err(e) = self.handle(from, msg) {
            if e.is_benign() {
                debug!(peer_id = %from, event, "dropped relay: {}", e);
            } else {
                warn!(peer_id = %from, event, "rejected signaling event: {}", e);
                self.deliver(
                    from,
                    ServerMessage::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    pub fn handle(&mut self, from: &PeerId, msg: ClientMessage) -> Result<(), RelayError> {
        if !self.channels.contains_key(from) {
            return Err(RelayError::UnknownChannel(from.clone()));
        }
        match msg {
            ClientMessage::Join { room, participant } => self.join(from, room, participant),
            ClientMessage::Leave { room } => {
                self.joined_room(from, &room)?;
                self.depart(from);
                Ok(())
            }
            ClientMessage::RelaySdp {
                peer_id,
                session_description,
            } => self.relay_sdp(from, &peer_id, session_description),
            ClientMessage::RelayIce {
                peer_id,
                icecandidate,
            } => self.relay_ice(from, &peer_id, icecandidate),
            ClientMessage::Mute { room, user_id } => self.set_muted(from, room, user_id, true),
            ClientMessage::Unmute { room, user_id } => self.set_muted(from, room, user_id, false),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn join(
        &mut self,
        from: &PeerId,
        room: RoomId,
        participant: ParticipantProfile,
    ) -> Result<(), RelayError> {
        let newcomer = Member {
            peer_id: from.clone(),
            profile: participant.clone(),
            muted: false,
        };
        let existing = self.registry.join(&room, newcomer)?;
        info!(
            peer_id = %from,
            room = %room,
            user_id = %participant.id,
            members = existing.len() + 1,
            "participant joined"
        );

        for member in existing {
            self.deliver(
                &member.peer_id,
                ServerMessage::AddPeer {
                    peer_id: from.clone(),
                    create_offer: false,
                    user: participant.clone(),
                    muted: false,
                },
            );
            self.deliver(
                from,
                ServerMessage::AddPeer {
                    peer_id: member.peer_id,
                    create_offer: true,
                    user: member.profile,
                    muted: member.muted,
                },
            );
        }
        Ok(())
    }

    fn depart(&mut self, peer_id: &PeerId) {
        let Some(departure) = self.registry.leave(peer_id) else {
            return;
        };
        info!(
            peer_id = %peer_id,
            room = %departure.room,
            remaining = departure.remaining.len(),
            "participant left"
        );
        for remaining in &departure.remaining {
            self.deliver(
                remaining,
                ServerMessage::RemovePeer {
                    peer_id: peer_id.clone(),
                    user_id: departure.member.profile.id.clone(),
                },
            );
        }
    }

    fn relay_sdp(
        &mut self,
        from: &PeerId,
        to: &PeerId,
        session_description: SessionDescription,
    ) -> Result<(), RelayError> {
        self.check_pair(from, to)?;
        debug!(from = %from, to = %to, kind = %session_description.kind, "relaying description");
        self.deliver(
            to,
            ServerMessage::SessionDescription {
                peer_id: from.clone(),
                session_description,
            },
        );
        Ok(())
    }

    fn relay_ice(
        &mut self,
        from: &PeerId,
        to: &PeerId,
        icecandidate: IceCandidate,
    ) -> Result<(), RelayError> {
        self.check_pair(from, to)?;
        self.deliver(
            to,
            ServerMessage::IceCandidate {
                peer_id: from.clone(),
                icecandidate,
            },
        );
        Ok(())
    }

    fn set_muted(
        &mut self,
        from: &PeerId,
        room: RoomId,
        user_id: UserId,
        muted: bool,
    ) -> Result<(), RelayError> {
        self.joined_room(from, &room)?;
        let owns_profile = self
            .registry
            .member(from)
            .map_or(false, |m| m.profile.id == user_id);
        if !owns_profile {
            return Err(RelayError::ProfileMismatch(user_id));
        }
        let others = self.registry.set_muted(from, muted).unwrap_or_default();
        for other in &others {
            let msg = if muted {
                ServerMessage::Mute {
                    room: room.clone(),
                    user_id: user_id.clone(),
                }
            } else {
                ServerMessage::Unmute {
                    room: room.clone(),
                    user_id: user_id.clone(),
                }
            };
            self.deliver(other, msg);
        }
        Ok(())
    }

    fn joined_room(&self, from: &PeerId, room: &RoomId) -> Result<(), RelayError> {
        match self.registry.room_of(from) {
            None => Err(RelayError::NotJoined),
            Some(joined) if joined != room => Err(RelayError::RoomMismatch {
                joined: joined.clone(),
                requested: room.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn check_pair(&self, from: &PeerId, to: &PeerId) -> Result<(), RelayError> {
        let Some(room) = self.registry.room_of(from) else {
            return Err(RelayError::NotJoined);
        };
        if from == to {
            return Err(RelayError::SelfTarget);
        }
        if self.registry.room_of(to) != Some(room) {
            return Err(RelayError::UnknownPeer(to.clone()));
        }
        Ok(())
    }

    fn deliver(&self, to: &PeerId, msg: ServerMessage) {
        match self.channels.get(to) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!(peer_id = %to, "channel already gone, dropping message");
                }
            }
            None => debug!(peer_id = %to, event = msg.name(), "no channel for peer"),
        }
    }
}
