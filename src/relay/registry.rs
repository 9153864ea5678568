use std::collections::HashMap;

use crate::relay::RelayError;
use crate::signaling::{ParticipantProfile, PeerId, RoomId};

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub peer_id: PeerId,
    pub profile: ParticipantProfile,
    pub muted: bool,
}

/// Members ordered by join time.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    members: Vec<Member>,
    max_participants: usize,
}

impl Room {
    pub fn new(id: RoomId, max_participants: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            max_participants,
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    fn add_member(&mut self, member: Member) -> Result<(), RelayError> {
        if self.members.len() >= self.max_participants {
            return Err(RelayError::RoomFull {
                room: self.id.clone(),
                max: self.max_participants,
            });
        }
        self.members.push(member);
        Ok(())
    }

    fn remove_member(&mut self, peer_id: &str) -> Option<Member> {
        let index = self.members.iter().position(|m| m.peer_id == peer_id)?;
        Some(self.members.remove(index))
    }
}

/// A member that just left, plus who is still there to be told.
#[derive(Debug, Clone)]
pub struct Departure {
    pub room: RoomId,
    pub member: Member,
    pub remaining: Vec<PeerId>,
}

/// Source of truth for "who is in the room". A peer id maps to at most one
/// room; empty rooms are dropped.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    membership: HashMap<PeerId, RoomId>,
    max_participants: usize,
}

impl RoomRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            membership: HashMap::new(),
            max_participants,
        }
    }

    /// Registers `member` and returns the members that were already there,
    /// in join order.
    pub fn join(&mut self, room_id: &RoomId, member: Member) -> Result<Vec<Member>, RelayError> {
        if let Some(current) = self.membership.get(&member.peer_id) {
            return Err(RelayError::AlreadyJoined {
                room: current.clone(),
            });
        }
        let peer_id = member.peer_id.clone();
        let existing = match self.rooms.get_mut(room_id) {
            Some(room) => {
                let existing = room.members().to_vec();
                room.add_member(member)?;
                existing
            }
            None => {
                // only a room someone actually got into is kept
                let mut room = Room::new(room_id.clone(), self.max_participants);
                room.add_member(member)?;
                self.rooms.insert(room_id.clone(), room);
                Vec::new()
            }
        };
        self.membership.insert(peer_id, room_id.clone());
        Ok(existing)
    }

    pub fn leave(&mut self, peer_id: &str) -> Option<Departure> {
        let room_id = self.membership.remove(peer_id)?;
        let room = self.rooms.get_mut(&room_id)?;
        let member = room.remove_member(peer_id)?;
        let remaining = room.members().iter().map(|m| m.peer_id.clone()).collect();
        if room.members().is_empty() {
            self.rooms.remove(&room_id);
        }
        Some(Departure {
            room: room_id,
            member,
            remaining,
        })
    }

    /// Updates the flag and returns the other members of the room.
    pub fn set_muted(&mut self, peer_id: &str, muted: bool) -> Option<Vec<PeerId>> {
        let room_id = self.membership.get(peer_id)?;
        let room = self.rooms.get_mut(room_id)?;
        let mut others = Vec::with_capacity(room.members.len());
        for member in room.members.iter_mut() {
            if member.peer_id == peer_id {
                member.muted = muted;
            } else {
                others.push(member.peer_id.clone());
            }
        }
        Some(others)
    }

    pub fn room_of(&self, peer_id: &str) -> Option<&RoomId> {
        self.membership.get(peer_id)
    }

    pub fn member(&self, peer_id: &str) -> Option<&Member> {
        let room = self.rooms.get(self.membership.get(peer_id)?)?;
        room.members().iter().find(|m| m.peer_id == peer_id)
    }

    #[cfg(test)]
    pub fn members(&self, room_id: &str) -> &[Member] {
        self.rooms.get(room_id).map(Room::members).unwrap_or(&[])
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.membership.len()
    }
}
