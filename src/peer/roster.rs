use serde::Serialize;
use tokio::sync::watch;

use crate::connection::LinkState;
use crate::signaling::{ParticipantProfile, PeerId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub user: ParticipantProfile,
    /// `None` for our own entry.
    pub peer_id: Option<PeerId>,
    pub is_local: bool,
    pub muted: bool,
    pub link: Option<LinkState>,
}

impl RosterEntry {
    pub fn local(user: ParticipantProfile, muted: bool) -> Self {
        Self {
            user,
            peer_id: None,
            is_local: true,
            muted,
            link: None,
        }
    }

    pub fn remote(peer_id: PeerId, user: ParticipantProfile, muted: bool) -> Self {
        Self {
            user,
            peer_id: Some(peer_id),
            is_local: false,
            muted,
            link: Some(LinkState::Connecting),
        }
    }
}

/// Locally observed room membership, in join order and unique by user id.
/// Only the peer manager writes it; readers subscribe to snapshots.
pub struct Roster {
    entries: Vec<RosterEntry>,
    publisher: watch::Sender<Vec<RosterEntry>>,
}

impl Roster {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(Vec::new());
        Self {
            entries: Vec::new(),
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.publisher.subscribe()
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn get(&self, user_id: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.user.id == user_id)
    }

    /// Adding an id that is already present is a no-op, not an update.
    pub fn add(&mut self, entry: RosterEntry) -> bool {
        if self.get(&entry.user.id).is_some() {
            return false;
        }
        self.entries.push(entry);
        self.publish();
        true
    }

    /// Moves a remote user's entry onto the peer id of a fresh connection,
    /// keeping its place in the join order. A stale remove for the old peer
    /// id then no longer matches it.
    pub fn rebind(&mut self, user_id: &str, peer_id: &PeerId, muted: bool) -> bool {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.is_local && e.user.id == user_id);
        match entry {
            Some(entry) if entry.peer_id.as_ref() != Some(peer_id) => {
                entry.peer_id = Some(peer_id.clone());
                entry.muted = muted;
                entry.link = Some(LinkState::Connecting);
                self.publish();
                true
            }
            _ => false,
        }
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.peer_id.as_deref() != Some(peer_id));
        self.changed(before)
    }

    pub fn set_muted(&mut self, user_id: &str, muted: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.user.id == user_id) {
            Some(entry) if entry.muted != muted => {
                entry.muted = muted;
                self.publish();
                true
            }
            _ => false,
        }
    }

    pub fn set_link_state(&mut self, peer_id: &str, state: LinkState) {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.peer_id.as_deref() == Some(peer_id));
        if let Some(entry) = entry {
            if entry.link != Some(state) {
                entry.link = Some(state);
                self.publish();
            }
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.publish();
        }
    }

    fn changed(&mut self, before: usize) -> bool {
        let removed = self.entries.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    fn publish(&self) {
        self.publisher.send_replace(self.entries.clone());
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}
