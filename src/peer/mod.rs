//! Participant-side Peer Connection Manager.
//!
//! Owns one [`PeerLink`] per remote participant, the local capture stream
//! and the roster. Signaling events and link callbacks are fed in one at a
//! time by the session loop, so nothing here needs a lock.

pub mod link;
pub mod roster;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    LinkEvent, LinkEventKind, LinkEvents, LinkKey, LocalStream, MediaBackend, MediaConnection,
};
use crate::config::SessionConfig;
use crate::connection::{LinkState, Role, TransportState};
use crate::error::{Error, Result};
use crate::events::{EventSink, RemovalReason, SessionEvent};
use crate::signaling::{
    ClientMessage, IceCandidate, ParticipantProfile, PeerId, RoomId, SdpKind, ServerMessage,
    SessionDescription,
};

pub use link::PeerLink;
pub use roster::{Roster, RosterEntry};

pub struct PeerManager<B: MediaBackend> {
    backend: Arc<B>,
    config: SessionConfig,
    room: RoomId,
    profile: ParticipantProfile,
    signaling: mpsc::UnboundedSender<ClientMessage>,
    link_tx: mpsc::UnboundedSender<LinkEvent<B::Inbound>>,
    links: HashMap<PeerId, PeerLink<B>>,
    next_generation: u64,
    local_stream: Option<LocalStream<B::Track>>,
    muted: bool,
    roster: Roster,
    events: EventSink,
}

impl<B: MediaBackend> PeerManager<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        config: SessionConfig,
        room: RoomId,
        profile: ParticipantProfile,
        signaling: mpsc::UnboundedSender<ClientMessage>,
        link_tx: mpsc::UnboundedSender<LinkEvent<B::Inbound>>,
        events: EventSink,
    ) -> Self {
        Self {
            backend,
            config,
            room,
            profile,
            signaling,
            link_tx,
            links: HashMap::new(),
            next_generation: 0,
            local_stream: None,
            muted: false,
            roster: Roster::new(),
            events,
        }
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink<B>> {
        self.links.get(peer_id)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_listen_only(&self) -> bool {
        self.local_stream.is_none()
    }

    /// Acquires the microphone, then announces us to the room.
    pub async fn start(&mut self) -> Result<()> {
        match self.backend.capture_audio().await {
            Ok(stream) => {
                if self.config.start_muted {
                    stream.set_enabled(false);
                    self.muted = true;
                }
                self.local_stream = Some(stream);
            }
            Err(Error::MediaAccessDenied(reason)) if self.config.listen_only_fallback => {
                warn!(room = %self.room, "no microphone, joining listen-only: {}", reason);
                self.muted = true;
                self.events.emit(SessionEvent::ListenOnly { reason });
            }
            Err(e) => return Err(e),
        }

        self.roster
            .add(RosterEntry::local(self.profile.clone(), self.muted));
        send_to_relay(
            &self.signaling,
            ClientMessage::Join {
                room: self.room.clone(),
                participant: self.profile.clone(),
            },
        )?;
        info!(room = %self.room, user = %self.profile.id, "joined room");
        self.events.emit(SessionEvent::Joined {
            room: self.room.clone(),
        });

        if self.muted {
            send_to_relay(&self.signaling, self.mute_message(true))?;
        }
        Ok(())
    }

    /// Only a lost signaling channel comes back as an error; per-link
    /// failures drop that link and are reported as events.
    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        debug!(event = msg.name(), "signaling event");
        match msg {
            ServerMessage::AddPeer {
                peer_id,
                create_offer,
                user,
                muted,
            } => {
                self.add_peer(peer_id, Role::from_create_offer(create_offer), user, muted)
                    .await
            }
            ServerMessage::RemovePeer { peer_id, user_id } => {
                debug!(%peer_id, %user_id, "remove-peer");
                self.remove_link(&peer_id, RemovalReason::Left).await;
                Ok(())
            }
            ServerMessage::SessionDescription {
                peer_id,
                session_description,
            } => {
                let result = self
                    .apply_description(&peer_id, session_description)
                    .await;
                self.isolate(&peer_id, result).await
            }
            ServerMessage::IceCandidate {
                peer_id,
                icecandidate,
            } => {
                self.apply_candidate(&peer_id, icecandidate).await;
                Ok(())
            }
            ServerMessage::Mute { user_id, .. } => {
                self.roster.set_muted(&user_id, true);
                Ok(())
            }
            ServerMessage::Unmute { user_id, .. } => {
                self.roster.set_muted(&user_id, false);
                Ok(())
            }
            ServerMessage::Error { message } => {
                warn!(room = %self.room, "relay refused a message: {}", message);
                self.events.emit(SessionEvent::RelayError { message });
                Ok(())
            }
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent<B::Inbound>) -> Result<()> {
        let LinkEvent { key, kind } = event;
        let live = self
            .links
            .get(&key.remote)
            .map_or(false, |link| link.key() == &key);
        if !live {
            debug!(peer_id = %key.remote, generation = key.generation, "stale link event ignored");
            return Ok(());
        }
        let peer_id = key.remote;

        match kind {
            LinkEventKind::Candidate(candidate) => {
                debug!(%peer_id, "relaying local candidate");
                send_to_relay(
                    &self.signaling,
                    ClientMessage::RelayIce {
                        peer_id,
                        icecandidate: candidate,
                    },
                )
            }
            LinkEventKind::Track(inbound) => {
                self.attach_inbound(&peer_id, inbound).await;
                Ok(())
            }
            LinkEventKind::State(state) => self.on_transport_state(&peer_id, state).await,
            LinkEventKind::NegotiationTimeout => {
                let connected = self
                    .links
                    .get(&peer_id)
                    .map_or(true, |link| link.state() == LinkState::Connected);
                if connected {
                    return Ok(());
                }
                let err = Error::connection_failed(&peer_id, "negotiation timed out");
                self.isolate(&peer_id, Err(err)).await
            }
        }
    }

    /// Enables or disables every outbound track at once. No link is
    /// renegotiated.
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let Some(stream) = &self.local_stream else {
            if muted {
                return Ok(());
            }
            return Err(Error::MediaAccessDenied(
                "listen-only session has no microphone".into(),
            ));
        };
        if self.muted == muted {
            return Ok(());
        }
        stream.set_enabled(!muted);
        self.muted = muted;
        self.roster.set_muted(&self.profile.id, muted);
        info!(room = %self.room, muted, "local mute changed");
        send_to_relay(&self.signaling, self.mute_message(muted))
    }

    /// Stops capture, closes every link, then tells the relay we left.
    pub async fn leave(&mut self) -> Result<()> {
        self.release(RemovalReason::LocalExit).await;
        let sent = send_to_relay(
            &self.signaling,
            ClientMessage::Leave {
                room: self.room.clone(),
            },
        );
        info!(room = %self.room, "left room");
        self.events.emit(SessionEvent::Left);
        sent
    }

    /// Local cleanup after the signaling channel is gone. A later visit
    /// is a fresh JOIN.
    pub async fn teardown(&mut self) {
        self.release(RemovalReason::Closed).await;
        self.events.emit(SessionEvent::ChannelDisconnected);
    }

    async fn release(&mut self, reason: RemovalReason) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }

        let mut links: Vec<PeerLink<B>> = self.links.drain().map(|(_, link)| link).collect();
        join_all(links.iter_mut().map(|link| link.close())).await;
        for link in links {
            self.events.emit(SessionEvent::PeerRemoved {
                peer_id: link.remote().clone(),
                user_id: link.user().id.clone(),
                reason: reason.clone(),
            });
        }
        self.roster.clear();
    }

    async fn add_peer(
        &mut self,
        peer_id: PeerId,
        role: Role,
        user: ParticipantProfile,
        muted: bool,
    ) -> Result<()> {
        if self.links.contains_key(&peer_id) {
            debug!(%peer_id, "duplicate add-peer ignored");
            self.events.emit(SessionEvent::DuplicatePeer { peer_id });
            return Ok(());
        }

        self.next_generation += 1;
        let key = LinkKey {
            remote: peer_id.clone(),
            generation: self.next_generation,
        };
        let events = LinkEvents::new(key.clone(), self.link_tx.clone());
        let connection = match self.backend.connect(events.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%peer_id, "could not create peer connection: {}", e);
                self.events.emit(SessionEvent::PeerRemoved {
                    peer_id,
                    user_id: user.id,
                    reason: RemovalReason::ConnectionFailed(e.to_string()),
                });
                return Ok(());
            }
        };

        let mut link = PeerLink::new(key, user.clone(), role, connection);
        if let Some(after) = self.config.negotiation_timeout {
            link.arm_timeout(spawn_negotiation_timer(events, after));
        }
        self.links.insert(peer_id.clone(), link);
        let entry = RosterEntry::remote(peer_id.clone(), user.clone(), muted);
        if !self.roster.add(entry) && self.roster.rebind(&user.id, &peer_id, muted) {
            // rejoined before the relay noticed the old connection was gone
            debug!(%peer_id, user = %user.id, "roster entry moved to new peer");
        }
        info!(%peer_id, user = %user.id, %role, "peer added");
        self.events.emit(SessionEvent::PeerAdded {
            peer_id: peer_id.clone(),
            user_id: user.id,
            role,
        });

        let result = self.open_link(&peer_id).await;
        self.isolate(&peer_id, result).await
    }

    async fn open_link(&mut self, peer_id: &PeerId) -> Result<()> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(());
        };

        if let Some(stream) = &self.local_stream {
            for track in stream.tracks() {
                link.connection
                    .add_track(track.clone())
                    .await
                    .map_err(|e| Error::connection_failed(peer_id, e))?;
            }
        }

        if link.role() == Role::Offerer {
            let offer = link
                .connection
                .create_offer()
                .await
                .map_err(|e| Error::connection_failed(peer_id, e))?;
            link.connection
                .set_local_description(offer.clone())
                .await
                .map_err(|e| Error::negotiation_rejected(peer_id, e))?;
            link.set_state(LinkState::Negotiating);
            self.roster.set_link_state(peer_id, LinkState::Negotiating);
            send_to_relay(
                &self.signaling,
                ClientMessage::RelaySdp {
                    peer_id: peer_id.clone(),
                    session_description: offer,
                },
            )?;
        }
        Ok(())
    }

    async fn apply_description(
        &mut self,
        peer_id: &PeerId,
        description: SessionDescription,
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(peer_id) else {
            warn!(%peer_id, kind = %description.kind, "description for unknown peer dropped");
            self.events.emit(SessionEvent::UnknownPeer {
                peer_id: peer_id.clone(),
                event: "session-description",
            });
            return Ok(());
        };

        let kind = description.kind;
        let rejected = link.apply_remote_description(description).await?;
        for err in rejected {
            warn!(%peer_id, "queued candidate rejected: {}", err);
            self.events.emit(SessionEvent::CandidateRejected {
                peer_id: peer_id.clone(),
                reason: err.to_string(),
            });
        }

        if kind == SdpKind::Offer {
            let answer = link
                .connection
                .create_answer()
                .await
                .map_err(|e| Error::negotiation_rejected(peer_id, e))?;
            link.connection
                .set_local_description(answer.clone())
                .await
                .map_err(|e| Error::negotiation_rejected(peer_id, e))?;
            send_to_relay(
                &self.signaling,
                ClientMessage::RelaySdp {
                    peer_id: peer_id.clone(),
                    session_description: answer,
                },
            )?;
            if link.state() != LinkState::Connected {
                link.set_state(LinkState::Negotiating);
                self.roster.set_link_state(peer_id, LinkState::Negotiating);
            }
        }

        if link.transport() == TransportState::Connected {
            self.mark_connected(peer_id);
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, peer_id: &PeerId, candidate: IceCandidate) {
        let Some(link) = self.links.get_mut(peer_id) else {
            // usually a candidate that raced a remove-peer
            debug!(%peer_id, "candidate for unknown peer dropped");
            self.events.emit(SessionEvent::UnknownPeer {
                peer_id: peer_id.clone(),
                event: "ice-candidate",
            });
            return;
        };

        match link.add_candidate(candidate).await {
            Ok(true) => debug!(%peer_id, "remote candidate applied"),
            Ok(false) => debug!(
                %peer_id,
                queued = link.pending_candidates(),
                "remote candidate queued until description"
            ),
            Err(e) => {
                warn!(%peer_id, "remote candidate rejected: {}", e);
                self.events.emit(SessionEvent::CandidateRejected {
                    peer_id: peer_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn attach_inbound(&mut self, peer_id: &PeerId, inbound: B::Inbound) {
        match self.backend.attach_sink(peer_id, inbound).await {
            Ok(sink) => {
                if let Some(link) = self.links.get_mut(peer_id) {
                    let replaced = link.replace_sink(sink);
                    debug!(%peer_id, replaced, "inbound audio attached");
                }
            }
            Err(e) => {
                warn!(%peer_id, "could not attach inbound audio: {}", e);
                self.events.emit(SessionEvent::SinkFailed {
                    peer_id: peer_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn on_transport_state(&mut self, peer_id: &PeerId, state: TransportState) -> Result<()> {
        if let Some(link) = self.links.get_mut(peer_id) {
            link.set_transport(state);
        }
        debug!(%peer_id, %state, "transport state");

        match state {
            TransportState::Connected => {
                self.mark_connected(peer_id);
                Ok(())
            }
            TransportState::Failed => {
                let err = Error::connection_failed(peer_id, "transport failed");
                self.isolate(peer_id, Err(err)).await
            }
            TransportState::Closed => {
                self.remove_link(peer_id, RemovalReason::Closed).await;
                Ok(())
            }
            // may still recover on its own
            TransportState::Disconnected => Ok(()),
            TransportState::New | TransportState::Connecting => Ok(()),
        }
    }

    fn mark_connected(&mut self, peer_id: &PeerId) {
        let Some(link) = self.links.get_mut(peer_id) else {
            return;
        };
        if link.state() == LinkState::Connected {
            return;
        }
        link.set_state(LinkState::Connected);
        link.disarm_timeout();
        self.roster.set_link_state(peer_id, LinkState::Connected);
        info!(%peer_id, "peer connected");
        self.events.emit(SessionEvent::PeerConnected {
            peer_id: peer_id.clone(),
        });
    }

    /// Per-link failures drop that link only; a lost channel goes up.
    async fn isolate(&mut self, peer_id: &PeerId, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_channel_level() => Err(e),
            Err(e) => {
                warn!(%peer_id, "dropping link: {}", e);
                self.remove_link(peer_id, RemovalReason::from(&e)).await;
                Ok(())
            }
        }
    }

    /// Close-then-forget. Also drops the roster entry, even without a link.
    async fn remove_link(&mut self, peer_id: &PeerId, reason: RemovalReason) -> bool {
        self.roster.remove_peer(peer_id);
        let Some(mut link) = self.links.remove(peer_id) else {
            debug!(%peer_id, "no link to remove");
            return false;
        };
        link.close().await;
        info!(%peer_id, user = %link.user().id, ?reason, "peer removed");
        self.events.emit(SessionEvent::PeerRemoved {
            peer_id: peer_id.clone(),
            user_id: link.user().id.clone(),
            reason,
        });
        true
    }

    fn mute_message(&self, muted: bool) -> ClientMessage {
        let room = self.room.clone();
        let user_id = self.profile.id.clone();
        if muted {
            ClientMessage::Mute { room, user_id }
        } else {
            ClientMessage::Unmute { room, user_id }
        }
    }
}

fn send_to_relay(tx: &mpsc::UnboundedSender<ClientMessage>, msg: ClientMessage) -> Result<()> {
    tx.send(msg).map_err(|_| Error::ChannelDisconnected)
}

fn spawn_negotiation_timer<I: Send + 'static>(
    events: LinkEvents<I>,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        events.negotiation_timeout();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalTrack;
    use crate::testing::FakeBackend;

    struct Harness {
        manager: PeerManager<FakeBackend>,
        backend: Arc<FakeBackend>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent<String>>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            negotiation_timeout: None,
            ..SessionConfig::default()
        }
    }

    fn profile(id: &str) -> ParticipantProfile {
        ParticipantProfile {
            id: id.into(),
            name: id.to_uppercase(),
            avatar: None,
        }
    }

    fn harness(backend: FakeBackend, config: SessionConfig) -> Harness {
        let backend = Arc::new(backend);
        let (signaling, outbound) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let manager = PeerManager::new(
            backend.clone(),
            config,
            "lobby".into(),
            profile("me"),
            signaling,
            link_tx,
            EventSink::new(event_tx),
        );
        Harness {
            manager,
            backend,
            outbound,
            link_rx,
            events,
        }
    }

    async fn started(backend: FakeBackend, config: SessionConfig) -> Harness {
        let mut h = harness(backend, config);
        h.manager.start().await.unwrap();
        h.sent();
        h.drain_events();
        h
    }

    fn add_peer(peer_id: &str, user: &str, create_offer: bool) -> ServerMessage {
        ServerMessage::AddPeer {
            peer_id: peer_id.into(),
            create_offer,
            user: profile(user),
            muted: false,
        }
    }

    fn description(peer_id: &str, description: SessionDescription) -> ServerMessage {
        ServerMessage::SessionDescription {
            peer_id: peer_id.into(),
            session_description: description,
        }
    }

    fn candidate(peer_id: &str, candidate: &str) -> ServerMessage {
        ServerMessage::IceCandidate {
            peer_id: peer_id.into(),
            icecandidate: IceCandidate::new(candidate),
        }
    }

    impl Harness {
        async fn deliver(&mut self, msg: ServerMessage) {
            self.manager.handle_server_message(msg).await.unwrap();
        }

        /// Feeds link callbacks until none are left.
        async fn pump(&mut self) {
            while let Ok(event) = self.link_rx.try_recv() {
                self.manager.handle_link_event(event).await.unwrap();
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                out.push(msg);
            }
            out
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn link_state(&self, peer_id: &str) -> Option<LinkState> {
            self.manager.link(peer_id).map(|link| link.state())
        }
    }

    #[tokio::test]
    async fn start_adds_self_then_joins() {
        let mut h = harness(FakeBackend::new(), quiet_config());
        h.manager.start().await.unwrap();

        assert_eq!(
            h.sent(),
            vec![ClientMessage::Join {
                room: "lobby".into(),
                participant: profile("me"),
            }]
        );
        let entries = h.manager.roster().entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_local);
        assert!(!h.manager.is_listen_only());
        assert_eq!(
            h.drain_events(),
            vec![SessionEvent::Joined {
                room: "lobby".into()
            }]
        );
    }

    #[tokio::test]
    async fn offerer_attaches_tracks_and_sends_offer() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;

        let link = h.manager.link("peer-a").unwrap();
        assert_eq!(link.role(), Role::Offerer);
        assert_eq!(link.state(), LinkState::Negotiating);
        let log = h.backend.log("peer-a");
        assert_eq!(log.lock().unwrap().tracks, vec!["mic".to_string()]);
        assert_eq!(log.lock().unwrap().offers, 1);

        match h.sent().as_slice() {
            [ClientMessage::RelaySdp {
                peer_id,
                session_description,
            }] => {
                assert_eq!(peer_id, "peer-a");
                assert_eq!(session_description.kind, SdpKind::Offer);
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
        assert_eq!(
            h.manager.roster().get("ada").unwrap().link,
            Some(LinkState::Negotiating)
        );
        assert_eq!(
            h.drain_events(),
            vec![SessionEvent::PeerAdded {
                peer_id: "peer-a".into(),
                user_id: "ada".into(),
                role: Role::Offerer,
            }]
        );
    }

    #[tokio::test]
    async fn answerer_replies_to_offer() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        assert_eq!(h.link_state("peer-b"), Some(LinkState::Connecting));
        assert!(h.sent().is_empty());

        h.deliver(description("peer-b", SessionDescription::offer("v=0 offer")))
            .await;

        assert_eq!(h.link_state("peer-b"), Some(LinkState::Negotiating));
        match h.sent().as_slice() {
            [ClientMessage::RelaySdp {
                session_description,
                ..
            }] => assert_eq!(session_description.kind, SdpKind::Answer),
            other => panic!("unexpected outbound: {:?}", other),
        }
        assert_eq!(h.backend.log("peer-b").lock().unwrap().answers, 1);
    }

    #[tokio::test]
    async fn duplicate_add_peer_keeps_one_link() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.sent();
        h.drain_events();

        h.deliver(add_peer("peer-a", "ada", true)).await;

        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.backend.connect_count("peer-a"), 1);
        assert!(h.sent().is_empty());
        assert_eq!(
            h.drain_events(),
            vec![SessionEvent::DuplicatePeer {
                peer_id: "peer-a".into()
            }]
        );
        assert_eq!(h.manager.roster().entries().len(), 2);
    }

    #[tokio::test]
    async fn early_candidates_are_applied_once_after_description() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        h.deliver(candidate("peer-b", "candidate:1")).await;
        h.deliver(candidate("peer-b", "candidate:2")).await;

        let link = h.manager.link("peer-b").unwrap();
        assert_eq!(link.pending_candidates(), 2);
        assert_eq!(link.applied_candidates(), 0);
        assert!(h.backend.log("peer-b").lock().unwrap().candidates.is_empty());

        h.deliver(description("peer-b", SessionDescription::offer("v=0 offer")))
            .await;
        let link = h.manager.link("peer-b").unwrap();
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(link.applied_candidates(), 2);

        h.deliver(candidate("peer-b", "candidate:3")).await;
        let applied: Vec<_> = h
            .backend
            .log("peer-b")
            .lock()
            .unwrap()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(applied, ["candidate:1", "candidate:2", "candidate:3"]);
    }

    #[tokio::test]
    async fn rejected_candidate_keeps_the_link() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        h.deliver(description("peer-b", SessionDescription::offer("v=0 offer")))
            .await;
        h.drain_events();

        h.deliver(candidate("peer-b", "bogus")).await;

        assert!(h.manager.link("peer-b").is_some());
        assert!(matches!(
            h.drain_events().as_slice(),
            [SessionEvent::CandidateRejected { .. }]
        ));
    }

    #[tokio::test]
    async fn offerer_connects_after_answer() {
        let mut h = started(FakeBackend::networked(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.pump().await;

        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1], ClientMessage::RelayIce { peer_id, .. } if peer_id == "peer-a"));

        h.deliver(description("peer-a", SessionDescription::answer("v=0 answer")))
            .await;
        assert_eq!(h.link_state("peer-a"), Some(LinkState::Negotiating));
        h.pump().await;

        assert_eq!(h.link_state("peer-a"), Some(LinkState::Connected));
        assert_eq!(
            h.manager.roster().get("ada").unwrap().link,
            Some(LinkState::Connected)
        );
        assert!(h.drain_events().contains(&SessionEvent::PeerConnected {
            peer_id: "peer-a".into()
        }));
    }

    #[tokio::test]
    async fn events_for_unknown_peers_are_dropped() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(description("ghost", SessionDescription::offer("v=0"))).await;
        h.deliver(candidate("ghost", "candidate:1")).await;

        assert_eq!(h.manager.link_count(), 0);
        assert_eq!(h.backend.connect_count("ghost"), 0);
        assert!(h.sent().is_empty());
        assert_eq!(
            h.drain_events(),
            vec![
                SessionEvent::UnknownPeer {
                    peer_id: "ghost".into(),
                    event: "session-description"
                },
                SessionEvent::UnknownPeer {
                    peer_id: "ghost".into(),
                    event: "ice-candidate"
                },
            ]
        );
    }

    #[tokio::test]
    async fn remove_peer_releases_everything_for_that_remote() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.deliver(add_peer("peer-b", "bob", true)).await;
        let stale = h.manager.link("peer-a").unwrap().key().clone();
        h.manager
            .handle_link_event(LinkEvent {
                key: stale.clone(),
                kind: LinkEventKind::Track("stream-a".into()),
            })
            .await
            .unwrap();
        h.sent();

        h.deliver(ServerMessage::RemovePeer {
            peer_id: "peer-a".into(),
            user_id: "ada".into(),
        })
        .await;

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.manager.link("peer-b").is_some());
        assert!(h.backend.log("peer-a").lock().unwrap().closed);
        assert_eq!(h.backend.sinks_detached(), 1);
        assert!(h.manager.roster().get("ada").is_none());
        assert!(h.backend.tracks().iter().all(|t| !t.is_stopped()));

        // a late callback from the closed connection
        h.manager
            .handle_link_event(LinkEvent {
                key: stale,
                kind: LinkEventKind::Candidate(IceCandidate::new("candidate:late")),
            })
            .await
            .unwrap();
        h.deliver(candidate("peer-a", "candidate:late")).await;
        assert!(h.sent().is_empty());
        assert!(h.manager.link("peer-a").is_none());
    }

    #[tokio::test]
    async fn re_added_peer_ignores_old_generation() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        let old_key = h.manager.link("peer-a").unwrap().key().clone();
        h.deliver(ServerMessage::RemovePeer {
            peer_id: "peer-a".into(),
            user_id: "ada".into(),
        })
        .await;
        h.deliver(add_peer("peer-a", "ada", false)).await;

        let new_key = h.manager.link("peer-a").unwrap().key().clone();
        assert_ne!(old_key, new_key);
        assert_eq!(h.backend.connect_count("peer-a"), 2);

        h.manager
            .handle_link_event(LinkEvent {
                key: old_key,
                kind: LinkEventKind::State(TransportState::Failed),
            })
            .await
            .unwrap();
        assert_eq!(h.link_state("peer-a"), Some(LinkState::Connecting));
    }

    #[tokio::test]
    async fn mute_toggles_every_track_without_renegotiating() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.deliver(add_peer("peer-b", "bob", true)).await;
        h.sent();

        h.manager.set_muted(true).unwrap();

        assert!(h.backend.tracks().iter().all(|t| !t.is_enabled()));
        assert!(h.manager.is_muted());
        assert!(h.manager.roster().get("me").unwrap().muted);
        assert_eq!(
            h.sent(),
            vec![ClientMessage::Mute {
                room: "lobby".into(),
                user_id: "me".into(),
            }]
        );
        assert_eq!(h.backend.log("peer-a").lock().unwrap().offers, 1);
        assert_eq!(h.manager.link_count(), 2);

        h.manager.set_muted(false).unwrap();
        assert!(h.backend.tracks().iter().all(|t| t.is_enabled()));
        assert!(matches!(h.sent().as_slice(), [ClientMessage::Unmute { .. }]));
    }

    #[tokio::test]
    async fn remote_mute_updates_roster_entry() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        h.deliver(ServerMessage::Mute {
            room: "lobby".into(),
            user_id: "ada".into(),
        })
        .await;
        assert!(h.manager.roster().get("ada").unwrap().muted);

        h.deliver(ServerMessage::Unmute {
            room: "lobby".into(),
            user_id: "ada".into(),
        })
        .await;
        assert!(!h.manager.roster().get("ada").unwrap().muted);
    }

    #[tokio::test]
    async fn malformed_description_drops_only_that_link() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        h.drain_events();

        h.deliver(description("peer-a", SessionDescription::offer("malformed")))
            .await;

        assert!(h.manager.link("peer-a").is_none());
        assert_eq!(h.link_state("peer-b"), Some(LinkState::Connecting));
        match h.drain_events().as_slice() {
            [SessionEvent::PeerRemoved {
                peer_id,
                reason: RemovalReason::NegotiationRejected(_),
                ..
            }] => assert_eq!(peer_id, "peer-a"),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn answer_on_answerer_link_is_rejected() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        h.deliver(description("peer-a", SessionDescription::answer("v=0")))
            .await;

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.backend.log("peer-a").lock().unwrap().remote.is_none());
    }

    #[tokio::test]
    async fn offer_on_offerer_link_is_rejected() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.sent();
        h.deliver(description("peer-a", SessionDescription::offer("v=0 glare")))
            .await;

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.backend.log("peer-a").lock().unwrap().remote.is_none());
        assert_eq!(h.backend.log("peer-a").lock().unwrap().answers, 0);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn pranswer_on_answerer_link_is_rejected() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        h.drain_events();
        let pranswer = SessionDescription {
            kind: SdpKind::Pranswer,
            sdp: "v=0 pranswer".into(),
        };
        h.deliver(description("peer-a", pranswer)).await;

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.backend.log("peer-a").lock().unwrap().remote.is_none());
        assert!(matches!(
            h.drain_events().as_slice(),
            [SessionEvent::PeerRemoved {
                reason: RemovalReason::NegotiationRejected(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn rollback_is_rejected_before_reaching_the_connection() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        h.deliver(description("peer-a", rollback.clone())).await;
        h.deliver(description("peer-b", rollback)).await;

        assert_eq!(h.manager.link_count(), 0);
        assert!(h.backend.log("peer-a").lock().unwrap().remote.is_none());
        assert!(h.backend.log("peer-b").lock().unwrap().remote.is_none());
    }

    #[tokio::test]
    async fn closed_transport_removes_the_link() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        let key = h.manager.link("peer-a").unwrap().key().clone();
        h.drain_events();

        h.manager
            .handle_link_event(LinkEvent {
                key,
                kind: LinkEventKind::State(TransportState::Closed),
            })
            .await
            .unwrap();

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.manager.roster().get("ada").is_none());
        assert!(h.backend.log("peer-a").lock().unwrap().closed);
        assert_eq!(
            h.drain_events(),
            vec![SessionEvent::PeerRemoved {
                peer_id: "peer-a".into(),
                user_id: "ada".into(),
                reason: RemovalReason::Closed,
            }]
        );
    }

    #[tokio::test]
    async fn rejoined_user_keeps_roster_entry_when_old_peer_is_removed() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-old", "ada", false)).await;
        h.deliver(add_peer("peer-new", "ada", false)).await;

        let entry = h.manager.roster().get("ada").unwrap();
        assert_eq!(entry.peer_id.as_deref(), Some("peer-new"));
        assert_eq!(h.manager.roster().entries().len(), 2);

        h.deliver(ServerMessage::RemovePeer {
            peer_id: "peer-old".into(),
            user_id: "ada".into(),
        })
        .await;

        assert!(h.manager.link("peer-old").is_none());
        assert!(h.manager.link("peer-new").is_some());
        let entry = h.manager.roster().get("ada").unwrap();
        assert_eq!(entry.peer_id.as_deref(), Some("peer-new"));

        h.deliver(description("peer-new", SessionDescription::offer("v=0 offer")))
            .await;
        assert_eq!(
            h.manager.roster().get("ada").unwrap().link,
            Some(LinkState::Negotiating)
        );
    }

    #[tokio::test]
    async fn failed_transport_counts_as_removal() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.deliver(add_peer("peer-b", "bob", true)).await;
        let key = h.manager.link("peer-a").unwrap().key().clone();
        h.drain_events();

        h.manager
            .handle_link_event(LinkEvent {
                key,
                kind: LinkEventKind::State(TransportState::Failed),
            })
            .await
            .unwrap();

        assert!(h.manager.link("peer-a").is_none());
        assert!(h.manager.link("peer-b").is_some());
        assert!(h.manager.roster().get("ada").is_none());
        assert!(matches!(
            h.drain_events().as_slice(),
            [SessionEvent::PeerRemoved {
                reason: RemovalReason::ConnectionFailed(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn repeated_track_events_replace_the_sink() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        let key = h.manager.link("peer-a").unwrap().key().clone();

        for stream in ["first", "second"] {
            h.manager
                .handle_link_event(LinkEvent {
                    key: key.clone(),
                    kind: LinkEventKind::Track(stream.into()),
                })
                .await
                .unwrap();
        }

        assert!(h.manager.link("peer-a").unwrap().has_sink());
        assert_eq!(h.backend.sinks_attached(), 2);
        assert_eq!(h.backend.sinks_detached(), 1);
    }

    #[tokio::test]
    async fn leave_stops_capture_closes_links_then_sends_leave() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.deliver(add_peer("peer-b", "bob", false)).await;
        h.sent();
        h.drain_events();

        h.manager.leave().await.unwrap();

        assert!(h.backend.tracks().iter().all(|t| t.is_stopped()));
        for remote in ["peer-a", "peer-b"] {
            assert!(h.backend.log(remote).lock().unwrap().closed);
        }
        assert_eq!(h.manager.link_count(), 0);
        assert!(h.manager.roster().entries().is_empty());
        assert_eq!(
            h.sent(),
            vec![ClientMessage::Leave {
                room: "lobby".into()
            }]
        );
        let events = h.drain_events();
        assert_eq!(events.last(), Some(&SessionEvent::Left));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(
                    e,
                    SessionEvent::PeerRemoved {
                        reason: RemovalReason::LocalExit,
                        ..
                    }
                ))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn teardown_does_not_send_leave() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.sent();

        h.manager.teardown().await;

        assert!(h.sent().is_empty());
        assert_eq!(h.manager.link_count(), 0);
        assert!(h.manager.roster().entries().is_empty());
        assert_eq!(
            h.drain_events().last(),
            Some(&SessionEvent::ChannelDisconnected)
        );
    }

    #[tokio::test]
    async fn denied_capture_falls_back_to_listen_only() {
        let mut h = harness(FakeBackend::denying_capture(), quiet_config());
        h.manager.start().await.unwrap();

        assert!(h.manager.is_listen_only());
        assert!(h.manager.roster().get("me").unwrap().muted);
        let sent = h.sent();
        assert!(matches!(sent.as_slice(), [ClientMessage::Join { .. }, ClientMessage::Mute { .. }]));
        assert!(matches!(
            h.drain_events().first(),
            Some(SessionEvent::ListenOnly { .. })
        ));
        assert!(matches!(
            h.manager.set_muted(false),
            Err(Error::MediaAccessDenied(_))
        ));

        h.deliver(add_peer("peer-a", "ada", true)).await;
        assert!(h.backend.log("peer-a").lock().unwrap().tracks.is_empty());
        assert_eq!(h.link_state("peer-a"), Some(LinkState::Negotiating));
    }

    #[tokio::test]
    async fn denied_capture_without_fallback_aborts_join() {
        let config = SessionConfig {
            listen_only_fallback: false,
            ..quiet_config()
        };
        let mut h = harness(FakeBackend::denying_capture(), config);

        assert!(matches!(
            h.manager.start().await,
            Err(Error::MediaAccessDenied(_))
        ));
        assert!(h.sent().is_empty());
        assert!(h.manager.roster().entries().is_empty());
    }

    #[tokio::test]
    async fn start_muted_disables_tracks_before_joining() {
        let config = SessionConfig {
            start_muted: true,
            ..quiet_config()
        };
        let mut h = harness(FakeBackend::new(), config);
        h.manager.start().await.unwrap();

        assert!(h.backend.tracks().iter().all(|t| !t.is_enabled()));
        let sent = h.sent();
        assert!(matches!(sent.as_slice(), [ClientMessage::Join { .. }, ClientMessage::Mute { .. }]));
    }

    #[tokio::test]
    async fn unconnected_link_is_dropped_after_negotiation_timeout() {
        let config = SessionConfig {
            negotiation_timeout: Some(Duration::from_millis(20)),
            ..SessionConfig::default()
        };
        let mut h = started(FakeBackend::new(), config).await;
        h.deliver(add_peer("peer-a", "ada", false)).await;
        h.drain_events();

        let event = tokio::time::timeout(Duration::from_secs(2), h.link_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.kind, LinkEventKind::NegotiationTimeout));
        h.manager.handle_link_event(event).await.unwrap();

        assert!(h.manager.link("peer-a").is_none());
        assert!(matches!(
            h.drain_events().as_slice(),
            [SessionEvent::PeerRemoved {
                reason: RemovalReason::ConnectionFailed(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn connected_link_survives_negotiation_timeout() {
        let config = SessionConfig {
            negotiation_timeout: Some(Duration::from_millis(200)),
            ..SessionConfig::default()
        };
        let mut h = started(FakeBackend::networked(), config).await;
        h.deliver(add_peer("peer-a", "ada", true)).await;
        h.pump().await;
        h.deliver(description("peer-a", SessionDescription::answer("v=0 answer")))
            .await;
        h.pump().await;
        assert_eq!(h.link_state("peer-a"), Some(LinkState::Connected));
        let key = h.manager.link("peer-a").unwrap().key().clone();

        // the armed timer was cancelled on connect
        tokio::time::sleep(Duration::from_millis(400)).await;
        while let Ok(event) = h.link_rx.try_recv() {
            assert!(!matches!(event.kind, LinkEventKind::NegotiationTimeout));
        }

        // and a timeout that was already in flight is ignored
        h.drain_events();
        h.manager
            .handle_link_event(LinkEvent {
                key,
                kind: LinkEventKind::NegotiationTimeout,
            })
            .await
            .unwrap();
        assert_eq!(h.link_state("peer-a"), Some(LinkState::Connected));
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn lost_channel_surfaces_as_error() {
        let mut h = started(FakeBackend::new(), quiet_config()).await;
        h.outbound.close();

        let result = h
            .manager
            .handle_server_message(add_peer("peer-a", "ada", true))
            .await;
        assert!(matches!(result, Err(Error::ChannelDisconnected)));
    }
}
