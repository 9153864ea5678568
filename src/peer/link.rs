use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{LinkKey, MediaBackend, MediaConnection};
use crate::connection::{LinkState, Role, TransportState};
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, ParticipantProfile, PeerId, SdpKind, SessionDescription};

/// Everything one participant holds for one remote participant.
pub struct PeerLink<B: MediaBackend> {
    key: LinkKey,
    user: ParticipantProfile,
    role: Role,
    state: LinkState,
    transport: TransportState,
    pub(crate) connection: B::Connection,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: usize,
    sink: Option<B::Sink>,
    timeout: Option<JoinHandle<()>>,
}

impl<B: MediaBackend> PeerLink<B> {
    pub(crate) fn new(
        key: LinkKey,
        user: ParticipantProfile,
        role: Role,
        connection: B::Connection,
    ) -> Self {
        Self {
            key,
            user,
            role,
            state: LinkState::Connecting,
            transport: TransportState::New,
            connection,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            applied_candidates: 0,
            sink: None,
            timeout: None,
        }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn remote(&self) -> &PeerId {
        &self.key.remote
    }

    pub fn user(&self) -> &ParticipantProfile {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!(peer_id = %self.key.remote, from = %self.state, to = %state, "link state");
            self.state = state;
        }
    }

    pub(crate) fn set_transport(&mut self, transport: TransportState) {
        self.transport = transport;
    }

    /// Applies the remote side's description and flushes candidates that
    /// arrived ahead of it. Returns the candidates the connection refused.
    pub(crate) async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<Error>> {
        // offerers take answers, answerers take offers; rollback is never accepted
        let unexpected = matches!(
            (description.kind, self.role),
            (SdpKind::Rollback, _)
                | (SdpKind::Offer, Role::Offerer)
                | (SdpKind::Answer | SdpKind::Pranswer, Role::Answerer)
        );
        if unexpected {
            return Err(Error::negotiation_rejected(
                &self.key.remote,
                format!("unexpected {} on {} link", description.kind, self.role),
            ));
        }

        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::negotiation_rejected(&self.key.remote, e))?;
        self.remote_description_set = true;

        let mut rejected = Vec::new();
        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!(peer_id = %self.key.remote, count = queued.len(), "flushing queued candidates");
        }
        for candidate in queued {
            if let Err(e) = self.apply_candidate(candidate).await {
                rejected.push(e);
            }
        }
        Ok(rejected)
    }

    /// Applies the candidate now, or queues it until the remote description
    /// lands. Returns whether it was applied.
    pub(crate) async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<bool> {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(false);
        }
        self.apply_candidate(candidate).await.map(|_| true)
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.connection.add_ice_candidate(candidate).await?;
        self.applied_candidates += 1;
        Ok(())
    }

    /// Swaps in a new playback sink; the old one is dropped and detached.
    pub(crate) fn replace_sink(&mut self, sink: B::Sink) -> bool {
        self.sink.replace(sink).is_some()
    }

    pub(crate) fn arm_timeout(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.timeout.replace(timer) {
            old.abort();
        }
    }

    pub(crate) fn disarm_timeout(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
    }

    /// Close-then-forget: after this nothing of the link stays attached.
    pub(crate) async fn close(&mut self) {
        self.disarm_timeout();
        self.sink.take();
        self.pending_candidates.clear();
        if let Err(e) = self.connection.close().await {
            warn!(peer_id = %self.key.remote, "error closing connection: {}", e);
        }
        self.set_state(LinkState::Closed);
    }
}
