//! Capabilities the peer manager consumes but does not implement: device
//! capture, peer media connections and playback sinks.
//!
//! Connection callbacks (new local candidate, inbound track, state change)
//! are not invoked on the manager directly. The backend pushes them into a
//! [`LinkEvents`] handle, which tags each one with the link it belongs to and
//! queues it for the session's event loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::TransportState;
use crate::error::Result;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// One outbound track of the local capture stream.
pub trait LocalTrack: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Releases the underlying device. Idempotent.
    fn stop(&self);
}

/// The process's own audio source, shared read-only by every PeerLink.
pub struct LocalStream<T> {
    tracks: Vec<Arc<T>>,
}

impl<T: LocalTrack> LocalStream<T> {
    pub fn new(tracks: Vec<Arc<T>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<T>] {
        &self.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    /// Consumes the stream, so it can be released only once.
    pub fn stop(self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaConnection<T: LocalTrack>: Send + Sync + 'static {
    async fn add_track(&self, track: Arc<T>) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Closes the connection and detaches every callback it was given.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    type Track: LocalTrack;
    type Connection: MediaConnection<Self::Track>;
    /// Whatever an inbound track event carries.
    type Inbound: Send + 'static;
    /// Playback of one remote's audio; dropping it detaches the output.
    type Sink: Send + Sync + 'static;

    /// Fails with `Error::MediaAccessDenied` when no microphone is available.
    async fn capture_audio(&self) -> Result<LocalStream<Self::Track>>;

    async fn connect(&self, events: LinkEvents<Self::Inbound>) -> Result<Self::Connection>;

    async fn attach_sink(&self, remote: &PeerId, inbound: Self::Inbound) -> Result<Self::Sink>;
}

/// Identifies one incarnation of a PeerLink. A remote that is removed and
/// added again gets a new generation, so late callbacks from the old
/// connection can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub remote: PeerId,
    pub generation: u64,
}

#[derive(Debug)]
pub enum LinkEventKind<I> {
    Candidate(IceCandidate),
    Track(I),
    State(TransportState),
    NegotiationTimeout,
}

#[derive(Debug)]
pub struct LinkEvent<I> {
    pub key: LinkKey,
    pub kind: LinkEventKind<I>,
}

/// Callback side of a PeerLink, handed to the backend on connect.
pub struct LinkEvents<I> {
    key: LinkKey,
    tx: mpsc::UnboundedSender<LinkEvent<I>>,
}

impl<I> Clone for LinkEvents<I> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<I> LinkEvents<I> {
    pub fn new(key: LinkKey, tx: mpsc::UnboundedSender<LinkEvent<I>>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn remote(&self) -> &PeerId {
        &self.key.remote
    }

    /// Each discovered candidate goes out as its own event.
    pub fn candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(LinkEventKind::Candidate(candidate))
    }

    pub fn track(&self, inbound: I) -> bool {
        self.emit(LinkEventKind::Track(inbound))
    }

    pub fn state(&self, state: TransportState) -> bool {
        self.emit(LinkEventKind::State(state))
    }

    pub(crate) fn negotiation_timeout(&self) -> bool {
        self.emit(LinkEventKind::NegotiationTimeout)
    }

    /// Returns false once the session loop is gone.
    fn emit(&self, kind: LinkEventKind<I>) -> bool {
        self.tx
            .send(LinkEvent {
                key: self.key.clone(),
                kind,
            })
            .is_ok()
    }
}
