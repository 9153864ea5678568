//! In-memory capability doubles for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{LinkEvents, LocalStream, LocalTrack, MediaBackend, MediaConnection};
use crate::connection::TransportState;
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

pub struct FakeTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// What one fake connection was asked to do.
#[derive(Debug, Default)]
pub struct ConnectionLog {
    pub tracks: Vec<String>,
    pub offers: usize,
    pub answers: usize,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

pub struct FakeConnection {
    events: LinkEvents<String>,
    log: Arc<Mutex<ConnectionLog>>,
    simulate_network: bool,
}

impl FakeConnection {
    fn maybe_connect(&self, log: &ConnectionLog) {
        if self.simulate_network && log.local.is_some() && log.remote.is_some() {
            self.events.state(TransportState::Connected);
        }
    }
}

#[async_trait]
impl MediaConnection<FakeTrack> for FakeConnection {
    async fn add_track(&self, track: Arc<FakeTrack>) -> Result<()> {
        self.log.lock().unwrap().tracks.push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut log = self.log.lock().unwrap();
        log.offers += 1;
        Ok(SessionDescription::offer(format!("offer-to-{}", self.events.remote())))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut log = self.log.lock().unwrap();
        if log.remote.is_none() {
            return Err(Error::Signaling("no remote offer".into()));
        }
        log.answers += 1;
        Ok(SessionDescription::answer(format!("answer-to-{}", self.events.remote())))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.local = Some(description);
        if self.simulate_network {
            self.events
                .candidate(IceCandidate::new(format!("candidate:host-for-{}", self.events.remote())));
        }
        self.maybe_connect(&log);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp.starts_with("malformed") {
            return Err(Error::Signaling("could not parse sdp".into()));
        }
        let mut log = self.log.lock().unwrap();
        log.remote = Some(description);
        self.maybe_connect(&log);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.remote.is_none() {
            return Err(Error::Signaling("remote description not set".into()));
        }
        if candidate.candidate.starts_with("bogus") {
            return Err(Error::Signaling("unparseable candidate".into()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

pub struct FakeSink {
    detached: Arc<AtomicUsize>,
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeState {
    tracks: Vec<Arc<FakeTrack>>,
    connections: HashMap<PeerId, Vec<Arc<Mutex<ConnectionLog>>>>,
    sinks_attached: usize,
}

/// Records everything the peer manager asks of it.
///
/// With `simulate_network` each connection gathers one candidate when its
/// local description is set and reports `Connected` once both descriptions
/// are in place.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    sinks_detached: Arc<AtomicUsize>,
    pub deny_capture: bool,
    pub simulate_network: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn networked() -> Self {
        Self {
            simulate_network: true,
            ..Self::default()
        }
    }

    pub fn denying_capture() -> Self {
        Self {
            deny_capture: true,
            ..Self::default()
        }
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn connect_count(&self, remote: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(remote)
            .map_or(0, Vec::len)
    }

    /// Log of the most recent connection to `remote`.
    pub fn log(&self, remote: &str) -> Arc<Mutex<ConnectionLog>> {
        let state = self.state.lock().unwrap();
        state.connections[remote].last().unwrap().clone()
    }

    pub fn remotes(&self) -> Vec<PeerId> {
        self.state.lock().unwrap().connections.keys().cloned().collect()
    }

    pub fn sinks_attached(&self) -> usize {
        self.state.lock().unwrap().sinks_attached
    }

    pub fn sinks_detached(&self) -> usize {
        self.sinks_detached.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    type Track = FakeTrack;
    type Connection = FakeConnection;
    type Inbound = String;
    type Sink = FakeSink;

    async fn capture_audio(&self) -> Result<LocalStream<FakeTrack>> {
        if self.deny_capture {
            return Err(Error::MediaAccessDenied("permission refused".into()));
        }
        let track = Arc::new(FakeTrack {
            id: "mic".into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        self.state.lock().unwrap().tracks.push(track.clone());
        Ok(LocalStream::new(vec![track]))
    }

    async fn connect(&self, events: LinkEvents<String>) -> Result<FakeConnection> {
        let log = Arc::new(Mutex::new(ConnectionLog::default()));
        self.state
            .lock()
            .unwrap()
            .connections
            .entry(events.remote().clone())
            .or_default()
            .push(log.clone());
        Ok(FakeConnection {
            events,
            log,
            simulate_network: self.simulate_network,
        })
    }

    async fn attach_sink(&self, _remote: &PeerId, _inbound: String) -> Result<FakeSink> {
        self.state.lock().unwrap().sinks_attached += 1;
        Ok(FakeSink {
            detached: self.sinks_detached.clone(),
        })
    }
}
