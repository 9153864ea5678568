use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{AudioCapture, AudioPlayback, SAMPLE_RATE};
use crate::backend::{LinkEvents, LocalStream, LocalTrack, MediaBackend, MediaConnection};
use crate::connection::TransportState;
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, PeerId, SdpKind, SessionDescription};

const STREAM_ID: &str = "voice-mesh";

/// Media capabilities backed by `webrtc` peer connections and `cpal`
/// devices.
pub struct WebRtcBackend {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    type Track = LocalAudioTrack;
    type Connection = WebRtcConnection;
    type Inbound = Arc<TrackRemote>;
    type Sink = AudioPlayback;

    async fn capture_audio(&self) -> Result<LocalStream<LocalAudioTrack>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let enabled = Arc::new(AtomicBool::new(true));
        let capture = AudioCapture::start(Arc::clone(&track), Arc::clone(&enabled))
            .await
            .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;

        Ok(LocalStream::new(vec![Arc::new(LocalAudioTrack {
            track,
            enabled,
            capture: Mutex::new(Some(capture)),
        })]))
    }

    async fn connect(&self, events: LinkEvents<Arc<TrackRemote>>) -> Result<WebRtcConnection> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        let candidates = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidates.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.candidate(init.into());
                    }
                    Err(e) => warn!(peer_id = %events.remote(), "unusable local candidate: {}", e),
                }
            })
        }));

        let tracks = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    tracks.track(track);
                } else {
                    debug!(peer_id = %tracks.remote(), kind = %track.kind(), "ignoring non-audio track");
                }
                Box::pin(async {})
            },
        ));

        let states = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!(peer_id = %states.remote(), "Peer Connection State has changed: {}", s);
                states.state(TransportState::from(s));
                Box::pin(async {})
            },
        ));

        Ok(WebRtcConnection {
            peer_connection,
            remote: events.remote().clone(),
        })
    }

    async fn attach_sink(&self, remote: &PeerId, inbound: Arc<TrackRemote>) -> Result<AudioPlayback> {
        debug!(peer_id = %remote, ssrc = inbound.ssrc(), "attaching playback");
        Ok(AudioPlayback::start(inbound).await?)
    }
}

/// The shared PCMU track fed by the microphone.
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    capture: Mutex<Option<AudioCapture>>,
}

impl LocalTrack for LocalAudioTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        let mut capture = match self.capture.lock() {
            Ok(capture) => capture,
            Err(poisoned) => poisoned.into_inner(),
        };
        capture.take();
    }
}

pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    remote: PeerId,
}

#[async_trait]
impl MediaConnection<LocalAudioTrack> for WebRtcConnection {
    async fn add_track(&self, track: Arc<LocalAudioTrack>) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for the interceptors to run
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            trace!(peer_id = %remote, "rtcp reader finished");
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.peer_connection.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
        self.peer_connection
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| {
                Box::pin(async {})
            }));
        self.peer_connection.close().await?;
        debug!(peer_id = %self.remote, "peer connection closed");
        Ok(())
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Signaling("session description without a type".into()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let description = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpKind::Rollback => {
            return Err(Error::Signaling("rollback is not supported".into()))
        }
    };
    Ok(description)
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
