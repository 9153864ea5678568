use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Relay-assigned identifier of one signaling channel.
pub type PeerId = String;
pub type RoomId = String;
pub type UserId = String;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
            SdpKind::Pranswer => write!(f, "pranswer"),
            SdpKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// Same shape as a browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Same shape as a browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Participant → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        room: RoomId,
        participant: ParticipantProfile,
    },
    Leave {
        room: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    RelaySdp {
        peer_id: PeerId,
        session_description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    RelayIce {
        peer_id: PeerId,
        icecandidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    Mute { room: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    Unmute { room: RoomId, user_id: UserId },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::RelaySdp { .. } => "relay-sdp",
            Self::RelayIce { .. } => "relay-ice",
            Self::Mute { .. } => "mute",
            Self::Unmute { .. } => "unmute",
        }
    }
}

/// Relay → participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AddPeer {
        peer_id: PeerId,
        create_offer: bool,
        user: ParticipantProfile,
        #[serde(default)]
        muted: bool,
    },
    #[serde(rename_all = "camelCase")]
    RemovePeer { peer_id: PeerId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    SessionDescription {
        peer_id: PeerId,
        session_description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: PeerId,
        icecandidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    Mute { room: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    Unmute { room: RoomId, user_id: UserId },
    Error { message: String },
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddPeer { .. } => "add-peer",
            Self::RemovePeer { .. } => "remove-peer",
            Self::SessionDescription { .. } => "session-description",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Mute { .. } => "mute",
            Self::Unmute { .. } => "unmute",
            Self::Error { .. } => "error",
        }
    }
}

/// One participant's connection to the relay. Sends are fire-and-forget
/// into the writer; a `None` from [`SignalingChannel::recv`] means the
/// channel is gone.
pub struct SignalingChannel {
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    // writer first, so `close` can drain it
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(event = msg.name(), "failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("signaling writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("unparseable signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("signaling read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("signaling reader finished");
        });

        Ok(Self {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }

    /// Channel backed by plain mpsc halves, e.g. an in-process relay.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            tasks: Vec::new(),
        }
    }

    pub fn sender(&self) -> Result<mpsc::UnboundedSender<ClientMessage>> {
        self.outbound.clone().ok_or(Error::ChannelDisconnected)
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx.send(msg).map_err(|_| Error::ChannelDisconnected),
            None => Err(Error::ChannelDisconnected),
        }
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Flushes what is already queued, then closes the socket. Other clones
    /// of the sender must be dropped first or the writer waits them out.
    pub async fn close(mut self) {
        self.outbound.take();
        let mut tasks = std::mem::take(&mut self.tasks).into_iter();
        if let Some(mut writer) = tasks.next() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_peer_uses_camel_case_payload() {
        let msg = ServerMessage::AddPeer {
            peer_id: "peer-a".into(),
            create_offer: true,
            user: ParticipantProfile {
                id: "u1".into(),
                name: "Ada".into(),
                avatar: None,
            },
            muted: false,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "add-peer",
                "data": {
                    "peerId": "peer-a",
                    "createOffer": true,
                    "user": { "id": "u1", "name": "Ada" },
                    "muted": false
                }
            })
        );
    }

    #[test]
    fn parses_browser_shaped_relay_ice() {
        let text = r#"{"event":"relay-ice","data":{"peerId":"peer-b","icecandidate":
            {"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
             "sdpMid":"0","sdpMLineIndex":0}}}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        match msg {
            ClientMessage::RelayIce {
                peer_id,
                icecandidate,
            } => {
                assert_eq!(peer_id, "peer-b");
                assert_eq!(icecandidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(icecandidate.sdp_mline_index, Some(0));
                assert!(icecandidate.username_fragment.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn add_peer_muted_defaults_to_false() {
        let text = r#"{"event":"add-peer","data":{"peerId":"p","createOffer":false,
            "user":{"id":"u","name":"n","avatar":"/a.png"}}}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(msg, ServerMessage::AddPeer { muted: false, .. }));
    }

    #[test]
    fn session_description_keeps_browser_type_field() {
        let msg = ClientMessage::RelaySdp {
            peer_id: "peer-c".into(),
            session_description: SessionDescription::answer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "relay-sdp");
        assert_eq!(value["data"]["sessionDescription"]["type"], "answer");
        assert_eq!(msg.name(), "relay-sdp");
    }

    #[tokio::test]
    async fn send_fails_once_the_relay_side_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_server_tx, server_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::from_parts(tx, server_rx);
        drop(rx);
        let err = channel
            .send(ClientMessage::Leave { room: "r".into() })
            .unwrap_err();
        assert!(matches!(err, Error::ChannelDisconnected));
    }
}
