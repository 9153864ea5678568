//! One visit to one room.
//!
//! [`RoomSession::join`] takes ownership of a signaling channel, acquires the
//! microphone and spawns the session loop. Signaling events, link callbacks
//! and local commands are all handled by that single task. Whatever way the
//! loop ends (explicit leave, the handle being dropped, channel loss) the
//! links are closed and the channel is closed after them.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::{LinkEvent, MediaBackend};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::peer::{PeerManager, RosterEntry};
use crate::signaling::{ParticipantProfile, RoomId, SignalingChannel};

enum Command {
    SetMuted(bool, oneshot::Sender<Result<()>>),
    Leave,
}

enum Exit {
    Leave,
    Disconnected,
}

pub struct RoomSession {
    commands: mpsc::UnboundedSender<Command>,
    roster: watch::Receiver<Vec<RosterEntry>>,
    task: JoinHandle<Result<()>>,
}

impl RoomSession {
    /// Joins `room` over `channel`. On failure the channel is closed before
    /// returning.
    pub async fn join<B: MediaBackend>(
        backend: Arc<B>,
        channel: SignalingChannel,
        room: RoomId,
        profile: ParticipantProfile,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let signaling = match channel.sender() {
            Ok(tx) => tx,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut manager = PeerManager::new(
            backend,
            config,
            room,
            profile,
            signaling,
            link_tx,
            EventSink::new(event_tx),
        );
        if let Err(e) = manager.start().await {
            error!("could not join room: {}", e);
            drop(manager);
            channel.close().await;
            return Err(e);
        }

        let roster = manager.subscribe_roster();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(manager, channel, link_rx, command_rx));

        Ok((
            Self {
                commands,
                roster,
                task,
            },
            event_rx,
        ))
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SetMuted(muted, reply))
            .map_err(|_| Error::ChannelDisconnected)?;
        response.await.map_err(|_| Error::ChannelDisconnected)?
    }

    /// Latest roster snapshot, updated whenever the roster changes.
    pub fn roster(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.clone()
    }

    /// Leaves the room and waits for teardown to finish. Fails with
    /// `ChannelDisconnected` if the channel was already lost.
    pub async fn leave(self) -> Result<()> {
        let _ = self.commands.send(Command::Leave);
        self.finished().await
    }

    /// Waits for the session loop to end on its own.
    pub async fn finished(self) -> Result<()> {
        self.task.await.map_err(anyhow::Error::from)?
    }
}

async fn run<B: MediaBackend>(
    mut manager: PeerManager<B>,
    mut channel: SignalingChannel,
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent<B::Inbound>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let exit = loop {
        tokio::select! {
            msg = channel.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = manager.handle_server_message(msg).await {
                        error!("signaling failed: {}", e);
                        break Exit::Disconnected;
                    }
                }
                None => {
                    error!("signaling channel closed by relay");
                    break Exit::Disconnected;
                }
            },
            Some(event) = link_rx.recv() => {
                if let Err(e) = manager.handle_link_event(event).await {
                    error!("signaling failed: {}", e);
                    break Exit::Disconnected;
                }
            }
            command = commands.recv() => match command {
                Some(Command::SetMuted(muted, reply)) => {
                    let _ = reply.send(manager.set_muted(muted));
                }
                Some(Command::Leave) => break Exit::Leave,
                None => {
                    debug!("session handle dropped, leaving");
                    break Exit::Leave;
                }
            },
        }
    };

    let result = match exit {
        Exit::Leave => manager.leave().await,
        Exit::Disconnected => {
            manager.teardown().await;
            Err(Error::ChannelDisconnected)
        }
    };
    drop(manager);
    channel.close().await;
    info!("session closed");
    result
}
