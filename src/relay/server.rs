//! WebSocket front end for the relay.
//!
//! One task per connection: a writer fed from an mpsc channel and a reader
//! that hands parsed events to the shared [`Relay`]. When the socket goes
//! away for any reason the relay performs the implicit LEAVE.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::Relay;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::signaling::{ClientMessage, ServerMessage};

pub struct RelayServer {
    relay: Arc<Mutex<Relay>>,
    listener: TcpListener,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        info!("Signaling relay listening on {}", listener.local_addr()?);
        Ok(Self {
            relay: Arc::new(Mutex::new(Relay::new(config))),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Mutex<Relay>> {
        Arc::clone(&self.relay)
    }

    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let relay = Arc::clone(&self.relay);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, relay).await {
                    warn!("connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown => {
                info!("Signaling relay shutting down");
                Ok(())
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, relay: Arc<Mutex<Relay>>) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let replies = tx.clone();
    let peer_id = relay.lock().await.open_channel(tx);
    info!(peer_id = %peer_id, "New WebSocket connection from {}", addr);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(event = msg.name(), "failed to encode relay message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    debug!(peer_id = %peer_id, event = msg.name(), "signaling event");
                    relay.lock().await.dispatch(&peer_id, msg);
                }
                Err(e) => {
                    warn!(peer_id = %peer_id, "unparseable signaling frame: {}", e);
                    let reply = ServerMessage::Error {
                        message: format!("unparseable signaling frame: {e}"),
                    };
                    if replies.send(reply).is_err() {
                        debug!(peer_id = %peer_id, "channel already gone, dropping error reply");
                    }
                }
            },
            Ok(Message::Close(_)) => {
                info!(peer_id = %peer_id, "WebSocket connection closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(peer_id = %peer_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    relay.lock().await.close_channel(&peer_id);
    forward_task.abort();
    Ok(())
}
