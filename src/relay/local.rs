use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::Relay;
use crate::config::RelayConfig;
use crate::signaling::{PeerId, SignalingChannel};

/// The relay without a socket: channels opened here exchange events with it
/// in-process. Closing the returned channel behaves like a socket close.
#[derive(Clone)]
pub struct LocalRelay {
    relay: Arc<Mutex<Relay>>,
}

impl LocalRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            relay: Arc::new(Mutex::new(Relay::new(config))),
        }
    }

    pub fn relay(&self) -> Arc<Mutex<Relay>> {
        Arc::clone(&self.relay)
    }

    pub async fn open_channel(&self) -> (PeerId, SignalingChannel) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let peer_id = self.relay.lock().await.open_channel(server_tx);

        let relay = Arc::clone(&self.relay);
        let id = peer_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = client_rx.recv().await {
                relay.lock().await.dispatch(&id, msg);
            }
            relay.lock().await.close_channel(&id);
        });

        (peer_id, SignalingChannel::from_parts(client_tx, server_rx))
    }

    /// Severs a channel from the relay side, as if its socket dropped.
    pub async fn drop_channel(&self, peer_id: &PeerId) {
        self.relay.lock().await.close_channel(peer_id);
    }
}
