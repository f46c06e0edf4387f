//! tandem integration test harness.
//!
//! Every test builds its own set of nodes on an in-process
//! `MemoryNetwork` (or loopback TCP) and tears them down when it returns.
//! Nodes use the full stack: protocol engine, peer DHT, chat manager and
//! chat directory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use tandem_core::{Message, UniqId};
use tandem_services::{
    ChatDirectory, ChatEvent, DhtChatManager, MemoryNetwork, MemoryStore, NetworkService, PeerDht,
    Transport,
};

mod dht;
mod messaging;
mod protocol;
mod tcp;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

pub struct Node {
    pub id: UniqId,
    pub addr: SocketAddr,
    pub network: Arc<NetworkService>,
    pub dht: Arc<PeerDht>,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<ChatDirectory>,
}

impl Node {
    pub async fn stop(&self) {
        self.directory.close();
        self.dht.close();
        self.network.stop().await;
    }
}

/// Start a node with the full stack on top of `transport`.
pub async fn spawn_node_on(
    transport: Arc<dyn Transport>,
    bind: Option<SocketAddr>,
    id: UniqId,
) -> Result<Node> {
    let network = NetworkService::new(transport, REQUEST_TIMEOUT);
    let addr = network.start(bind).await.context("failed to start node")?;
    let dht = PeerDht::new(id, network.clone());
    let store = Arc::new(MemoryStore::new());
    let manager = DhtChatManager::new(id, dht.clone(), store.clone(), network.clone());
    let directory = ChatDirectory::new(manager, network.clone());
    Ok(Node {
        id,
        addr,
        network,
        dht,
        store,
        directory,
    })
}

pub async fn spawn_node(net: &Arc<MemoryNetwork>) -> Result<Node> {
    spawn_node_on(net.transport(), None, UniqId::random()).await
}

/// Next `MessageReceived` event, or an error after `timeout`.
pub async fn next_message(
    events: &mut broadcast::Receiver<ChatEvent>,
    timeout: Duration,
) -> Result<(UniqId, UniqId, Message)> {
    match tokio::time::timeout(timeout, events.recv()).await {
        Ok(Ok(ChatEvent::MessageReceived {
            chat,
            from,
            message,
        })) => Ok((chat, from, message)),
        Ok(Err(e)) => bail!("event stream failed: {e}"),
        Err(_) => bail!("no message within {timeout:?}"),
    }
}
