//! Fully replicated DHT spoken over the protocol engine on tag `DHT`.
//!
//! Every node keeps a replica of whatever was stored to it and a routing
//! table of user id → address learned from `hello` requests. There is no
//! bucket maintenance: stores go to every known peer, lookups ask peers
//! one by one.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tandem_core::wire::DHT_TAG;
use tandem_core::{Envelope, UniqId};

use crate::dht::Dht;
use crate::network::{NetworkService, Replier};
use crate::registry::HandlerHandle;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum DhtRequest {
    Store { key: String, data: String },
    Retrieve { key: String },
    Find { user: UniqId },
    Hello { user: UniqId },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreReply {
    stored: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RetrieveReply {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FindReply {
    #[serde(default)]
    address: Option<SocketAddr>,
}

/// State shared with the request handler.
#[derive(Default)]
struct Replica {
    entries: DashMap<String, Vec<u8>>,
    routes: DashMap<UniqId, SocketAddr>,
}

impl Replica {
    fn handle(&self, envelope: &Envelope, replier: &Replier) {
        let request: DhtRequest = match serde_json::from_str(&envelope.data) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(peer = ?envelope.sender, error = %e, "bad DHT request");
                return;
            }
        };

        match request {
            DhtRequest::Store { key, data } => {
                let stored = match STANDARD.decode(data.as_bytes()) {
                    Ok(bytes) => {
                        tracing::trace!(key = %key, len = bytes.len(), "replica stored");
                        self.entries.insert(key, bytes);
                        true
                    }
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "store with invalid base64");
                        false
                    }
                };
                replier.respond_json(envelope, &StoreReply { stored });
            }
            DhtRequest::Retrieve { key } => {
                let data = self.entries.get(&key).map(|v| STANDARD.encode(v.value()));
                replier.respond_json(envelope, &RetrieveReply { data });
            }
            DhtRequest::Find { user } => {
                let address = self.routes.get(&user).map(|a| *a);
                replier.respond_json(envelope, &FindReply { address });
            }
            DhtRequest::Hello { user } => {
                if let Some(sender) = envelope.sender {
                    tracing::debug!(user = %user.short(), peer = %sender, "peer said hello");
                    self.routes.insert(user, sender);
                }
            }
        }
    }
}

pub struct PeerDht {
    own_id: UniqId,
    network: Arc<NetworkService>,
    replica: Arc<Replica>,
    handle: Mutex<Option<HandlerHandle>>,
}

impl PeerDht {
    /// Create the DHT node and register its request handler.
    pub fn new(own_id: UniqId, network: Arc<NetworkService>) -> Arc<Self> {
        let replica = Arc::new(Replica::default());
        let handler = replica.clone();
        let handle = network.register_handler(
            DHT_TAG,
            Arc::new(move |envelope: &Envelope, replier: &Replier| {
                if envelope.is_request() {
                    handler.handle(envelope, replier);
                }
            }),
        );
        Arc::new(Self {
            own_id,
            network,
            replica,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Unregister the request handler. The node stops answering peers.
    pub fn close(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            self.network.forget_handler(DHT_TAG, handle);
        }
    }

    pub fn known_peers(&self) -> usize {
        self.peers().len()
    }

    /// Distinct addresses in the routing table, our own excluded.
    fn peers(&self) -> Vec<SocketAddr> {
        let own = self.network.local_addr();
        let mut seen = HashSet::new();
        self.replica
            .routes
            .iter()
            .filter(|r| *r.key() != self.own_id)
            .map(|r| *r.value())
            .filter(|addr| Some(*addr) != own && seen.insert(*addr))
            .collect()
    }
}

#[async_trait]
impl Dht for PeerDht {
    async fn store(&self, key: &str, data: Vec<u8>) -> bool {
        let request = DhtRequest::Store {
            key: key.to_string(),
            data: STANDARD.encode(&data),
        };
        self.replica.entries.insert(key.to_string(), data);

        let peers = self.peers();
        // Count replicas that confirmed the write.
        let replies: Vec<Option<StoreReply>> = futures::future::join_all(
            peers
                .iter()
                .map(|addr| self.network.send_get_json(*addr, DHT_TAG, &request, None)),
        )
        .await;
        let replicas = replies
            .iter()
            .filter(|r| matches!(r, Some(StoreReply { stored: true })))
            .count();
        tracing::debug!(key, peers = peers.len(), replicas, "DHT store");
        replicas > 0
    }

    async fn retrieve(&self, key: &str) -> Option<Vec<u8>> {
        let request = DhtRequest::Retrieve {
            key: key.to_string(),
        };
        for addr in self.peers() {
            let reply: Option<RetrieveReply> = self
                .network
                .send_get_json(addr, DHT_TAG, &request, None)
                .await;
            let Some(data) = reply.and_then(|r| r.data) else {
                continue;
            };
            match STANDARD.decode(data.as_bytes()) {
                Ok(bytes) => {
                    self.replica.entries.insert(key.to_string(), bytes.clone());
                    return Some(bytes);
                }
                Err(e) => tracing::debug!(key, peer = %addr, error = %e, "invalid base64 from peer"),
            }
        }
        self.replica.entries.get(key).map(|v| v.clone())
    }

    async fn connect_to(&self, peer: UniqId, addr: SocketAddr) {
        self.replica.routes.insert(peer, addr);
        let hello = DhtRequest::Hello { user: self.own_id };
        if self.network.send_post_json(addr, DHT_TAG, &hello, None).await {
            tracing::info!(peer = %peer.short(), %addr, "connected to peer");
        } else {
            tracing::warn!(peer = %peer.short(), %addr, "peer did not answer hello");
        }
    }

    async fn find(&self, peer: UniqId) -> Option<SocketAddr> {
        if let Some(addr) = self.replica.routes.get(&peer) {
            return Some(*addr);
        }
        let request = DhtRequest::Find { user: peer };
        for addr in self.peers() {
            let reply: Option<FindReply> = self
                .network
                .send_get_json(addr, DHT_TAG, &request, None)
                .await;
            if let Some(found) = reply.and_then(|r| r.address) {
                self.replica.routes.insert(peer, found);
                return Some(found);
            }
        }
        tracing::debug!(peer = %peer.short(), "peer not found");
        None
    }
}

impl Drop for PeerDht {
    fn drop(&mut self) {
        self.close();
    }
}
