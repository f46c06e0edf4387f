//! DHT contract used for peer address resolution and for parking
//! conversation state while the other side is offline.
//!
//! Implementations are eventually consistent and may lose data; callers
//! treat a `false`/`None` as "not now", never as a hard error.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use tandem_core::UniqId;

#[async_trait]
pub trait Dht: Send + Sync {
    /// True iff the write was acknowledged by the DHT.
    async fn store(&self, key: &str, data: Vec<u8>) -> bool;

    async fn retrieve(&self, key: &str) -> Option<Vec<u8>>;

    /// Introduce a peer so later lookups can reach it.
    async fn connect_to(&self, peer: UniqId, addr: SocketAddr);

    /// Current transport address of `peer`, if known.
    async fn find(&self, peer: UniqId) -> Option<SocketAddr>;
}

/// Process-wide DHT backed by shared maps. Every node holding the same
/// `Arc<MemoryDht>` sees the same data.
#[derive(Default)]
pub struct MemoryDht {
    entries: DashMap<String, Vec<u8>>,
    routes: DashMap<UniqId, SocketAddr>,
    unavailable: AtomicBool,
}

impl MemoryDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While unavailable every operation fails as if the network were down.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn store(&self, key: &str, data: Vec<u8>) -> bool {
        if !self.available() {
            return false;
        }
        self.entries.insert(key.to_string(), data);
        true
    }

    async fn retrieve(&self, key: &str) -> Option<Vec<u8>> {
        if !self.available() {
            return None;
        }
        self.entries.get(key).map(|v| v.clone())
    }

    async fn connect_to(&self, peer: UniqId, addr: SocketAddr) {
        if self.available() {
            self.routes.insert(peer, addr);
        }
    }

    async fn find(&self, peer: UniqId) -> Option<SocketAddr> {
        if !self.available() {
            return None;
        }
        self.routes.get(&peer).map(|a| *a)
    }
}
