//! Where flows and chunks live, and how a message reaches the peer directly.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use tandem_core::wire::CHAT_TAG;
use tandem_core::{ChunkId, DirectMessage, FlowId, Message, UniqId};

use crate::dht::Dht;
use crate::flow::{Chunk, FlowRecord};
use crate::network::NetworkService;
use crate::storage::BlobStore;

#[async_trait]
pub trait ChatManager: Send + Sync {
    async fn load_flow(&self, flow: &FlowId) -> Option<FlowRecord>;

    /// True iff the record reached durable shared storage.
    async fn store_flow(&self, record: &FlowRecord) -> bool;

    async fn load_chunk(&self, id: &ChunkId) -> Option<Chunk>;

    async fn store_chunk(&self, chunk: &Chunk) -> bool;

    /// True iff the peer acknowledged the message.
    async fn send_direct_message(&self, peer: UniqId, chat: UniqId, message: &Message) -> bool;
}

/// Keeps a local copy of everything in a [`BlobStore`] and replicates it
/// through the [`Dht`]. Direct messages go over the protocol engine.
pub struct DhtChatManager {
    own_id: UniqId,
    dht: Arc<dyn Dht>,
    store: Arc<dyn BlobStore>,
    network: Arc<NetworkService>,
}

impl DhtChatManager {
    pub fn new(
        own_id: UniqId,
        dht: Arc<dyn Dht>,
        store: Arc<dyn BlobStore>,
        network: Arc<NetworkService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_id,
            dht,
            store,
            network,
        })
    }

    pub fn own_id(&self) -> UniqId {
        self.own_id
    }

    /// Write an empty record locally unless one exists, so a new chat can
    /// synchronize without the network.
    pub fn seed_flow(&self, flow: &FlowId) -> anyhow::Result<()> {
        let key = flow.key();
        if !self.store.contains(&key) {
            self.store.put(&key, &FlowRecord::empty(*flow).to_bytes()?)?;
            tracing::debug!(%flow, "seeded empty flow");
        }
        Ok(())
    }

    fn local(&self, key: &UniqId) -> Option<Bytes> {
        match self.store.get(key) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(key = %key.short(), error = %e, "local read failed");
                None
            }
        }
    }

    fn cache(&self, key: &UniqId, data: &[u8]) {
        if let Err(e) = self.store.put(key, data) {
            tracing::warn!(key = %key.short(), error = %e, "local write failed");
        }
    }

    fn decode_record(flow: &FlowId, data: &[u8], source: &str) -> Option<FlowRecord> {
        match FlowRecord::from_bytes(data) {
            Ok(record) if record.flow == *flow => Some(record),
            Ok(_) => {
                tracing::warn!(%flow, source, "record for another flow");
                None
            }
            Err(e) => {
                tracing::warn!(%flow, source, error = %e, "undecodable flow record");
                None
            }
        }
    }

    fn decode_chunk(id: &ChunkId, data: &[u8], source: &str) -> Option<Chunk> {
        if ChunkId::of(data) != *id {
            tracing::warn!(chunk = %id, source, "chunk content does not match its id");
            return None;
        }
        match Chunk::from_bytes(data) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                tracing::warn!(chunk = %id, source, error = %e, "undecodable chunk");
                None
            }
        }
    }
}

#[async_trait]
impl ChatManager for DhtChatManager {
    async fn load_flow(&self, flow: &FlowId) -> Option<FlowRecord> {
        let key = flow.key();
        let local = self
            .local(&key)
            .and_then(|data| Self::decode_record(flow, &data, "local"));
        let remote = self
            .dht
            .retrieve(&key.dht_key())
            .await
            .and_then(|data| Self::decode_record(flow, &data, "dht").map(|r| (r, data)));

        match (local, remote) {
            (Some(local), Some((remote, data))) if remote.message_count > local.message_count => {
                self.cache(&key, &data);
                Some(remote)
            }
            (None, Some((remote, data))) => {
                self.cache(&key, &data);
                Some(remote)
            }
            (local, _) => local,
        }
    }

    async fn store_flow(&self, record: &FlowRecord) -> bool {
        let key = record.flow.key();
        let data = match record.to_bytes() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(flow = %record.flow, error = %e, "failed to encode flow record");
                return false;
            }
        };
        self.cache(&key, &data);
        self.dht.store(&key.dht_key(), data).await
    }

    async fn load_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        let key = id.key();
        if let Some(chunk) = self
            .local(&key)
            .and_then(|data| Self::decode_chunk(id, &data, "local"))
        {
            return Some(chunk);
        }
        let data = self.dht.retrieve(&key.dht_key()).await?;
        let chunk = Self::decode_chunk(id, &data, "dht")?;
        self.cache(&key, &data);
        Some(chunk)
    }

    async fn store_chunk(&self, chunk: &Chunk) -> bool {
        let data = match chunk.to_bytes() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(flow = %chunk.flow, error = %e, "failed to encode chunk");
                return false;
            }
        };
        let key = ChunkId::of(&data).key();
        self.cache(&key, &data);
        self.dht.store(&key.dht_key(), data).await
    }

    async fn send_direct_message(&self, peer: UniqId, chat: UniqId, message: &Message) -> bool {
        let Some(addr) = self.dht.find(peer).await else {
            tracing::debug!(peer = %peer.short(), "peer address unknown");
            return false;
        };
        let body = DirectMessage {
            chat,
            from: self.own_id,
            message: message.clone(),
        };
        let delivered = self.network.send_post_json(addr, CHAT_TAG, &body, None).await;
        tracing::debug!(peer = %peer.short(), %addr, chat = %chat.short(), delivered, "direct send");
        delivered
    }
}
