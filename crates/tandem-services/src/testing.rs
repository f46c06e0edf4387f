//! In-memory `ChatManager` for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use tandem_core::{ChunkId, FlowId, Message, UniqId};

use crate::chat_manager::ChatManager;
use crate::flow::{Chunk, FlowRecord};

#[derive(Default)]
pub struct FakeManager {
    flows: DashMap<FlowId, FlowRecord>,
    chunks: DashMap<ChunkId, Chunk>,
    pub fail_chunks: AtomicBool,
    pub fail_flows: AtomicBool,
    pub fail_loads: AtomicBool,
    pub direct_ok: AtomicBool,
    pub chunk_loads: AtomicUsize,
    /// Records with this many messages are stored after a delay.
    pub slow_flow_count: AtomicUsize,
    pub direct: Mutex<Vec<(UniqId, UniqId, Message)>>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flow(&self, id: &FlowId) -> Option<FlowRecord> {
        self.flows.get(id).map(|r| r.clone())
    }

    pub fn seed(&self, record: FlowRecord) {
        self.flows.insert(record.flow, record);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl ChatManager for FakeManager {
    async fn load_flow(&self, flow: &FlowId) -> Option<FlowRecord> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return None;
        }
        self.flow(flow)
    }

    async fn store_flow(&self, record: &FlowRecord) -> bool {
        if self.fail_flows.load(Ordering::SeqCst) {
            return false;
        }
        let slow = self.slow_flow_count.load(Ordering::SeqCst);
        if slow != 0 && record.message_count == slow {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.flows.insert(record.flow, record.clone());
        true
    }

    async fn load_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        self.chunk_loads.fetch_add(1, Ordering::SeqCst);
        self.chunks.get(id).map(|c| c.clone())
    }

    async fn store_chunk(&self, chunk: &Chunk) -> bool {
        if self.fail_chunks.load(Ordering::SeqCst) {
            return false;
        }
        match chunk.id() {
            Ok(id) => {
                self.chunks.insert(id, chunk.clone());
                true
            }
            Err(_) => false,
        }
    }

    async fn send_direct_message(&self, peer: UniqId, chat: UniqId, message: &Message) -> bool {
        self.direct
            .lock()
            .unwrap()
            .push((peer, chat, message.clone()));
        self.direct_ok.load(Ordering::SeqCst)
    }
}
