//! Flow — one participant's append-only message log within a chat.
//!
//! New messages go to an in-memory tail. `persist` seals every full tail
//! into an immutable [`Chunk`] (content-addressed by [`ChunkId`]), uploads
//! chunks that have not been stored yet, then stores the [`FlowRecord`]
//! that lists them. Chunks are resolved lazily when history is read.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use tandem_core::{ChunkId, FlowId, Message};

use crate::chat_manager::ChatManager;

/// Messages per sealed chunk.
pub const CHUNK_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub flow: FlowId,
    pub index: u32,
    pub messages: Vec<Message>,
}

impl Chunk {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Content id: hash of the canonical bytes.
    pub fn id(&self) -> serde_json::Result<ChunkId> {
        Ok(ChunkId::of(&self.to_bytes()?))
    }
}

/// Persisted form of a flow: sealed chunk ids plus the unsealed tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow: FlowId,
    pub chunks: Vec<ChunkId>,
    pub tail: Vec<Message>,
    pub message_count: usize,
}

impl FlowRecord {
    pub fn new(flow: FlowId, chunks: Vec<ChunkId>, tail: Vec<Message>) -> Self {
        let message_count = chunks.len() * CHUNK_CAPACITY + tail.len();
        Self {
            flow,
            chunks,
            tail,
            message_count,
        }
    }

    pub fn empty(flow: FlowId) -> Self {
        Self::new(flow, Vec::new(), Vec::new())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[derive(Default)]
struct FlowState {
    chunks: Vec<ChunkId>,
    tail: Vec<Message>,
    /// Sealed chunks whose upload has not been acknowledged yet.
    unstored: Vec<Chunk>,
}

impl FlowState {
    fn len(&self) -> usize {
        self.chunks.len() * CHUNK_CAPACITY + self.tail.len()
    }
}

pub struct Flow {
    id: FlowId,
    manager: Arc<dyn ChatManager>,
    state: Mutex<FlowState>,
    /// Held across a whole persist so records are stored in append order.
    persisting: Mutex<()>,
    loaded: DashMap<u32, Arc<Chunk>>,
}

impl Flow {
    pub fn new(id: FlowId, manager: Arc<dyn ChatManager>) -> Self {
        Self::from_record(FlowRecord::empty(id), manager)
    }

    pub fn from_record(record: FlowRecord, manager: Arc<dyn ChatManager>) -> Self {
        Self {
            id: record.flow,
            manager,
            state: Mutex::new(FlowState {
                chunks: record.chunks,
                tail: record.tail,
                unstored: Vec::new(),
            }),
            persisting: Mutex::new(()),
            loaded: DashMap::new(),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub async fn add_message(&self, message: Message) {
        self.state.lock().await.tail.push(message);
    }

    /// Append `message` unless a message with the same id is already in
    /// the log. False if it was a duplicate.
    pub async fn add_unique(&self, message: Message) -> bool {
        let sealed = self.state.lock().await.chunks.len() as u32;
        for index in (0..sealed).rev() {
            match self.chunk(index).await {
                Some(chunk) if chunk.messages.iter().any(|m| m.msg_id == message.msg_id) => {
                    return false
                }
                Some(_) => {}
                None => {
                    tracing::debug!(flow = %self.id, index, "duplicate check stops at missing chunk");
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        // Chunks sealed since the scan above are still cached from `seal`.
        let resealed = (sealed..state.chunks.len() as u32).any(|index| {
            self.loaded
                .get(&index)
                .is_some_and(|c| c.messages.iter().any(|m| m.msg_id == message.msg_id))
        });
        if resealed || state.tail.iter().any(|m| m.msg_id == message.msg_id) {
            return false;
        }
        state.tail.push(message);
        true
    }

    /// Store everything appended so far. True iff every chunk and the
    /// record were acknowledged. Failed chunks are retried next time.
    pub async fn persist(&self) -> bool {
        let _persisting = self.persisting.lock().await;
        let (pending, record) = {
            let mut state = self.state.lock().await;
            self.seal(&mut state);
            let record = FlowRecord::new(self.id, state.chunks.clone(), state.tail.clone());
            (state.unstored.clone(), record)
        };

        let mut stored = HashSet::new();
        for chunk in &pending {
            if self.manager.store_chunk(chunk).await {
                stored.insert(chunk.index);
            } else {
                tracing::debug!(flow = %self.id, index = chunk.index, "chunk not stored");
            }
        }
        if !stored.is_empty() {
            self.state
                .lock()
                .await
                .unstored
                .retain(|c| !stored.contains(&c.index));
        }
        if stored.len() != pending.len() {
            return false;
        }

        let ok = self.manager.store_flow(&record).await;
        tracing::debug!(
            flow = %self.id,
            messages = record.message_count,
            chunks = record.chunks.len(),
            ok,
            "flow persisted"
        );
        ok
    }

    fn seal(&self, state: &mut FlowState) {
        while state.tail.len() >= CHUNK_CAPACITY {
            let chunk = Chunk {
                flow: self.id,
                index: state.chunks.len() as u32,
                messages: state.tail[..CHUNK_CAPACITY].to_vec(),
            };
            let id = match chunk.id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(flow = %self.id, error = %e, "failed to seal chunk");
                    return;
                }
            };
            state.tail.drain(..CHUNK_CAPACITY);
            state.chunks.push(id);
            self.loaded.insert(chunk.index, Arc::new(chunk.clone()));
            state.unstored.push(chunk);
        }
    }

    /// Committed chunk `index`, loaded through the manager on first use.
    pub async fn chunk(&self, index: u32) -> Option<Arc<Chunk>> {
        if let Some(chunk) = self.loaded.get(&index) {
            return Some(chunk.clone());
        }
        let id = *self.state.lock().await.chunks.get(index as usize)?;
        let chunk = self.manager.load_chunk(&id).await?;
        if chunk.flow != self.id || chunk.index != index {
            tracing::warn!(flow = %self.id, index, chunk = %id, "chunk belongs elsewhere");
            return None;
        }
        let chunk = Arc::new(chunk);
        self.loaded.insert(index, chunk.clone());
        Some(chunk)
    }

    /// Walk the log newest-first.
    pub async fn history(&self) -> HistoryCursor<'_> {
        let state = self.state.lock().await;
        HistoryCursor {
            flow: self,
            pending: state.tail.clone(),
            next_chunk: state.chunks.len().checked_sub(1).map(|i| i as u32),
        }
    }

    /// Up to `n` most recent messages, oldest first.
    pub async fn last_messages(&self, n: usize) -> Vec<Message> {
        let mut cursor = self.history().await;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match cursor.previous().await {
                Some(m) => out.push(m),
                None => break,
            }
        }
        out.reverse();
        out
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn tail(&self) -> Vec<Message> {
        self.state.lock().await.tail.clone()
    }

    pub async fn record(&self) -> FlowRecord {
        let state = self.state.lock().await;
        FlowRecord::new(self.id, state.chunks.clone(), state.tail.clone())
    }

    /// Adopt `record` if it holds more messages than this flow. Logs are
    /// append-only, so the longer one is the newer one.
    pub async fn replace(&self, record: FlowRecord) -> bool {
        if record.flow != self.id {
            return false;
        }
        let mut state = self.state.lock().await;
        if record.message_count <= state.len() {
            return false;
        }
        tracing::debug!(
            flow = %self.id,
            from = state.len(),
            to = record.message_count,
            "adopting newer flow record"
        );
        state.chunks = record.chunks;
        state.tail = record.tail;
        state.unstored.clear();
        self.loaded.clear();
        true
    }
}

/// Newest-first iterator over a flow's messages. Chunks are fetched as the
/// cursor reaches them.
pub struct HistoryCursor<'a> {
    flow: &'a Flow,
    pending: Vec<Message>,
    next_chunk: Option<u32>,
}

impl HistoryCursor<'_> {
    /// The next older message, or None at the start of the log or when a
    /// chunk cannot be resolved.
    pub async fn previous(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.pending.pop() {
                return Some(message);
            }
            let index = self.next_chunk?;
            self.next_chunk = index.checked_sub(1);
            match self.flow.chunk(index).await {
                Some(chunk) => self.pending = chunk.messages.clone(),
                None => {
                    tracing::debug!(flow = %self.flow.id, index, "history stops at missing chunk");
                    self.next_chunk = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tandem_core::UniqId;

    use crate::testing::FakeManager;

    fn flow_id() -> FlowId {
        FlowId::new(UniqId::random(), UniqId::random())
    }

    fn msg(author: UniqId, i: usize) -> Message {
        Message::with_timestamp(author, i as u64, format!("message {i}"))
    }

    #[tokio::test]
    async fn persist_seals_full_chunks() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Flow::new(id, manager.clone());
        for i in 0..70 {
            flow.add_message(msg(id.owner, i)).await;
        }

        assert!(flow.persist().await);
        let record = manager.flow(&id).unwrap();
        assert_eq!(record.chunks.len(), 2);
        assert_eq!(record.tail.len(), 6);
        assert_eq!(record.message_count, 70);
        assert_eq!(manager.chunk_count(), 2);
    }

    #[tokio::test]
    async fn history_resolves_chunks_lazily() {
        let manager = FakeManager::new();
        let id = flow_id();
        let writer = Flow::new(id, manager.clone());
        for i in 0..70 {
            writer.add_message(msg(id.owner, i)).await;
        }
        assert!(writer.persist().await);

        let reader = Flow::from_record(manager.flow(&id).unwrap(), manager.clone());
        let recent = reader.last_messages(5).await;
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[4].text, "message 69");
        assert_eq!(manager.chunk_loads.load(Ordering::SeqCst), 0);

        let mut cursor = reader.history().await;
        let mut all = Vec::new();
        while let Some(m) = cursor.previous().await {
            all.push(m.text);
        }
        assert_eq!(all.len(), 70);
        assert_eq!(all[0], "message 69");
        assert_eq!(all[69], "message 0");
        assert_eq!(manager.chunk_loads.load(Ordering::SeqCst), 2);

        // Cached after first use.
        reader.last_messages(70).await;
        assert_eq!(manager.chunk_loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_chunks_are_retried() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Flow::new(id, manager.clone());
        for i in 0..40 {
            flow.add_message(msg(id.owner, i)).await;
        }

        manager.fail_chunks.store(true, Ordering::SeqCst);
        assert!(!flow.persist().await);
        assert!(manager.flow(&id).is_none());

        flow.add_message(msg(id.owner, 40)).await;
        manager.fail_chunks.store(false, Ordering::SeqCst);
        assert!(flow.persist().await);
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(manager.flow(&id).unwrap().message_count, 41);
    }

    #[tokio::test]
    async fn record_failure_reports_false() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Flow::new(id, manager.clone());
        flow.add_message(msg(id.owner, 0)).await;
        manager.fail_flows.store(true, Ordering::SeqCst);
        assert!(!flow.persist().await);
        assert_eq!(flow.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_survive_persist() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Arc::new(Flow::new(id, manager.clone()));

        let mut tasks = Vec::new();
        for i in 0..100 {
            let flow = flow.clone();
            tasks.push(tokio::spawn(async move {
                flow.add_message(msg(id.owner, i)).await;
                if i % 10 == 0 {
                    flow.persist().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(flow.persist().await);

        let record = manager.flow(&id).unwrap();
        assert_eq!(record.message_count, 100);
        let reader = Flow::from_record(record, manager.clone());
        let mut texts: Vec<_> = reader.last_messages(100).await.into_iter().map(|m| m.text).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), 100);
    }

    #[tokio::test]
    async fn overlapping_persists_store_the_newest_record() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Flow::new(id, manager.clone());
        manager.slow_flow_count.store(1, Ordering::SeqCst);

        flow.add_message(msg(id.owner, 0)).await;
        let (first, second) = tokio::join!(flow.persist(), async {
            flow.add_message(msg(id.owner, 1)).await;
            flow.persist().await
        });

        assert!(first && second);
        assert_eq!(manager.flow(&id).unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn add_unique_sees_sealed_messages() {
        let manager = FakeManager::new();
        let id = flow_id();
        let writer = Flow::new(id, manager.clone());
        for i in 0..CHUNK_CAPACITY + 3 {
            writer.add_message(msg(id.owner, i)).await;
        }
        assert!(writer.persist().await);

        let reader = Flow::new(id, manager.clone());
        assert!(reader.replace(manager.flow(&id).unwrap()).await);
        assert!(!reader.add_unique(msg(id.owner, 0)).await);
        assert!(!reader.add_unique(msg(id.owner, CHUNK_CAPACITY + 1)).await);
        assert!(reader.add_unique(msg(id.owner, 999)).await);
        assert_eq!(reader.len().await, CHUNK_CAPACITY + 4);
    }

    #[tokio::test]
    async fn replace_adopts_only_longer_records() {
        let manager = FakeManager::new();
        let id = flow_id();
        let flow = Flow::new(id, manager.clone());
        flow.add_message(msg(id.owner, 0)).await;
        flow.add_message(msg(id.owner, 1)).await;

        let shorter = FlowRecord::new(id, Vec::new(), vec![msg(id.owner, 0)]);
        assert!(!flow.replace(shorter).await);

        let longer = FlowRecord::new(id, Vec::new(), (0..3).map(|i| msg(id.owner, i)).collect());
        assert!(flow.replace(longer).await);
        assert_eq!(flow.len().await, 3);

        let foreign = FlowRecord::new(flow_id(), Vec::new(), (0..9).map(|i| msg(id.owner, i)).collect());
        assert!(!flow.replace(foreign).await);
    }

    #[test]
    fn chunk_id_tracks_content() {
        let id = flow_id();
        let a = Chunk { flow: id, index: 0, messages: vec![msg(id.owner, 1)] };
        let mut b = a.clone();
        assert_eq!(a.id().unwrap(), b.id().unwrap());
        b.messages[0].text.push('!');
        assert_ne!(a.id().unwrap(), b.id().unwrap());
    }
}
