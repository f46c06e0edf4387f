//! The local participant's chats and the handler for direct messages.
//!
//! A direct message for a chat we do not know yet opens it, with the
//! sender as the peer.

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;

use tandem_core::wire::CHAT_TAG;
use tandem_core::{DirectMessage, Envelope, Message, UniqId};

use crate::chat::{Chat, ChatError, ChatState};
use crate::chat_manager::DhtChatManager;
use crate::network::{NetworkService, Replier};
use crate::registry::HandlerHandle;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageReceived {
        chat: UniqId,
        from: UniqId,
        message: Message,
    },
}

pub struct ChatDirectory {
    own_id: UniqId,
    manager: Arc<DhtChatManager>,
    network: Arc<NetworkService>,
    chats: DashMap<UniqId, Arc<Chat>>,
    events: broadcast::Sender<ChatEvent>,
    handle: Mutex<Option<HandlerHandle>>,
}

impl ChatDirectory {
    /// Create the directory and start accepting direct messages.
    pub fn new(manager: Arc<DhtChatManager>, network: Arc<NetworkService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let directory = Arc::new(Self {
            own_id: manager.own_id(),
            manager,
            network: network.clone(),
            chats: DashMap::new(),
            events,
            handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&directory);
        let handle = network.register_handler(
            CHAT_TAG,
            Arc::new(move |envelope: &Envelope, _: &Replier| {
                on_direct_message(&weak, envelope);
            }),
        );
        if let Ok(mut slot) = directory.handle.lock() {
            *slot = Some(handle);
        }
        directory
    }

    pub fn own_id(&self) -> UniqId {
        self.own_id
    }

    /// Open (or return) the chat `id` with `peer`. Empty flow records are
    /// seeded locally so the chat can synchronize offline.
    pub fn open_chat(&self, id: UniqId, peer: UniqId) -> anyhow::Result<Arc<Chat>> {
        if let Some(chat) = self.chats.get(&id) {
            return Ok(chat.clone());
        }
        let chat = Chat::new(id, self.own_id, peer, self.manager.clone());
        self.manager.seed_flow(&chat.own_flow_id())?;
        self.manager.seed_flow(&chat.other_flow_id())?;

        let chat = self.chats.entry(id).or_insert_with(|| Arc::new(chat)).clone();
        tracing::info!(chat = %id.short(), peer = %peer.short(), "chat opened");
        Ok(chat)
    }

    pub fn chat(&self, id: &UniqId) -> Option<Arc<Chat>> {
        self.chats.get(id).map(|c| c.clone())
    }

    /// The chat whose hex id starts with `prefix`, if exactly one does.
    pub fn chat_by_prefix(&self, prefix: &str) -> Option<Arc<Chat>> {
        let prefix = prefix.to_ascii_lowercase();
        let mut matches = self
            .chats
            .iter()
            .filter(|c| c.key().dht_key().starts_with(&prefix))
            .map(|c| c.value().clone());
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    pub fn chats(&self) -> Vec<Arc<Chat>> {
        self.chats.iter().map(|c| c.value().clone()).collect()
    }

    /// Synchronize every chat. Returns the chats that failed.
    pub async fn synchronize(&self) -> Vec<(UniqId, ChatError)> {
        let chats = self.chats();
        let results = futures::future::join_all(chats.iter().map(|c| c.synchronize())).await;
        chats
            .iter()
            .zip(results)
            .filter_map(|(chat, result)| result.err().map(|e| (chat.id(), e)))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Stop accepting direct messages.
    pub fn close(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            self.network.forget_handler(CHAT_TAG, handle);
        }
    }

    async fn deliver(&self, direct: DirectMessage) {
        let DirectMessage { chat, from, message } = direct;
        if message.author != from {
            tracing::debug!(chat = %chat.short(), from = %from.short(), "author does not match sender");
            return;
        }

        let target = match self.chat(&chat) {
            Some(c) => c,
            None => match self.open_chat(chat, from) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(chat = %chat.short(), error = %e, "cannot open chat");
                    return;
                }
            },
        };
        if target.peer() != from {
            tracing::warn!(chat = %chat.short(), from = %from.short(), "message from non-member");
            return;
        }
        if target.state().await != ChatState::Ready {
            if let Err(e) = target.synchronize().await {
                tracing::warn!(chat = %chat.short(), error = %e, "cannot synchronize for inbound message");
                return;
            }
        }

        match target.receive(message.clone()).await {
            Ok(appended) => {
                tracing::debug!(
                    chat = %chat.short(),
                    msg = %message.msg_id.short(),
                    appended,
                    "message received"
                );
                let _ = self.events.send(ChatEvent::MessageReceived {
                    chat,
                    from,
                    message,
                });
            }
            Err(e) => tracing::warn!(chat = %chat.short(), error = %e, "inbound message dropped"),
        }
    }
}

impl Drop for ChatDirectory {
    fn drop(&mut self) {
        self.close();
    }
}

fn on_direct_message(directory: &Weak<ChatDirectory>, envelope: &Envelope) {
    if !envelope.is_request() {
        return;
    }
    let direct: DirectMessage = match serde_json::from_str(&envelope.data) {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!(peer = ?envelope.sender, error = %e, "bad direct message");
            return;
        }
    };
    let Some(directory) = directory.upgrade() else {
        return;
    };
    tokio::spawn(async move { directory.deliver(direct).await });
}
