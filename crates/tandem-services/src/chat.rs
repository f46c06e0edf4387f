//! A two-party conversation.
//!
//! Each side writes only the flow addressed to the other side
//! (`other_flow`, keyed by the peer's id) and reads the flow addressed to
//! itself (`own_flow`, keyed by its own id). Sending races a direct POST
//! against persisting `other_flow`; the combination of outcomes is the
//! message status.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use tandem_core::{FlowId, Message, MessageStatus, UniqId};

use crate::chat_manager::ChatManager;
use crate::flow::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Unsynchronized,
    Ready,
    Failed,
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsynchronized => "unsynchronized",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat {chat} is {state}, synchronize it first")]
    NotReady { chat: UniqId, state: ChatState },
    #[error("flow {0} could not be loaded")]
    FlowUnavailable(FlowId),
}

struct Flows {
    own: Arc<Flow>,
    other: Arc<Flow>,
}

enum Phase {
    Unsynchronized,
    Ready(Flows),
    Failed,
}

impl Phase {
    fn state(&self) -> ChatState {
        match self {
            Self::Unsynchronized => ChatState::Unsynchronized,
            Self::Ready(_) => ChatState::Ready,
            Self::Failed => ChatState::Failed,
        }
    }
}

pub struct Chat {
    id: UniqId,
    own_id: UniqId,
    peer: UniqId,
    manager: Arc<dyn ChatManager>,
    phase: RwLock<Phase>,
}

impl Chat {
    pub fn new(id: UniqId, own_id: UniqId, peer: UniqId, manager: Arc<dyn ChatManager>) -> Self {
        Self {
            id,
            own_id,
            peer,
            manager,
            phase: RwLock::new(Phase::Unsynchronized),
        }
    }

    pub fn id(&self) -> UniqId {
        self.id
    }

    pub fn peer(&self) -> UniqId {
        self.peer
    }

    /// Flow holding messages addressed to us.
    pub fn own_flow_id(&self) -> FlowId {
        FlowId::new(self.id, self.own_id)
    }

    /// Flow holding messages we send to the peer.
    pub fn other_flow_id(&self) -> FlowId {
        FlowId::new(self.id, self.peer)
    }

    pub async fn state(&self) -> ChatState {
        self.phase.read().await.state()
    }

    /// Resolve both flows. On a chat that is already ready, newer records
    /// are adopted into the existing flows.
    pub async fn synchronize(&self) -> Result<(), ChatError> {
        let own_id = self.own_flow_id();
        let other_id = self.other_flow_id();
        let (own, other) = tokio::join!(
            self.manager.load_flow(&own_id),
            self.manager.load_flow(&other_id)
        );

        let mut phase = self.phase.write().await;
        let (own, other) = match (own, other) {
            (Some(own), Some(other)) => (own, other),
            (own, _) => {
                let missing = if own.is_none() { own_id } else { other_id };
                tracing::warn!(chat = %self.id.short(), flow = %missing, "synchronize failed");
                // A ready chat keeps its flows and any unpersisted appends.
                if !matches!(*phase, Phase::Ready(_)) {
                    *phase = Phase::Failed;
                }
                return Err(ChatError::FlowUnavailable(missing));
            }
        };

        if let Phase::Ready(flows) = &*phase {
            flows.own.replace(own).await;
            flows.other.replace(other).await;
        } else {
            *phase = Phase::Ready(Flows {
                own: Arc::new(Flow::from_record(own, self.manager.clone())),
                other: Arc::new(Flow::from_record(other, self.manager.clone())),
            });
        }
        tracing::debug!(chat = %self.id.short(), "chat synchronized");
        Ok(())
    }

    pub async fn own_flow(&self) -> Option<Arc<Flow>> {
        match &*self.phase.read().await {
            Phase::Ready(flows) => Some(flows.own.clone()),
            _ => None,
        }
    }

    pub async fn other_flow(&self) -> Option<Arc<Flow>> {
        match &*self.phase.read().await {
            Phase::Ready(flows) => Some(flows.other.clone()),
            _ => None,
        }
    }

    async fn ready_flows(&self) -> Result<(Arc<Flow>, Arc<Flow>), ChatError> {
        match &*self.phase.read().await {
            Phase::Ready(flows) => Ok((flows.own.clone(), flows.other.clone())),
            phase => Err(ChatError::NotReady {
                chat: self.id,
                state: phase.state(),
            }),
        }
    }

    /// Append `message` to the peer's flow, persist it and try the peer
    /// directly, all at once. The message stays in the flow whatever the
    /// outcome.
    pub async fn send_message(&self, message: Message) -> Result<MessageStatus, ChatError> {
        let (_, other) = self.ready_flows().await?;

        let (_, persist_ok, direct_ok) = tokio::join!(
            other.add_message(message.clone()),
            other.persist(),
            self.manager
                .send_direct_message(self.peer, self.id, &message)
        );

        let status = MessageStatus::from_outcome(direct_ok, persist_ok);
        tracing::info!(
            chat = %self.id.short(),
            msg = %message.msg_id.short(),
            direct_ok,
            persist_ok,
            ?status,
            "message sent"
        );
        Ok(status)
    }

    /// Mirror a message the peer delivered directly. False if our flow
    /// already holds it.
    pub async fn receive(&self, message: Message) -> Result<bool, ChatError> {
        let (own, _) = self.ready_flows().await?;
        Ok(own.add_unique(message).await)
    }
}
