//! Chat messages and delivery status.

use serde::{Deserialize, Serialize};

use crate::ids::UniqId;

/// One chat message. Flows store messages; the delivery status of a send
/// attempt is never part of the stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// BLAKE3 hash of author + timestamp + text.
    pub msg_id: UniqId,
    pub author: UniqId,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub text: String,
}

impl Message {
    /// Create a text message stamped with the current time.
    pub fn text(author: UniqId, text: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::with_timestamp(author, timestamp, text)
    }

    pub fn with_timestamp(author: UniqId, timestamp: u64, text: impl Into<String>) -> Self {
        let text = text.into();
        let msg_id = UniqId::derive(
            author.as_bytes(),
            &[&timestamp.to_le_bytes()[..], text.as_bytes()],
        );
        Self {
            msg_id,
            author,
            timestamp,
            text,
        }
    }
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    /// The peer was reachable and acknowledged receipt.
    Delivered,
    /// The peer was unreachable but the message is stored in the DHT.
    Sent,
    /// Neither path succeeded. The message only lives in the local flow.
    Error,
}

impl MessageStatus {
    /// Direct delivery wins regardless of persistence.
    pub fn from_outcome(direct_ok: bool, persist_ok: bool) -> Self {
        match (direct_ok, persist_ok) {
            (true, _) => Self::Delivered,
            (false, true) => Self::Sent,
            (false, false) => Self::Error,
        }
    }
}

/// Payload of a direct chat POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub chat: UniqId,
    pub from: UniqId,
    pub message: Message,
}
