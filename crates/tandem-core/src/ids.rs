//! Identifiers — users, conversations, flows and chunks.
//!
//! Every identifier is 32 bytes and hex-encoded on the wire. Flow ids are
//! derived from (conversation, owner) so any participant computes the same
//! DHT key independently; chunk ids are the BLAKE3 hash of the chunk bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Domain separator for flow key derivation. Must never change.
const FLOW_DOMAIN: &[u8] = b"tandem.flow";

/// 32-byte identifier used for users and conversations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqId([u8; 32]);

impl UniqId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Deterministic identifier: BLAKE3 over a domain string and parts.
    pub fn derive(domain: &[u8], parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain);
        for part in parts {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key under which this id is stored in the DHT and in local storage.
    pub fn dht_key(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for UniqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for UniqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqId({})", self.short())
    }
}

impl FromStr for UniqId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdError::WrongLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for UniqId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for UniqId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of one participant's log within one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId {
    pub chat: UniqId,
    pub owner: UniqId,
}

impl FlowId {
    pub fn new(chat: UniqId, owner: UniqId) -> Self {
        Self { chat, owner }
    }

    /// Lookup key shared by every participant.
    pub fn key(&self) -> UniqId {
        UniqId::derive(FLOW_DOMAIN, &[&self.chat.as_bytes()[..], &self.owner.as_bytes()[..]])
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat.short(), self.owner.short())
    }
}

/// Content identity of a sealed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub UniqId);

impl ChunkId {
    /// Hash of the chunk's canonical bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(UniqId(*blake3::hash(bytes).as_bytes()))
    }

    pub fn key(&self) -> UniqId {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier is not valid hex")]
    InvalidHex,
    #[error("identifier has {0} bytes, expected 32")]
    WrongLength(usize),
}
