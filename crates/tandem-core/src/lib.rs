//! tandem-core — shared identifiers, wire envelope, invite codes and config.
//! All other tandem crates depend on this one.

pub mod config;
pub mod ids;
pub mod invite;
pub mod message;
pub mod wire;

pub use ids::{ChunkId, FlowId, UniqId};
pub use message::{DirectMessage, Message, MessageStatus};
pub use wire::{Envelope, MessageKind};
