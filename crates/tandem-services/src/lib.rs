//! tandem-services — protocol engine, transports, DHT, storage and the
//! chat/flow model built on top of them.

pub mod chat;
pub mod chat_manager;
pub mod dht;
pub mod directory;
pub mod flow;
pub mod memory_net;
pub mod network;
pub mod peer_dht;
pub mod registry;
pub mod storage;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod testing;

pub use chat::{Chat, ChatError, ChatState};
pub use chat_manager::{ChatManager, DhtChatManager};
pub use dht::{Dht, MemoryDht};
pub use directory::{ChatDirectory, ChatEvent};
pub use flow::{Chunk, Flow, FlowRecord, HistoryCursor, CHUNK_CAPACITY};
pub use memory_net::{MemoryNetwork, MemoryTransport};
pub use network::{NetworkService, Replier};
pub use peer_dht::PeerDht;
pub use registry::{HandlerHandle, HandlerRegistry, MessageHandler};
pub use storage::{BlobStore, DiskStore, MemoryStore};
pub use tcp::TcpTransport;
pub use transport::{FrameReceiver, Transport, TransportError};
