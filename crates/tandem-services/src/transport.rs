//! Transport boundary — moves raw byte frames between two addresses.
//!
//! A transport owns no protocol semantics. It reports every inbound frame
//! to a single receiver together with the sender's address; everything
//! above that (envelopes, correlation, handlers) lives in the network
//! service.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use tandem_core::wire::WireError;

/// Callback invoked for every inbound frame: (source address, payload).
pub type FrameReceiver = Arc<dyn Fn(SocketAddr, Bytes) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening. `None` lets the transport pick an address.
    /// Returns the address peers should use to reach us.
    async fn start(&self, bind: Option<SocketAddr>) -> Result<SocketAddr, TransportError>;

    /// Stop listening. Frames sent to us afterwards are lost.
    async fn stop(&self);

    /// Send one frame. Success means the frame left this host, not that
    /// anyone processed it.
    async fn send_raw(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError>;

    /// Install the inbound frame callback. Replaces any previous one.
    fn set_receiver(&self, receiver: FrameReceiver);

    /// Address returned by the last successful `start`.
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not started")]
    NotStarted,
    #[error("no endpoint listening at {0}")]
    Unreachable(SocketAddr),
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}
