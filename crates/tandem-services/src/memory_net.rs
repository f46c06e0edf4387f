//! In-process virtual network.
//!
//! Every `MemoryTransport` created from one `MemoryNetwork` can reach the
//! others by address. Delivery is asynchronous (a spawned task per frame)
//! so handlers never run on the sender's stack. A stopped transport is
//! unreachable, which is how tests take a peer offline.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::transport::{FrameReceiver, Transport, TransportError};

/// First port handed out when a transport starts without an address.
const FIRST_PORT: u16 = 20_000;

pub struct MemoryNetwork {
    endpoints: DashMap<SocketAddr, FrameReceiver>,
    next_port: AtomicU16,
    delivered: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(FIRST_PORT),
            delivered: AtomicU64::new(0),
        })
    }

    /// New unstarted transport attached to this network.
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            receiver: Arc::new(RwLock::new(None)),
            addr: RwLock::new(None),
        })
    }

    pub fn is_online(&self, addr: &SocketAddr) -> bool {
        self.endpoints.contains_key(addr)
    }

    /// Total frames handed to receivers so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn allocate(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: Bytes) -> bool {
        let receiver = match self.endpoints.get(&to) {
            Some(r) => r.value().clone(),
            None => return false,
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move { receiver(from, data) });
        true
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    receiver: Arc<RwLock<Option<FrameReceiver>>>,
    addr: RwLock<Option<SocketAddr>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, bind: Option<SocketAddr>) -> Result<SocketAddr, TransportError> {
        let addr = bind.unwrap_or_else(|| self.network.allocate());
        if self.network.endpoints.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }

        // Routed through the slot so a later set_receiver still applies.
        let slot = self.receiver.clone();
        let forward: FrameReceiver = Arc::new(move |from: SocketAddr, data: Bytes| {
            let receiver = slot.read().ok().and_then(|r| r.clone());
            if let Some(receiver) = receiver {
                receiver(from, data);
            }
        });
        self.network.endpoints.insert(addr, forward);
        if let Ok(mut guard) = self.addr.write() {
            *guard = Some(addr);
        }
        tracing::debug!(%addr, "memory transport started");
        Ok(addr)
    }

    async fn stop(&self) {
        if let Some(addr) = self.local_addr() {
            self.network.endpoints.remove(&addr);
            tracing::debug!(%addr, "memory transport stopped");
        }
    }

    async fn send_raw(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        let from = self.local_addr().ok_or(TransportError::NotStarted)?;
        if !self.network.is_online(&from) {
            return Err(TransportError::NotStarted);
        }
        if self.network.deliver(from, addr, data) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(addr))
        }
    }

    fn set_receiver(&self, receiver: FrameReceiver) {
        if let Ok(mut guard) = self.receiver.write() {
            *guard = Some(receiver);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr.read().ok().and_then(|a| *a)
    }
}
