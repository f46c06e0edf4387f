//! TCP transport — one connection per frame.
//!
//! The sender connects, writes a frame (its own listening address followed
//! by the payload, see `tandem_core::wire::encode_frame`) and closes its
//! write half. The listener reads to EOF, recovers the sender's listening
//! address from the frame header and hands the payload to the receiver.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use tandem_core::wire::{decode_frame, encode_frame, WireError};

use crate::transport::{FrameReceiver, Transport, TransportError};

/// Frames larger than this are discarded unread.
const MAX_FRAME: u64 = 4 * 1024 * 1024;

/// Bound on connecting to a peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on reading one inbound frame.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    advertised: SocketAddrV4,
    shutdown: broadcast::Sender<()>,
}

pub struct TcpTransport {
    advertise: Option<IpAddr>,
    running: Mutex<Option<Running>>,
    local: RwLock<Option<SocketAddr>>,
    receiver: Arc<RwLock<Option<FrameReceiver>>>,
}

impl TcpTransport {
    /// `advertise` is the address written into outgoing frames. Without it
    /// the bound address is used, or loopback if bound to 0.0.0.0.
    pub fn new(advertise: Option<IpAddr>) -> Self {
        Self {
            advertise,
            running: Mutex::new(None),
            local: RwLock::new(None),
            receiver: Arc::new(RwLock::new(None)),
        }
    }

    fn advertised_ip(&self, bound: IpAddr) -> Result<Ipv4Addr, TransportError> {
        let ip = self.advertise.unwrap_or(bound);
        match ip {
            IpAddr::V4(v4) if v4.is_unspecified() => Ok(Ipv4Addr::LOCALHOST),
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(WireError::UnsupportedAddress(SocketAddr::new(ip, 0)).into()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, bind: Option<SocketAddr>) -> Result<SocketAddr, TransportError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(SocketAddr::V4(r.advertised));
        }

        let bind = bind.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let listener = TcpListener::bind(bind).await?;
        let bound = listener.local_addr()?;
        let advertised = SocketAddrV4::new(self.advertised_ip(bound.ip())?, bound.port());

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(accept_loop(listener, self.receiver.clone(), shutdown_rx));

        *running = Some(Running {
            advertised,
            shutdown,
        });
        if let Ok(mut local) = self.local.write() {
            *local = Some(SocketAddr::V4(advertised));
        }
        tracing::info!(%bound, %advertised, "tcp transport listening");
        Ok(SocketAddr::V4(advertised))
    }

    async fn stop(&self) {
        if let Some(r) = self.running.lock().await.take() {
            let _ = r.shutdown.send(());
            tracing::info!(addr = %r.advertised, "tcp transport stopped");
        }
    }

    async fn send_raw(&self, addr: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        let sender = match self.running.lock().await.as_ref() {
            Some(r) => r.advertised,
            None => return Err(TransportError::NotStarted),
        };

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(addr))??;
        stream.write_all(&encode_frame(sender, &data)).await?;
        stream.shutdown().await?;

        tracing::trace!(%addr, len = data.len(), "frame sent");
        Ok(())
    }

    fn set_receiver(&self, receiver: FrameReceiver) {
        if let Ok(mut guard) = self.receiver.write() {
            *guard = Some(receiver);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local.read().ok().and_then(|a| *a)
    }
}

async fn accept_loop(
    listener: TcpListener,
    receiver: Arc<RwLock<Option<FrameReceiver>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("accept loop shutting down");
                return;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_frame(stream, receiver).await {
                        tracing::debug!(%peer, error = %e, "inbound frame discarded");
                    }
                });
            }
        }
    }
}

async fn read_frame(
    stream: TcpStream,
    receiver: Arc<RwLock<Option<FrameReceiver>>>,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    tokio::time::timeout(READ_TIMEOUT, stream.take(MAX_FRAME).read_to_end(&mut buf)).await??;

    let (sender, payload) = decode_frame(&buf)?;
    let receiver = receiver.read().ok().and_then(|r| r.clone());
    match receiver {
        Some(receiver) => receiver(sender, Bytes::copy_from_slice(payload)),
        None => tracing::trace!(%sender, "no receiver installed, frame dropped"),
    }
    Ok(())
}
