//! Protocol engine — turns fire-and-forget frames into awaitable
//! request/response exchanges.
//!
//! Outbound requests get a fresh verification tag and a one-shot waiter in
//! the response registry, registered before the frame leaves. The peer's
//! RESPONSE (for a GET) or APPROVE (for a POST) carries that tag back and
//! completes the waiter. Inbound requests are dispatched to the handlers
//! registered under their tag; every POST that carries a verification tag
//! is approved exactly once by the engine itself, whatever the handlers do.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use tandem_core::{Envelope, MessageKind};

use crate::registry::{HandlerHandle, HandlerRegistry, MessageHandler};
use crate::transport::{Transport, TransportError};

pub struct NetworkService {
    transport: Arc<dyn Transport>,
    /// GET/POST handlers keyed by subsystem tag.
    requests: HandlerRegistry,
    /// One-shot waiters keyed by verification tag.
    responses: HandlerRegistry,
    default_timeout: Duration,
}

impl NetworkService {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            requests: HandlerRegistry::new(),
            responses: HandlerRegistry::new(),
            default_timeout,
        })
    }

    /// Install the frame receiver and start the transport.
    pub async fn start(self: &Arc<Self>, bind: Option<SocketAddr>) -> Result<SocketAddr, TransportError> {
        let engine = Arc::downgrade(self);
        self.transport.set_receiver(Arc::new(move |from: SocketAddr, data: Bytes| {
            if let Some(engine) = engine.upgrade() {
                engine.handle_frame(from, &data);
            }
        }));
        let addr = self.transport.start(bind).await?;
        tracing::info!(%addr, "network service started");
        Ok(addr)
    }

    /// Stop the transport and drop every registration. Waiters still in
    /// flight run into their timeout.
    pub async fn stop(&self) {
        self.transport.stop().await;
        self.requests.clear();
        self.responses.clear();
        tracing::info!("network service stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn register_handler(&self, tag: &str, handler: Arc<dyn MessageHandler>) -> HandlerHandle {
        tracing::debug!(tag, "request handler registered");
        self.requests.register(tag, handler)
    }

    pub fn forget_handler(&self, tag: &str, handle: HandlerHandle) {
        if self.requests.forget(tag, handle) {
            tracing::debug!(tag, "request handler forgotten");
        }
    }

    /// Outstanding request waiters.
    pub fn pending_waiters(&self) -> usize {
        self.responses.total()
    }

    /// POST `data` under `tag`. True iff the peer approved within the timeout.
    pub async fn send_post(
        &self,
        addr: SocketAddr,
        tag: &str,
        data: impl Into<String>,
        timeout: Option<Duration>,
    ) -> bool {
        self.send_message(addr, Envelope::post(tag, data), timeout)
            .await
            .is_some()
    }

    /// GET under `tag`. Returns the RESPONSE payload, None on timeout.
    pub async fn send_get(
        &self,
        addr: SocketAddr,
        tag: &str,
        data: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Option<String> {
        self.send_message(addr, Envelope::get(tag, data), timeout)
            .await
            .map(|response| response.data)
    }

    pub async fn send_post_json<T: Serialize>(
        &self,
        addr: SocketAddr,
        tag: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> bool {
        match serde_json::to_string(body) {
            Ok(data) => self.send_post(addr, tag, data, timeout).await,
            Err(e) => {
                tracing::warn!(tag, error = %e, "failed to encode POST body");
                false
            }
        }
    }

    pub async fn send_get_json<Q: Serialize, R: DeserializeOwned>(
        &self,
        addr: SocketAddr,
        tag: &str,
        query: &Q,
        timeout: Option<Duration>,
    ) -> Option<R> {
        let data = match serde_json::to_string(query) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(tag, error = %e, "failed to encode GET query");
                return None;
            }
        };
        let response = self.send_get(addr, tag, data, timeout).await?;
        match serde_json::from_str(&response) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::debug!(tag, %addr, error = %e, "unparseable GET response");
                None
            }
        }
    }

    /// Send a request and wait for its completion. Overwrites the
    /// envelope's verification tag. None on timeout or send failure.
    pub async fn send_message(
        &self,
        addr: SocketAddr,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Option<Envelope> {
        let expected = match envelope.kind {
            MessageKind::Get => MessageKind::Response,
            MessageKind::Post => MessageKind::Approve,
            kind => {
                tracing::warn!(?kind, "only GET and POST can be awaited");
                return None;
            }
        };

        let verification_tag = Uuid::new_v4().to_string();
        envelope.verification_tag = Some(verification_tag.clone());

        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handle = self.responses.register(
            &verification_tag,
            Arc::new(move |completion: &Envelope, _: &Replier| {
                if completion.kind != expected {
                    return;
                }
                let tx = slot.lock().ok().and_then(|mut s| s.take());
                if let Some(tx) = tx {
                    let _ = tx.send(completion.clone());
                }
            }),
        );
        let _waiter = Waiter {
            registry: &self.responses,
            tag: &verification_tag,
            handle,
        };

        let bytes = match envelope.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(tag = %envelope.tag, error = %e, "failed to encode envelope");
                return None;
            }
        };
        let timeout = timeout.unwrap_or(self.default_timeout);
        let exchange = async {
            if let Err(e) = self.transport.send_raw(addr, Bytes::from(bytes)).await {
                tracing::debug!(peer = %addr, tag = %envelope.tag, error = %e, "request not sent");
                return None;
            }
            rx.await.ok()
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(completion) => completion,
            Err(_) => {
                tracing::debug!(
                    peer = %addr,
                    tag = %envelope.tag,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                None
            }
        }
    }

    fn replier(&self) -> Replier {
        Replier {
            transport: self.transport.clone(),
        }
    }

    fn handle_frame(&self, from: SocketAddr, data: &[u8]) {
        let mut envelope = match Envelope::from_bytes(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::trace!(peer = %from, error = %e, "malformed frame dropped");
                return;
            }
        };
        envelope.sender = Some(from);

        let replier = self.replier();
        if envelope.kind == MessageKind::Post {
            if let Some(approve) = Envelope::approve_for(&envelope) {
                replier.send_detached(from, approve);
            }
        }

        let registry = if envelope.is_request() {
            &self.requests
        } else {
            &self.responses
        };
        let handlers = registry.snapshot(&envelope.tag);
        if handlers.is_empty() {
            tracing::trace!(peer = %from, tag = %envelope.tag, kind = ?envelope.kind, "no handler");
            return;
        }
        for handler in handlers {
            handler.handle(&envelope, &replier);
        }
    }
}

/// Removes its waiter from the response registry when the request ends,
/// whichever way it ends.
struct Waiter<'a> {
    registry: &'a HandlerRegistry,
    tag: &'a str,
    handle: HandlerHandle,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.registry.forget(self.tag, self.handle);
    }
}

/// Handed to every handler so it can answer the request it is looking at.
#[derive(Clone)]
pub struct Replier {
    transport: Arc<dyn Transport>,
}

impl Replier {
    /// Answer a GET. Dropped silently if the request cannot be answered
    /// (no verification tag or no sender).
    pub fn respond(&self, request: &Envelope, data: impl Into<String>) {
        let Some(sender) = request.sender else {
            tracing::trace!(tag = %request.tag, "request has no sender, response dropped");
            return;
        };
        match Envelope::response_to(request, data) {
            Some(response) => self.send_detached(sender, response),
            None => tracing::trace!(tag = %request.tag, "request has no verification tag"),
        }
    }

    pub fn respond_json<T: Serialize>(&self, request: &Envelope, body: &T) {
        match serde_json::to_string(body) {
            Ok(data) => self.respond(request, data),
            Err(e) => tracing::warn!(tag = %request.tag, error = %e, "failed to encode response"),
        }
    }

    fn send_detached(&self, addr: SocketAddr, envelope: Envelope) {
        let bytes = match envelope.to_bytes() {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode completion");
                return;
            }
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send_raw(addr, bytes).await {
                tracing::debug!(peer = %addr, kind = ?envelope.kind, error = %e, "completion not sent");
            }
        });
    }
}
