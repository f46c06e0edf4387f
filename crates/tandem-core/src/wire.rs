//! Tandem wire format — the envelope every protocol message travels in,
//! and the frame the TCP transport wraps it in.
//!
//! Envelopes are JSON. `kind` serializes as one of the literal tokens
//! GET / POST / RESPONSE / APPROVE. The `sender` field is never trusted
//! from the payload: the receiving engine overwrites it with the address
//! the transport reported before any handler sees the envelope.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Envelope kind. GET and POST are requests; RESPONSE completes a GET,
/// APPROVE completes a POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// Request that expects a RESPONSE carrying data.
    Get,
    /// Request that expects an APPROVE (receipt only, no data).
    Post,
    Response,
    Approve,
}

impl MessageKind {
    pub fn is_request(self) -> bool {
        matches!(self, Self::Get | Self::Post)
    }
}

/// The typed message every subsystem exchanges over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: MessageKind,

    /// Routing key. Requests are dispatched to the handlers registered
    /// under this tag; completions carry the verification tag of the
    /// request they answer.
    pub tag: String,

    /// Subsystem payload, usually JSON produced by the subsystem itself.
    #[serde(default)]
    pub data: String,

    /// Correlation id chosen by the sender of a request and echoed by
    /// its completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_tag: Option<String>,

    /// Source address as reported by the transport. Set by the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SocketAddr>,
}

impl Envelope {
    pub fn new(kind: MessageKind, tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            data: data.into(),
            verification_tag: None,
            sender: None,
        }
    }

    pub fn get(tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(MessageKind::Get, tag, data)
    }

    pub fn post(tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(MessageKind::Post, tag, data)
    }

    /// Build the RESPONSE answering `request`. None if the request carried
    /// no verification tag (nobody is waiting for it).
    pub fn response_to(request: &Envelope, data: impl Into<String>) -> Option<Self> {
        Self::completion(MessageKind::Response, request, data.into())
    }

    /// Build the APPROVE acknowledging `request`.
    pub fn approve_for(request: &Envelope) -> Option<Self> {
        Self::completion(MessageKind::Approve, request, String::new())
    }

    fn completion(kind: MessageKind, request: &Envelope, data: String) -> Option<Self> {
        let verification_tag = request.verification_tag.clone()?;
        Some(Self {
            kind,
            tag: verification_tag.clone(),
            data,
            verification_tag: Some(verification_tag),
            sender: None,
        })
    }

    pub fn is_request(&self) -> bool {
        self.kind.is_request()
    }

    /// Serialize to bytes for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

// ── Tags and timeouts ─────────────────────────────────────────────────────────

/// Tag owned by the DHT subsystem.
pub const DHT_TAG: &str = "DHT";

/// Tag owned by the chat subsystem (direct message receipt).
pub const CHAT_TAG: &str = "Chat";

/// Default bound on every outbound request, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

// ── TCP frame ─────────────────────────────────────────────────────────────────

/// Frame header: 4 bytes sender IPv4 address, 2 bytes sender port (big-endian).
/// The remainder of the frame is the envelope.
pub const FRAME_HEADER_LEN: usize = 6;

/// Prefix `payload` with the sender's listening address.
pub fn encode_frame(sender: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&sender.ip().octets());
    frame.extend_from_slice(&sender.port().to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into the sender's listening address and the payload.
pub fn decode_frame(frame: &[u8]) -> Result<(SocketAddr, &[u8]), WireError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(WireError::FrameTooShort(frame.len()));
    }
    let ip = Ipv4Addr::new(frame[0], frame[1], frame[2], frame[3]);
    let port = u16::from_be_bytes([frame[4], frame[5]]);
    Ok((
        SocketAddr::V4(SocketAddrV4::new(ip, port)),
        &frame[FRAME_HEADER_LEN..],
    ))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("frame of {0} bytes is shorter than the {FRAME_HEADER_LEN}-byte header")]
    FrameTooShort(usize),

    #[error("address {0} cannot be framed, only IPv4 is supported")]
    UnsupportedAddress(SocketAddr),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
