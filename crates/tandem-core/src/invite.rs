//! Invite codes — a shareable encoding of a peer's reachable address.
//!
//! An invite is standard Base64 over the UTF-8 string `"<ip>:<port>"`.
//! Decoding accepts only a strict dotted IPv4 address (octets 0-255, no
//! leading zeros) followed by a decimal port that fits in 16 bits.

use std::net::{Ipv4Addr, SocketAddrV4};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encode an address as an invite code.
pub fn encode_invite(addr: SocketAddrV4) -> String {
    STANDARD.encode(format!("{}:{}", addr.ip(), addr.port()))
}

/// Decode an invite code. Never returns a partially-populated address.
pub fn decode_invite(invite: &str) -> Result<SocketAddrV4, InviteError> {
    let bytes = STANDARD
        .decode(invite.trim())
        .map_err(|_| InviteError::Encoding)?;
    let text = String::from_utf8(bytes).map_err(|_| InviteError::Utf8)?;
    parse_address(&text).ok_or(InviteError::Malformed(text))
}

fn parse_address(text: &str) -> Option<SocketAddrV4> {
    let (ip, port) = text.split_once(':')?;

    let mut octets = [0u8; 4];
    let mut parts = ip.split('.');
    for octet in octets.iter_mut() {
        *octet = parse_octet(parts.next()?)?;
    }
    if parts.next().is_some() {
        return None;
    }

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u16 = port.parse().ok()?;

    Some(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

fn parse_octet(part: &str) -> Option<u8> {
    let digits = part.as_bytes();
    if digits.is_empty() || digits.len() > 3 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    part.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InviteError {
    #[error("invite is not valid base64")]
    Encoding,
    #[error("invite does not decode to UTF-8 text")]
    Utf8,
    #[error("invite does not name an IPv4 address and port: {0:?}")]
    Malformed(String),
}
