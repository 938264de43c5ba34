//! Client wire framing.
//!
//! Every client frame is a 4-byte big-endian header followed by the body:
//! the top 8 bits carry the frame kind, the low 24 bits the body length.
//! Bodies are UTF-8 JSON for every kind that carries one.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest body a 24-bit length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = 0x00FF_FFFF;

/// Frame kinds on the client wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Routed request or pushed `{event, body}` envelope.
    Normal = 0,
    Ping = 1,
    Pong = 2,
    /// Client hello carrying headers and optional resume cookies.
    Handshake = 3,
    /// Server acceptance, carrying `{distance, binded}`.
    Ready = 4,
    /// Forced disconnect notice with `{code, reason}`.
    Kick = 5,
    /// Cookie grant with `{key, value, expires}`.
    Cookie = 6,
}

impl FrameKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FrameKind::Normal),
            1 => Some(FrameKind::Ping),
            2 => Some(FrameKind::Pong),
            3 => Some(FrameKind::Handshake),
            4 => Some(FrameKind::Ready),
            5 => Some(FrameKind::Kick),
            6 => Some(FrameKind::Cookie),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload of {0} bytes exceeds the 24-bit frame limit")]
    PayloadTooLarge(usize),
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Bytes,
}

/// Encode a frame. Bodies at or past the 24-bit limit are rejected; the
/// header could not describe them.
pub fn encode(kind: FrameKind, body: &[u8]) -> Result<Bytes, CodecError> {
    if body.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(body.len()));
    }
    let head = ((kind as u32) << 24) | body.len() as u32;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(head);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decode one complete frame. Returns `None` for short buffers, length
/// mismatches and unknown kinds; the connection loop drops such input.
pub fn decode(raw: &[u8]) -> Option<Frame> {
    if raw.len() < 4 {
        return None;
    }
    let head = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let kind = FrameKind::from_u8((head >> 24) as u8)?;
    let len = (head & 0x00FF_FFFF) as usize;
    if raw.len() != 4 + len {
        return None;
    }
    Some(Frame {
        kind,
        body: Bytes::copy_from_slice(&raw[4..]),
    })
}

/// Routed request body inside a normal frame. Requests without an id are
/// notifications; no reply is ever produced for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub route: String,
    #[serde(default)]
    pub params: Value,
}

/// A parsed `type.service.method` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub node_type: String,
    pub service: String,
    pub method: String,
}

impl Route {
    /// Parse a dotted route. Anything but exactly three non-empty parts is
    /// rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('.');
        let node_type = parts.next()?.to_string();
        let service = parts.next()?.to_string();
        let method = parts.next()?.to_string();
        if parts.next().is_some()
            || node_type.is_empty()
            || service.is_empty()
            || method.is_empty()
        {
            return None;
        }
        Some(Self {
            node_type,
            service,
            method,
        })
    }
}
