//! Wire tokens and presentation events
//!
//! Everything travels as raw UDP payloads on one socket:
//! - control plane: the exact byte strings `Hello`, `Hello back!` and `PING`
//! - chat: UTF-8 text, one datagram per message
//! - file transfer: binary chunks of up to 1024 bytes, then one empty datagram
//!
//! Control tokens are case-sensitive and must stay byte-identical so older
//! peers keep interoperating. Chat text and file chunks carry no tag, so the
//! session decides which consumer gets a data datagram.
//!
//! The presentation side receives [`UiEvent`]s, rendered either as text or as
//! newline-delimited JSON.

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use crate::chat::{ChatMessage, Direction};
use crate::status::Presence;
use crate::transfer::TransferSummary;

/// Handshake request token
pub const HANDSHAKE_REQUEST: &[u8] = b"Hello";

/// Handshake acknowledge token
pub const HANDSHAKE_ACK: &[u8] = b"Hello back!";

/// Keep-alive probe token
pub const KEEPALIVE_PROBE: &[u8] = b"PING";

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// What a received payload means, decided by its exact bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    HandshakeRequest,
    HandshakeAck,
    KeepAlive,
    /// Zero-length payload (end of a file transfer)
    Terminator,
    /// Chat text or a file chunk
    Data,
}

impl DatagramKind {
    pub fn classify(payload: &[u8]) -> Self {
        match payload {
            [] => Self::Terminator,
            p if p == HANDSHAKE_REQUEST => Self::HandshakeRequest,
            p if p == HANDSHAKE_ACK => Self::HandshakeAck,
            p if p == KEEPALIVE_PROBE => Self::KeepAlive,
            _ => Self::Data,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::HandshakeRequest | Self::HandshakeAck | Self::KeepAlive)
    }
}

/// A received payload plus the address it came from
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Bytes,
    pub from: SocketAddr,
}

impl Envelope {
    pub fn new(payload: Bytes, from: SocketAddr) -> Self {
        Self { payload, from }
    }

    pub fn kind(&self) -> DatagramKind {
        DatagramKind::classify(&self.payload)
    }
}

/// Seconds since the Unix epoch
pub fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Events pushed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Status {
        status: Presence,
    },
    Connected {
        peer: String,
        local_port: u16,
    },
    Disconnected {
        reason: String,
    },
    Chat {
        direction: Direction,
        text: String,
        timestamp: f64,
    },
    Transfer {
        direction: Direction,
        path: String,
        bytes: u64,
        chunks: u64,
        sha256: String,
    },
    /// Rejected before any network action
    InvalidInput {
        message: String,
    },
    Error {
        message: String,
    },
}

impl UiEvent {
    pub fn chat(message: &ChatMessage) -> Self {
        Self::Chat {
            direction: message.direction,
            text: message.text.clone(),
            timestamp: unix_seconds(message.timestamp),
        }
    }

    pub fn transfer(direction: Direction, path: &str, summary: &TransferSummary) -> Self {
        Self::Transfer {
            direction,
            path: path.to_string(),
            bytes: summary.bytes,
            chunks: summary.chunks,
            sha256: summary.sha256_hex(),
        }
    }

    /// One JSON object terminated by a newline
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default() + "\n"
    }
}

impl fmt::Display for UiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { status } => write!(f, "Status: {}", status),
            Self::Connected { peer, local_port } => {
                write!(f, "Connected to {} (local port {})", peer, local_port)
            }
            Self::Disconnected { reason } => write!(f, "Disconnected: {}", reason),
            Self::Chat { direction: Direction::Sent, text, .. } => write!(f, "me > {}", text),
            Self::Chat { direction: Direction::Received, text, .. } => write!(f, "peer > {}", text),
            Self::Transfer { direction, path, bytes, chunks, sha256 } => {
                let verb = match direction {
                    Direction::Sent => "Sent",
                    Direction::Received => "Received",
                };
                write!(f, "{} {} ({} bytes, {} chunks, sha256 {})", verb, path, bytes, chunks, sha256)
            }
            Self::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            Self::Error { message } => write!(f, "Error: {}", message),
        }
    }
}
