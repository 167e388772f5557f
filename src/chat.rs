//! Chat channel
//!
//! One datagram is one message: UTF-8 text, no length prefix, no terminator.
//! Messages larger than the path MTU are fragmented by IP or dropped; there
//! is no reassembly here.
//!
//! The channel is split into a [`ChatSender`] and a [`ChatReceiver`] so the
//! console can type and read at the same time. Both append to a shared
//! [`ChatLog`] that lives as long as the chat view.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::protocol::{DatagramKind, MAX_DATAGRAM_SIZE};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One chat line as shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub direction: Direction,
    pub timestamp: SystemTime,
}

impl ChatMessage {
    pub fn sent(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            direction: Direction::Sent,
            timestamp: SystemTime::now(),
        }
    }

    pub fn received(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            direction: Direction::Received,
            timestamp: SystemTime::now(),
        }
    }
}

/// In-memory history, no persistence
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Arc<Mutex<Vec<ChatMessage>>>,
}

impl ChatLog {
    fn push(&self, message: ChatMessage) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    /// Copy of every message so far, oldest first
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open the chat channel on a CONNECTED session
pub fn open(session: &Session) -> SessionResult<(ChatSender, ChatReceiver)> {
    let incoming = session.arm_chat()?;
    let log = ChatLog::default();

    Ok((
        ChatSender {
            session: session.clone(),
            log: log.clone(),
        },
        ChatReceiver { incoming, log },
    ))
}

/// Sending half
#[derive(Clone)]
pub struct ChatSender {
    session: Session,
    log: ChatLog,
}

impl ChatSender {
    /// Transmit `text` as one datagram and record it as sent
    pub async fn send(&self, text: &str) -> SessionResult<ChatMessage> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyInput("message"));
        }
        if DatagramKind::classify(text.as_bytes()).is_control() {
            return Err(SessionError::ReservedText(text.to_string()));
        }
        if text.len() > MAX_DATAGRAM_SIZE {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {} bytes does not fit in one datagram", text.len()),
            )));
        }

        match self.session.send_to_peer(text.as_bytes()).await {
            Ok(_) => {}
            Err(SessionError::NotConnected) => return Err(SessionError::NotConnected),
            Err(e) => {
                self.session.fail(&format!("chat send failed: {}", e));
                return Err(e);
            }
        }

        let message = ChatMessage::sent(text);
        self.log.push(message.clone());
        Ok(message)
    }

    pub fn log(&self) -> &ChatLog {
        &self.log
    }
}

/// Receiving half; yields messages in arrival order
pub struct ChatReceiver {
    incoming: mpsc::Receiver<Bytes>,
    log: ChatLog,
}

impl ChatReceiver {
    /// Next received message, or `None` once the session has been torn down
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        loop {
            let payload = self.incoming.recv().await?;
            if payload.is_empty() {
                continue;
            }

            let text = match std::str::from_utf8(&payload) {
                Ok(text) => text.to_string(),
                Err(_) => {
                    warn!("Received {} bytes of invalid UTF-8, decoding lossily", payload.len());
                    String::from_utf8_lossy(&payload).into_owned()
                }
            };

            let message = ChatMessage::received(text);
            self.log.push(message.clone());
            return Some(message);
        }
    }

    /// Deliver every message to `on_message` until the session ends
    pub async fn run<F>(mut self, mut on_message: F)
    where
        F: FnMut(ChatMessage),
    {
        while let Some(message) = self.recv().await {
            on_message(message);
        }
        debug!("Chat receive loop finished");
    }

    #[cfg(test)]
    pub fn log(&self) -> &ChatLog {
        &self.log
    }
}
