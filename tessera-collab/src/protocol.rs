//! Binary envelope published on a session topic.
//!
//! Wire format (bincode-encoded, standard config):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┐
//! │ kind     │ session_id │ sender   │ payload  │
//! │ varint   │ string     │ string   │ bytes    │
//! └──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! The payload is itself a bincode-encoded [`Operation`], [`CursorPosition`]
//! or [`ChatMessage`], chosen by `kind`. `Leave` carries no payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::clock::ReplicaId;
use crate::operation::Operation;
use crate::presence::CursorPosition;

/// Event name carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Logged edit operation
    Operation = 1,
    /// Ephemeral cursor position
    Cursor = 2,
    /// Chat line or annotation
    Chat = 3,
    /// Sender is leaving the session
    Leave = 4,
}

/// Top-level message on a session topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub session_id: String,
    pub sender: ReplicaId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn operation(session_id: impl Into<String>, op: &Operation) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EnvelopeKind::Operation,
            session_id: session_id.into(),
            sender: op.replica_id.clone(),
            payload: encode_payload(op)?,
        })
    }

    pub fn cursor(
        session_id: impl Into<String>,
        cursor: &CursorPosition,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EnvelopeKind::Cursor,
            session_id: session_id.into(),
            sender: cursor.replica_id.clone(),
            payload: encode_payload(cursor)?,
        })
    }

    pub fn chat(session_id: impl Into<String>, msg: &ChatMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EnvelopeKind::Chat,
            session_id: session_id.into(),
            sender: msg.replica_id.clone(),
            payload: encode_payload(msg)?,
        })
    }

    pub fn leave(session_id: impl Into<String>, sender: ReplicaId) -> Self {
        Self {
            kind: EnvelopeKind::Leave,
            session_id: session_id.into(),
            sender,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    pub fn to_operation(&self) -> Result<Operation, ProtocolError> {
        self.expect_kind(EnvelopeKind::Operation)?;
        decode_payload(&self.payload)
    }

    pub fn to_cursor(&self) -> Result<CursorPosition, ProtocolError> {
        self.expect_kind(EnvelopeKind::Cursor)?;
        decode_payload(&self.payload)
    }

    pub fn to_chat(&self) -> Result<ChatMessage, ProtocolError> {
        self.expect_kind(EnvelopeKind::Chat)?;
        decode_payload(&self.payload)
    }

    fn expect_kind(&self, expected: EnvelopeKind) -> Result<(), ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::InvalidKind { expected, got: self.kind });
        }
        Ok(())
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} envelope, got {got:?}")]
    InvalidKind { expected: EnvelopeKind, got: EnvelopeKind },
}
