//! Binary protocol between socket clients and the relay server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + str │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are opaque CRDT updates. Awareness payloads are the
//! JSON encoding of an [`AwarenessRecord`], since its values are arbitrary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessRecord;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, asks for everything the sender is missing
    SyncStep1 = 1,
    /// Diff answering a SyncStep1 (or the full state on join)
    SyncStep2 = 2,
    /// Incremental document update
    Delta = 3,
    /// Full awareness record of one peer
    Awareness = 4,
    /// Peer joined a room
    PeerJoined = 5,
    /// Peer left a room (its awareness record is gone)
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Awareness of every other peer in the room, replacing whatever the
    /// receiver knew; sent to a client that fell behind
    AwarenessSnapshot = 9,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Transport-level id of the originating peer (nil for the server)
    pub peer_id: Uuid,
    pub room_id: String,
    /// Per-peer send counter
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room_id: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.into(),
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, room_id: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room_id, clock, update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room_id: impl Into<String>, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room_id, 0, diff)
    }

    /// Create an awareness message carrying `record` on behalf of `peer_id`.
    pub fn awareness(
        peer_id: Uuid,
        room_id: impl Into<String>,
        clock: u64,
        record: &AwarenessRecord,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, room_id, clock, record.encode()?))
    }

    /// Create an awareness snapshot from the server.
    pub fn awareness_snapshot(room_id: impl Into<String>, records: &[AwarenessRecord]) -> Result<Self, ProtocolError> {
        let entries = records
            .iter()
            .map(|record| Ok((record.client_id, record.encode()?)))
            .collect::<Result<Vec<(Uuid, Vec<u8>)>, ProtocolError>>()?;
        let payload = bincode::serde::encode_to_vec(&entries, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::AwarenessSnapshot, Uuid::nil(), room_id, 0, payload))
    }

    /// Create a join request / notification.
    pub fn peer_joined(peer_id: Uuid, room_id: impl Into<String>) -> Self {
        Self::new(MessageType::PeerJoined, peer_id, room_id, 0, Vec::new())
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room_id: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room_id, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload. A malformed payload yields an empty
    /// record for the sending peer rather than an error.
    pub fn awareness_record(&self) -> Result<AwarenessRecord, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(AwarenessRecord::decode_or_empty(self.peer_id, &self.payload))
    }

    /// Parse an awareness snapshot. Malformed records come out empty, like
    /// single awareness payloads do.
    pub fn awareness_records(&self) -> Result<Vec<AwarenessRecord>, ProtocolError> {
        if self.msg_type != MessageType::AwarenessSnapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (entries, _): (Vec<(Uuid, Vec<u8>)>, usize) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|(client_id, fields)| AwarenessRecord::decode_or_empty(client_id, &fields))
            .collect())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
