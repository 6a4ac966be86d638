//! Network message types for P2P communication
//!
//! Every record on the wire is a JSON envelope `{"type": <int>, "data": <payload>}`.

use crate::core::{Block, Transaction};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Nodes are identified by a small integer (their port offset)
pub type NodeId = u64;

// Wire type codes
pub const TYPE_CONNECTION: u8 = 0;
pub const TYPE_BLOCK: u8 = 1;
pub const TYPE_TRANSACTION: u8 = 2;
pub const TYPE_PRE_PREPARE: u8 = 3;
pub const TYPE_PREPARE: u8 = 4;
pub const TYPE_COMMIT: u8 = 5;
pub const TYPE_SYNC: u8 = 6;
pub const TYPE_SYNC_BLOCK: u8 = 7;

/// Errors decoding an envelope
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Unknown message type: {0}")]
    UnknownType(u8),
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// PBFT vote for a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub height: u64,
    pub hash: String,
    pub signer: NodeId,
}

/// Request for a peer's head (`hash` absent) or for a specific block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    /// Node the answer goes to
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Block carried by a sync answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPayload {
    /// Answer to a request for a specific hash
    Block(Block),
    /// Answer to a request for the head
    LastBlock(Block),
}

impl SyncPayload {
    pub fn into_block(self) -> Block {
        match self {
            SyncPayload::Block(b) | SyncPayload::LastBlock(b) => b,
        }
    }
}

/// Answer to a [`SyncRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncBlock {
    pub id: NodeId,
    #[serde(flatten)]
    pub payload: SyncPayload,
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub enum Message {
    /// First frame on every connection, carrying the sender's id
    Connection(NodeId),
    /// A sealed block
    Block(Block),
    /// A transaction for the pool
    Transaction(Transaction),
    /// Reserved, never produced
    PrePrepare(serde_json::Value),
    Prepare(Vote),
    Commit(Vote),
    Sync(SyncRequest),
    SyncBlock(SyncBlock),
}

/// Raw wire shape used while decoding
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<Envelope> for Message {
    type Error = MessageError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let data = envelope.data;
        let msg = match envelope.kind {
            TYPE_CONNECTION => Message::Connection(serde_json::from_value(data)?),
            TYPE_BLOCK => Message::Block(serde_json::from_value(data)?),
            TYPE_TRANSACTION => Message::Transaction(serde_json::from_value(data)?),
            TYPE_PRE_PREPARE => Message::PrePrepare(data),
            TYPE_PREPARE => Message::Prepare(serde_json::from_value(data)?),
            TYPE_COMMIT => Message::Commit(serde_json::from_value(data)?),
            TYPE_SYNC => Message::Sync(serde_json::from_value(data)?),
            TYPE_SYNC_BLOCK => Message::SyncBlock(serde_json::from_value(data)?),
            other => return Err(MessageError::UnknownType(other)),
        };
        Ok(msg)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut envelope = serializer.serialize_struct("Message", 2)?;
        envelope.serialize_field("type", &self.type_code())?;
        match self {
            Message::Connection(id) => envelope.serialize_field("data", id)?,
            Message::Block(block) => envelope.serialize_field("data", block)?,
            Message::Transaction(tx) => envelope.serialize_field("data", tx)?,
            Message::PrePrepare(value) => envelope.serialize_field("data", value)?,
            Message::Prepare(vote) | Message::Commit(vote) => {
                envelope.serialize_field("data", vote)?
            }
            Message::Sync(req) => envelope.serialize_field("data", req)?,
            Message::SyncBlock(answer) => envelope.serialize_field("data", answer)?,
        }
        envelope.end()
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Numeric wire type
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Connection(_) => TYPE_CONNECTION,
            Message::Block(_) => TYPE_BLOCK,
            Message::Transaction(_) => TYPE_TRANSACTION,
            Message::PrePrepare(_) => TYPE_PRE_PREPARE,
            Message::Prepare(_) => TYPE_PREPARE,
            Message::Commit(_) => TYPE_COMMIT,
            Message::Sync(_) => TYPE_SYNC,
            Message::SyncBlock(_) => TYPE_SYNC_BLOCK,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Connection(_) => "Connection",
            Message::Block(_) => "Block",
            Message::Transaction(_) => "Transaction",
            Message::PrePrepare(_) => "PrePrepare",
            Message::Prepare(_) => "Prepare",
            Message::Commit(_) => "Commit",
            Message::Sync(_) => "Sync",
            Message::SyncBlock(_) => "SyncBlock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let msg = Message::Prepare(Vote {
            height: 3,
            hash: "abc".to_string(),
            signer: 7,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": 4, "data": {"height": 3, "hash": "abc", "signer": 7}})
        );
        assert_eq!(Message::from_bytes(&msg.to_bytes().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_connection_message() {
        let msg = Message::from_bytes(br#"{"type":0,"data":12}"#).unwrap();
        assert_eq!(msg, Message::Connection(12));
    }

    #[test]
    fn test_sync_messages() {
        let head_request = Message::Sync(SyncRequest { id: 2, hash: None });
        assert_eq!(
            serde_json::to_value(&head_request).unwrap(),
            json!({"type": 6, "data": {"id": 2}})
        );

        let genesis = Block::genesis().unwrap();
        let answer = Message::SyncBlock(SyncBlock {
            id: 2,
            payload: SyncPayload::LastBlock(genesis.clone()),
        });
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value["data"]["id"], 2);
        assert_eq!(value["data"]["last_block"]["height"], 1);

        match Message::from_bytes(&answer.to_bytes().unwrap()).unwrap() {
            Message::SyncBlock(sb) => {
                assert!(matches!(sb.payload, SyncPayload::LastBlock(_)));
                assert_eq!(sb.payload.into_block(), genesis);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Message::from_bytes(br#"{"type":42,"data":null}"#).is_err());
        assert!(Message::from_bytes(br#"{"type":1,"data":"not a block"}"#).is_err());
    }
}
