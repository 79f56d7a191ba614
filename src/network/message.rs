//! Peer session messages: one enum per direction-agnostic message kind and
//! the `{code, data}` dispatchers to and from the wire envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::types::Block;
use crate::network::wire::{Frame, WireError};
use crate::types::VoteMap;

pub const CODE_EMPTY: u8 = 0;
pub const CODE_HANDSHAKE: u8 = 1;
pub const CODE_PULL_BLOCK: u8 = 2;
pub const CODE_PUSH_BLOCK: u8 = 3;
pub const CODE_NEW_BLOCK: u8 = 4;
pub const CODE_NEW_BLOCK_HASH: u8 = 5;
pub const CODE_GET_BLOCK: u8 = 6;
pub const CODE_BLOCK_KNOWN: u8 = 7;

/// Heartbeat and height announce; the vote aggregate rides along.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub height: i64,
    pub address: String,
    /// Sender clock, milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub votes: VoteMap,
}

#[derive(Clone, Debug)]
pub enum PeerMessage {
    Empty,
    Handshake(HandshakePayload),
    /// Request the block at a height.
    PullBlock(u64),
    /// Sync response to `PullBlock`.
    PushBlock(Block),
    /// Gossip of a freshly packaged block.
    NewBlock(Block),
    /// Compact announce; the receiver fetches unknown hashes.
    NewBlockHash(String),
    /// Request a block by hash.
    GetBlock(String),
    /// The announced hash is already known.
    BlockKnown,
}

impl PeerMessage {
    pub fn code(&self) -> u8 {
        match self {
            PeerMessage::Empty => CODE_EMPTY,
            PeerMessage::Handshake(_) => CODE_HANDSHAKE,
            PeerMessage::PullBlock(_) => CODE_PULL_BLOCK,
            PeerMessage::PushBlock(_) => CODE_PUSH_BLOCK,
            PeerMessage::NewBlock(_) => CODE_NEW_BLOCK,
            PeerMessage::NewBlockHash(_) => CODE_NEW_BLOCK_HASH,
            PeerMessage::GetBlock(_) => CODE_GET_BLOCK,
            PeerMessage::BlockKnown => CODE_BLOCK_KNOWN,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Empty => "EMPTY",
            PeerMessage::Handshake(_) => "HANDSHAKE",
            PeerMessage::PullBlock(_) => "PULL_BLOCK",
            PeerMessage::PushBlock(_) => "PUSH_BLOCK",
            PeerMessage::NewBlock(_) => "NEW_BLOCK",
            PeerMessage::NewBlockHash(_) => "NEW_BLOCK_HASH",
            PeerMessage::GetBlock(_) => "GET_BLOCK",
            PeerMessage::BlockKnown => "BLOCK_KNOWN",
        }
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        let data = match self {
            PeerMessage::Empty => Value::String("0".into()),
            PeerMessage::Handshake(payload) => serde_json::to_value(payload)?,
            PeerMessage::PullBlock(height) => serde_json::to_value(height)?,
            PeerMessage::PushBlock(block) | PeerMessage::NewBlock(block) => {
                serde_json::to_value(block)?
            }
            PeerMessage::NewBlockHash(hash) | PeerMessage::GetBlock(hash) => {
                Value::String(hash.clone())
            }
            PeerMessage::BlockKnown => Value::Object(serde_json::Map::new()),
        };
        Ok(Frame {
            code: self.code(),
            data,
        })
    }

    pub fn from_frame(frame: Frame) -> Result<Self, WireError> {
        let code = frame.code;
        let bad = |reason: &str| WireError::BadPayload {
            code,
            reason: reason.to_string(),
        };
        Ok(match code {
            CODE_EMPTY => PeerMessage::Empty,
            CODE_HANDSHAKE => {
                PeerMessage::Handshake(serde_json::from_value(frame.data)?)
            }
            CODE_PULL_BLOCK => PeerMessage::PullBlock(
                frame.data.as_u64().ok_or_else(|| bad("expected height"))?,
            ),
            CODE_PUSH_BLOCK => PeerMessage::PushBlock(serde_json::from_value(frame.data)?),
            CODE_NEW_BLOCK => PeerMessage::NewBlock(serde_json::from_value(frame.data)?),
            CODE_NEW_BLOCK_HASH => PeerMessage::NewBlockHash(
                frame
                    .data
                    .as_str()
                    .ok_or_else(|| bad("expected hash"))?
                    .to_string(),
            ),
            CODE_GET_BLOCK => PeerMessage::GetBlock(
                frame
                    .data
                    .as_str()
                    .ok_or_else(|| bad("expected hash"))?
                    .to_string(),
            ),
            CODE_BLOCK_KNOWN => PeerMessage::BlockKnown,
            other => return Err(WireError::UnknownCode(other)),
        })
    }
}
