//! Block-state notification decoding.
//!
//! A block-state notification is 7 bytes:
//!
//! - Bytes 0-2: block A identifier (24-bit big-endian)
//! - Byte 3: side of block A the change happened on
//! - Bytes 4-6: block B identifier (24-bit big-endian), 0 on removal
//!
//! The session forwards the raw bytes; [`BlockState`] is a convenience for
//! hosts that want the structured view.

use crate::error::{Error, Result};

/// Length of a block-state notification payload.
pub const BLOCK_PAYLOAD_LEN: usize = 7;

/// Validate a block-state payload and copy it into a fixed array.
pub fn decode_block_payload(payload: &[u8]) -> Result<[u8; BLOCK_PAYLOAD_LEN]> {
    <[u8; BLOCK_PAYLOAD_LEN]>::try_from(payload).map_err(|_| Error::InvalidPayload {
        channel: "block data",
        expected: BLOCK_PAYLOAD_LEN,
        actual: payload.len(),
    })
}

/// Side of a block a neighbour attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BlockSide {
    /// Unknown side id.
    #[default]
    Undefined = 0,
    /// Side facing the previous block.
    Back = 1,
    /// Front side.
    Front = 2,
    /// Bottom side.
    Bottom = 3,
    /// Left side.
    Left = 4,
    /// Top side.
    Top = 5,
    /// Right side.
    Right = 6,
}

impl BlockSide {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Back,
            2 => Self::Front,
            3 => Self::Bottom,
            4 => Self::Left,
            5 => Self::Top,
            6 => Self::Right,
            _ => Self::Undefined,
        }
    }

    /// The side facing this one on an attached block.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Top => Self::Bottom,
            Self::Bottom => Self::Top,
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::Front => Self::Back,
            Self::Back => Self::Front,
            Self::Undefined => Self::Undefined,
        }
    }
}

/// Kind of structural change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockOperation {
    /// Block B was attached to block A.
    Add,
    /// Whatever was on that side of block A was removed.
    Remove,
}

/// Structured view of a block-state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockState {
    /// Identifier of the block that changed.
    pub block_a: u32,
    /// Side of block A involved.
    pub side: BlockSide,
    /// Identifier of the attached block, 0 when removed.
    pub block_b: u32,
}

impl BlockState {
    /// Parse a raw payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        decode_block_payload(payload).map(|raw| Self::from_bytes(&raw))
    }

    /// Interpret an already validated payload.
    pub fn from_bytes(raw: &[u8; BLOCK_PAYLOAD_LEN]) -> Self {
        Self {
            block_a: u24_be(raw[0], raw[1], raw[2]),
            side: BlockSide::from_raw(raw[3]),
            block_b: u24_be(raw[4], raw[5], raw[6]),
        }
    }

    /// Whether this notification adds or removes a block.
    pub fn operation(&self) -> BlockOperation {
        if self.block_b == 0 {
            BlockOperation::Remove
        } else {
            BlockOperation::Add
        }
    }
}

fn u24_be(hi: u8, mid: u8, lo: u8) -> u32 {
    u32::from(hi) << 16 | u32::from(mid) << 8 | u32::from(lo)
}
