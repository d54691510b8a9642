//! Protocol module for decoding LOGITOW notifications.
//!
//! This module contains:
//! - Block-state payload validation and structured decoding
//! - Battery payload decoding and the battery request command

pub mod battery;
pub mod block;

pub use battery::{
    decode_battery_voltage, BatteryReading, BATTERY_PAYLOAD_LEN, BATTERY_REQUEST_COMMAND,
};
pub use block::{
    decode_block_payload, BlockOperation, BlockSide, BlockState, BLOCK_PAYLOAD_LEN,
};
