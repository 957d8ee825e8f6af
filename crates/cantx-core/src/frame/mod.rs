//! Transmission table
//!
//! [`FrameSpec`] is one row of the TX table; [`FrameTable`] holds the rows
//! keyed by identifier and always iterates in ascending id order.

mod hex;

pub use hex::{format_hex_payload, parse_hex_payload, PayloadFormatError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::catalog::MessageDef;

/// Maximum payload of a classic CAN frame
pub const MAX_CLASSIC_DLC: u8 = 8;

/// Maximum payload of a CAN-FD frame
pub const MAX_FD_DLC: u8 = 64;

/// Period used for catalog messages without a `GenMsgCycleTime`
pub const DEFAULT_PERIOD_MS: u32 = 100;

/// Highest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Clamp a DLC to the valid range for the frame kind
pub fn clamp_dlc(dlc: u8, is_fd: bool) -> u8 {
    let max = if is_fd { MAX_FD_DLC } else { MAX_CLASSIC_DLC };
    dlc.clamp(1, max)
}

/// One row of the transmission table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpec {
    /// 11-bit or 29-bit identifier
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    is_fd: bool,
    dlc: u8,
    period_ms: u32,
    /// Last valid manual payload, overwritten with the sent bytes after each tick
    manual_payload: Vec<u8>,
    /// Per-frame payload script
    pub script_path: Option<PathBuf>,
}

impl FrameSpec {
    /// Create an enabled frame with an all-zero payload
    pub fn new(id: u32, name: impl Into<String>, dlc: u8, period_ms: u32, is_fd: bool) -> Self {
        let dlc = clamp_dlc(dlc, is_fd);
        Self {
            id: id.min(MAX_EXTENDED_ID),
            name: name.into(),
            enabled: true,
            is_fd,
            dlc,
            period_ms: period_ms.max(1),
            manual_payload: vec![0u8; dlc as usize],
            script_path: None,
        }
    }

    /// Seed a frame from a catalog message
    pub fn from_message(message: &MessageDef) -> Self {
        Self::new(
            message.frame_id,
            message.name.clone(),
            message.payload_length,
            message.cycle_time.unwrap_or(DEFAULT_PERIOD_MS),
            message.is_fd,
        )
    }

    pub fn is_fd(&self) -> bool {
        self.is_fd
    }

    /// Switch between classic and FD; the DLC is clamped to the new kind
    pub fn set_fd(&mut self, is_fd: bool) {
        self.is_fd = is_fd;
        self.set_dlc(self.dlc);
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Change the DLC; the manual payload is padded or truncated to match
    pub fn set_dlc(&mut self, dlc: u8) {
        self.dlc = clamp_dlc(dlc, self.is_fd);
        self.manual_payload.resize(self.dlc as usize, 0);
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    pub fn set_period_ms(&mut self, period_ms: u32) {
        self.period_ms = period_ms.max(1);
    }

    pub fn manual_payload(&self) -> &[u8] {
        &self.manual_payload
    }

    /// Replace the payload without validation (length forced to the DLC)
    pub fn set_manual_payload(&mut self, bytes: &[u8]) {
        let dlc = self.dlc as usize;
        self.manual_payload = bytes.iter().copied().take(dlc).collect();
        self.manual_payload.resize(dlc, 0);
    }

    /// Apply a user edit of the payload text.
    ///
    /// On rejection the previous payload is kept and the error carries the
    /// expected format.
    pub fn set_payload_text(&mut self, text: &str) -> Result<(), PayloadFormatError> {
        let bytes = parse_hex_payload(text, self.dlc)?;
        self.manual_payload = bytes;
        Ok(())
    }

    /// Payload rendered as upper-case hex pairs
    pub fn payload_text(&self) -> String {
        format_hex_payload(&self.manual_payload)
    }

    /// Uses a 29-bit identifier on the wire
    pub fn is_extended(&self) -> bool {
        self.id > MAX_STANDARD_ID
    }
}

/// Errors from table edits
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameTableError {
    #[error("Frame {0:#05X} already exists")]
    DuplicateId(u32),

    #[error("Frame {0:#05X} not found")]
    UnknownId(u32),
}

/// Frames keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct FrameTable {
    frames: BTreeMap<u32, FrameSpec>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: FrameSpec) -> Result<(), FrameTableError> {
        if self.frames.contains_key(&frame.id) {
            return Err(FrameTableError::DuplicateId(frame.id));
        }
        self.frames.insert(frame.id, frame);
        Ok(())
    }

    pub fn remove(&mut self, id: u32) -> Result<FrameSpec, FrameTableError> {
        self.frames.remove(&id).ok_or(FrameTableError::UnknownId(id))
    }

    pub fn get(&self, id: u32) -> Option<&FrameSpec> {
        self.frames.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut FrameSpec> {
        self.frames.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.frames.contains_key(&id)
    }

    /// All frames, ascending by id
    pub fn iter(&self) -> impl Iterator<Item = &FrameSpec> {
        self.frames.values()
    }

    /// Enabled frames, ascending by id
    pub fn enabled(&self) -> impl Iterator<Item = &FrameSpec> {
        self.frames.values().filter(|f| f.enabled)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
