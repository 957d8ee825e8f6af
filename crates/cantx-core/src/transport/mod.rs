//! CAN transports
//!
//! A transport sends frames synchronously from the control thread and
//! delivers received frames from its own reader thread through the receive
//! callback. The callback is the only thing shared with that thread.

mod slcan;
mod virtual_bus;

pub use slcan::{encode_frame, parse_frame_line, SlcanTransport};
pub use virtual_bus::{SentFrame, VirtualBus, VirtualBusHandle};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::busload::BusTiming;

/// Errors that can occur on the CAN link
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Transport not open")]
    NotOpen,

    #[error("Transport already open")]
    AlreadyOpen,

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Unsupported bitrate: {0} bit/s")]
    UnsupportedBitrate(u32),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::SerialError(e.to_string())
    }
}

/// A frame seen on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub dlc: u8,
    pub is_fd: bool,
    pub received_at: DateTime<Local>,
}

impl ReceivedFrame {
    pub fn new(id: u32, data: Vec<u8>, is_fd: bool) -> Self {
        Self {
            id,
            dlc: data.len().min(u8::MAX as usize) as u8,
            data,
            is_fd,
            received_at: Local::now(),
        }
    }
}

/// Called from the reader thread for every received frame
pub type ReceiveCallback = Box<dyn Fn(ReceivedFrame) + Send + 'static>;

/// Callback slot shared between a transport and its reader thread
pub(crate) type SharedCallback = Arc<Mutex<Option<ReceiveCallback>>>;

pub(crate) fn deliver(slot: &SharedCallback, frame: ReceivedFrame) {
    if let Ok(guard) = slot.lock() {
        if let Some(cb) = guard.as_ref() {
            cb(frame);
        }
    }
}

/// Kind of transport behind a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Virtual,
    Slcan,
}

/// One selectable channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub display_name: String,
    /// Value passed to [`CanTransport::open`]
    pub channel: String,
    pub kind: TransportKind,
}

/// Send/receive boundary to a CAN interface
pub trait CanTransport: Send {
    /// Open `channel` with the given bit timing
    fn open(&mut self, channel: &str, timing: &BusTiming) -> Result<(), TransportError>;

    /// Send one frame; `data` holds `dlc` bytes
    fn send(&mut self, id: u32, data: &[u8], dlc: u8, is_fd: bool) -> Result<(), TransportError>;

    /// Install the receive callback (replaces any previous one)
    fn set_receive_callback(&mut self, callback: ReceiveCallback);

    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Every channel available on this machine, virtual bus first
pub fn enumerate_channels() -> Vec<ChannelInfo> {
    let mut channels = virtual_bus::enumerate_channels();
    channels.extend(slcan::enumerate_channels());
    channels
}

/// Create a transport for a channel kind
pub fn create_transport(kind: TransportKind) -> Box<dyn CanTransport> {
    match kind {
        TransportKind::Virtual => Box::new(VirtualBus::new()),
        TransportKind::Slcan => Box::new(SlcanTransport::new()),
    }
}
