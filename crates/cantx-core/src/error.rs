//! Scheduler-level errors

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::frame::{FrameTableError, PayloadFormatError};
use crate::plugin::PluginError;
use crate::transport::TransportError;

/// Errors raised while editing or running the transmission
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    PayloadFormat(#[from] PayloadFormatError),

    #[error("{0}")]
    FrameTable(#[from] FrameTableError),

    #[error("Slider for {message}.{signal} already exists")]
    DuplicateOverride { message: String, signal: String },

    #[error("No slider for {message}.{signal}")]
    UnknownOverride { message: String, signal: String },

    #[error("Message {0:#05X} is not in the catalog")]
    UnknownMessage(u32),

    #[error("Signal '{signal}' not found in message '{message}'")]
    UnknownSignal { message: String, signal: String },

    #[error("Frame {0:#05X} not found")]
    UnknownFrame(u32),

    #[error("No catalog loaded")]
    NoCatalog,
}

impl TxError {
    /// Bus-level failure that must stop all transmission
    pub fn is_transport(&self) -> bool {
        matches!(self, TxError::Transport(_))
    }
}
