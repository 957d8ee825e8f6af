//! Catalog errors

use thiserror::Error;

/// Errors raised while loading a DBC file or encoding/decoding against it
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Not a .dbc file: {0}")]
    InvalidExtension(String),

    #[error("Syntax error at line {line}: {message}")]
    SyntaxError { line: usize, message: String },

    #[error("Signal '{signal}' declared outside of a message at line {line}")]
    OrphanSignal { line: usize, signal: String },

    #[error("Duplicate message id {0:#X}")]
    DuplicateMessage(u32),

    #[error("Database contains no messages")]
    Empty,

    #[error("Unknown message id {0:#X}")]
    UnknownMessage(u32),

    #[error("Unknown signal '{signal}' in message '{message}'")]
    UnknownSignal { message: String, signal: String },

    #[error("Payload too short for '{message}': expected {expected} bytes, got {actual}")]
    PayloadTooShort {
        message: String,
        expected: usize,
        actual: usize,
    },

    #[error("Internal pattern error: {0}")]
    PatternError(String),
}
