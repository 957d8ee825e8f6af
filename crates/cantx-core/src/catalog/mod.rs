//! Frame Catalog
//!
//! Read-only collection of message definitions loaded from a DBC file.
//!
//! The catalog is the only source of signal layout used when slider overrides
//! are composed into a payload: [`MessageDef::decode`] and [`MessageDef::encode`]
//! always work on the whole frame.

mod error;
mod parser;
mod signal;

pub use error::CatalogError;
pub use signal::{ByteOrder, SignalDef};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Physical signal values keyed by signal name
pub type SignalValues = BTreeMap<String, f64>;

/// One message (frame layout) from the database
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDef {
    /// CAN identifier without the DBC extended flag
    pub frame_id: u32,
    /// 29-bit identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// `GenMsgCycleTime` attribute in milliseconds
    pub cycle_time: Option<u32>,
    /// Payload length in bytes
    pub payload_length: u8,
    /// Declared as a CAN-FD frame
    pub is_fd: bool,
    /// Transmitting node
    pub sender: String,
    /// Signals in declaration order
    pub signals: Vec<SignalDef>,
}

impl MessageDef {
    /// Look up a signal by exact name
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Decode every signal of the message
    pub fn decode(&self, bytes: &[u8]) -> Result<SignalValues, CatalogError> {
        let expected = self.payload_length as usize;
        if bytes.len() < expected {
            return Err(CatalogError::PayloadTooShort {
                message: self.name.clone(),
                expected,
                actual: bytes.len(),
            });
        }
        Ok(self
            .signals
            .iter()
            .map(|s| (s.name.clone(), s.decode(bytes)))
            .collect())
    }

    /// Encode a full frame; signals missing from `values` are encoded as raw zero
    pub fn encode(&self, values: &SignalValues) -> Result<Vec<u8>, CatalogError> {
        if let Some(unknown) = values.keys().find(|k| self.signal(k).is_none()) {
            return Err(CatalogError::UnknownSignal {
                message: self.name.clone(),
                signal: unknown.clone(),
            });
        }

        let mut bytes = vec![0u8; self.payload_length as usize];
        for signal in &self.signals {
            match values.get(&signal.name) {
                Some(&value) => signal.encode(&mut bytes, value),
                None => signal.insert_raw(&mut bytes, 0),
            }
        }
        Ok(bytes)
    }

    /// Every signal at physical zero, used when the current payload cannot be decoded
    pub fn zero_values(&self) -> SignalValues {
        self.signals
            .iter()
            .map(|s| (s.name.clone(), 0.0))
            .collect()
    }
}

/// Message/signal database
#[derive(Debug, Clone, Default)]
pub struct FrameCatalog {
    source: Option<PathBuf>,
    messages: Vec<MessageDef>,
    by_id: HashMap<u32, usize>,
}

impl FrameCatalog {
    /// Load a catalog from a `.dbc` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let is_dbc = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("dbc"))
            .unwrap_or(false);
        if !is_dbc {
            return Err(CatalogError::InvalidExtension(path.display().to_string()));
        }

        let bytes = std::fs::read(path).map_err(|e| CatalogError::IoError(e.to_string()))?;
        let content = String::from_utf8_lossy(&bytes);

        let mut catalog = Self::from_str(&content)?;
        catalog.source = Some(path.to_path_buf());
        tracing::info!(
            path = %path.display(),
            messages = catalog.len(),
            "DBC catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse DBC text held in memory
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, CatalogError> {
        let messages = parser::parse_dbc(content)?;
        let by_id = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.frame_id, i))
            .collect();
        Ok(Self {
            source: None,
            messages,
            by_id,
        })
    }

    /// File the catalog was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn message_by_id(&self, frame_id: u32) -> Option<&MessageDef> {
        self.by_id.get(&frame_id).map(|&i| &self.messages[i])
    }

    pub fn message_by_name(&self, name: &str) -> Option<&MessageDef> {
        self.messages.iter().find(|m| m.name == name)
    }

    /// Messages in file order
    pub fn messages(&self) -> impl Iterator<Item = &MessageDef> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
