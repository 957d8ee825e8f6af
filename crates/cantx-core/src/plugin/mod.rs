//! Payload plugins
//!
//! A plugin produces the bytes of a frame on every tick. Plugins are loaded
//! from user files once per canonical path and kept in a [`PluginCache`], so
//! any state they hold (counters, replay cursors) survives between ticks.
//!
//! The kind of plugin is chosen from the path:
//! - `*.lua`: a Lua script exporting `get_payload(dlc, frame_id)`
//! - `*.csv`: a single payload sequence replayed cyclically
//! - a directory: per-ID `payload_sequence_ID_<HEX>.csv` sequences

mod csv_replay;
mod lru;
mod lua;

pub use csv_replay::{sequence_file_name, CsvReplay, DEFAULT_SEQUENCE_CAPACITY};
pub use lru::LruCache;
pub use lua::LuaPayloadScript;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Broken plugin or plugin contract violation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("Failed to load plugin '{path}': {message}")]
    LoadFailed { path: String, message: String },

    #[error("Unsupported plugin file '{0}' (expected .lua, .csv or a directory)")]
    UnsupportedKind(String),

    #[error("Plugin does not define get_payload")]
    MissingEntryPoint,

    #[error("get_payload returned {0}, expected a byte string or a table of bytes")]
    WrongReturnType(String),

    #[error("get_payload returned {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Value {0} at position {1} is not a byte")]
    InvalidByte(i64, usize),

    #[error("Script error: {0}")]
    Runtime(String),

    #[error("No payload sequence for frame {0}")]
    NoSequence(String),

    #[error("Payload sequence '{0}' is empty")]
    EmptySequence(String),

    #[error("CSV error in '{path}' line {line}: {message}")]
    Csv {
        path: String,
        line: u64,
        message: String,
    },
}

/// A loaded payload source
pub trait PayloadPlugin {
    /// Produce the payload for one tick
    fn generate(&mut self, dlc: u8, frame_id: Option<u32>) -> Result<Vec<u8>, PluginError>;
}

/// Run a plugin and enforce the length contract
pub fn generate_checked(
    plugin: &mut dyn PayloadPlugin,
    dlc: u8,
    frame_id: Option<u32>,
) -> Result<Vec<u8>, PluginError> {
    let bytes = plugin.generate(dlc, frame_id)?;
    if bytes.len() != dlc as usize {
        return Err(PluginError::WrongLength {
            expected: dlc as usize,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn load_plugin(path: &Path) -> Result<Box<dyn PayloadPlugin>, PluginError> {
    if path.is_dir() {
        return Ok(Box::new(CsvReplay::from_directory(
            path,
            DEFAULT_SEQUENCE_CAPACITY,
        )?));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("lua") => Ok(Box::new(LuaPayloadScript::load(path)?)),
        Some("csv") => Ok(Box::new(CsvReplay::from_file(path)?)),
        _ => Err(PluginError::UnsupportedKind(path.display().to_string())),
    }
}

/// Loaded plugins keyed by canonical path
#[derive(Default)]
pub struct PluginCache {
    plugins: HashMap<PathBuf, Box<dyn PayloadPlugin>>,
}

impl std::fmt::Debug for PluginCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCache")
            .field("paths", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn canonical(path: &Path) -> Result<PathBuf, PluginError> {
    path.canonicalize().map_err(|e| PluginError::LoadFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

impl PluginCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached plugin for `path`, loading it on first use.
    ///
    /// A failed load is not cached; the next call retries.
    pub fn get_or_load(&mut self, path: &Path) -> Result<&mut dyn PayloadPlugin, PluginError> {
        let key = canonical(path)?;
        if !self.plugins.contains_key(&key) {
            let plugin = load_plugin(&key)?;
            tracing::info!(path = %key.display(), "Payload plugin loaded");
            self.plugins.insert(key.clone(), plugin);
        }
        match self.plugins.get_mut(&key) {
            Some(plugin) => Ok(plugin.as_mut()),
            None => Err(PluginError::LoadFailed {
                path: key.display().to_string(),
                message: "plugin vanished from cache".into(),
            }),
        }
    }

    /// Install an already constructed plugin under `path`
    pub fn insert(&mut self, path: impl Into<PathBuf>, plugin: Box<dyn PayloadPlugin>) {
        let path = path.into();
        let key = path.canonicalize().unwrap_or(path);
        self.plugins.insert(key, plugin);
    }

    /// Drop the entry for `path`; the next use reloads the file
    pub fn invalidate(&mut self, path: &Path) -> bool {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let removed = self.plugins.remove(&key).is_some();
        if removed {
            tracing::debug!(path = %key.display(), "Payload plugin invalidated");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.plugins.clear();
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.canonicalize()
            .map(|key| self.plugins.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
