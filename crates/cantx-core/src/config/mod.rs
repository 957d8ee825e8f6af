//! Session configuration
//!
//! A session is stored as one JSON file: the DBC path, the global script,
//! the transmission table (`signals`) and the sliders. Ids are written as
//! hex text (`"0x100"`). Paths are stored relative to the session file when
//! they live below it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::busload::BusTiming;
use crate::catalog::{CatalogError, FrameCatalog};
use crate::error::TxError;
use crate::frame::{FrameSpec, DEFAULT_PERIOD_MS, MAX_CLASSIC_DLC};
use crate::overrides::SignalOverride;
use crate::scheduler::{SchedulerConfig, SchedulerContext};
use crate::transport::TransportKind;

/// Errors while reading or writing a session file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid session JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame id '{0}'")]
    InvalidFrameId(String),

    #[error("Failed to load DBC file: {0}")]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Session(#[from] TxError),

    #[error("Could not find a configuration directory")]
    NoConfigDir,
}

/// One row of the transmission table as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hex text, e.g. `"0x100"`
    pub id: String,
    #[serde(default)]
    pub fd: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_period")]
    pub period: u32,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_dlc")]
    pub dlc: u8,
    #[serde(default)]
    pub script_path: Option<String>,
}

/// One slider as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderEntry {
    pub msg_name: String,
    pub signal_name: String,
    pub frame_id: u32,
    pub min_val: f64,
    pub max_val: f64,
    pub step: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub value_index: u64,
}

/// Adapter selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    pub kind: TransportKind,
    /// Channel name passed to the transport (`virtual0`, `/dev/ttyACM0`, ...)
    pub channel: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Virtual,
            channel: "virtual0".to_string(),
        }
    }
}

/// Everything needed to restore a transmission session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub dbc_file: Option<String>,

    #[serde(default)]
    pub global_script: Option<String>,

    #[serde(default)]
    pub signals: Vec<FrameEntry>,

    #[serde(default)]
    pub sliders: Vec<SliderEntry>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub bus: BusTiming,

    #[serde(default)]
    pub link: LinkSettings,

    /// Interval between bus-load and RX statistics reports
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_period() -> u32 {
    DEFAULT_PERIOD_MS
}

fn default_dlc() -> u8 {
    MAX_CLASSIC_DLC
}

fn default_report_interval() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dbc_file: None,
            global_script: None,
            signals: Vec::new(),
            sliders: Vec::new(),
            scheduler: SchedulerConfig::default(),
            bus: BusTiming::default(),
            link: LinkSettings::default(),
            report_interval_ms: default_report_interval(),
        }
    }
}

/// Parse `"0x1A0"`, `"1a0"` or `"0X1A0"`
pub fn parse_frame_id(text: &str) -> Result<u32, ConfigError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidFrameId(text.to_string()))
}

/// Resolve a stored path against the session directory
pub fn resolve_path(base_dir: &Path, stored: &str) -> PathBuf {
    let path = Path::new(stored);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Store `path` relative to the session directory when it lives below it
pub fn relative_path(base_dir: &Path, path: &Path) -> String {
    path.strip_prefix(base_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

impl FrameEntry {
    /// Build the frame; malformed payload text falls back to zeros
    pub fn to_frame(&self, base_dir: &Path) -> Result<FrameSpec, ConfigError> {
        let id = parse_frame_id(&self.id)?;
        let mut frame = FrameSpec::new(id, self.name.clone(), self.dlc, self.period, self.fd);
        frame.enabled = self.enabled;
        if !self.payload.trim().is_empty() {
            if let Err(e) = frame.set_payload_text(&self.payload) {
                tracing::warn!(
                    frame_id = %crate::fmt_id(id),
                    error = %e,
                    "Stored payload rejected, using zeros"
                );
            }
        }
        frame.script_path = self
            .script_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| resolve_path(base_dir, p));
        Ok(frame)
    }

    pub fn from_frame(frame: &FrameSpec, base_dir: &Path) -> Self {
        Self {
            enabled: frame.enabled,
            id: format!("0x{:X}", frame.id),
            fd: frame.is_fd(),
            name: frame.name.clone(),
            period: frame.period_ms(),
            payload: frame.payload_text(),
            dlc: frame.dlc(),
            script_path: frame
                .script_path
                .as_deref()
                .map(|p| relative_path(base_dir, p)),
        }
    }
}

impl SliderEntry {
    pub fn to_override(&self) -> SignalOverride {
        let mut slider = SignalOverride::from_parts(
            self.frame_id,
            self.msg_name.clone(),
            self.signal_name.clone(),
            self.min_val,
            self.max_val,
            self.step,
            self.value_index,
        );
        slider.unit = self.unit.clone();
        slider
    }

    pub fn from_override(slider: &SignalOverride) -> Self {
        Self {
            msg_name: slider.message_name.clone(),
            signal_name: slider.signal_name.clone(),
            frame_id: slider.frame_id,
            min_val: slider.min_val,
            max_val: slider.max_val,
            step: slider.step,
            unit: slider.unit.clone(),
            value_index: slider.index(),
        }
    }
}

impl SessionConfig {
    /// `<config dir>/cantx/session.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(base.join("cantx").join("session.json"))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        tracing::info!(path = %path.as_ref().display(), "Session loaded");
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        tracing::info!(path = %path.display(), "Session saved");
        Ok(())
    }

    /// Build a scheduler context; `base_dir` is the directory of the session file.
    ///
    /// Sliders that collide with an earlier one are skipped with a warning.
    pub fn build_context(&self, base_dir: &Path) -> Result<SchedulerContext, ConfigError> {
        let mut ctx = SchedulerContext::new(self.scheduler.clone());

        if let Some(dbc) = self.dbc_file.as_deref().filter(|p| !p.is_empty()) {
            let catalog = FrameCatalog::from_file(resolve_path(base_dir, dbc))?;
            ctx.set_catalog(Some(catalog));
        }
        if let Some(script) = self.global_script.as_deref().filter(|p| !p.is_empty()) {
            ctx.set_global_script(Some(resolve_path(base_dir, script)));
        }

        for entry in &self.signals {
            ctx.add_frame(entry.to_frame(base_dir)?)?;
        }
        for entry in &self.sliders {
            if let Err(e) = ctx.insert_override(entry.to_override()) {
                tracing::warn!(
                    frame_id = %crate::fmt_id(entry.frame_id),
                    message = %entry.msg_name,
                    signal = %entry.signal_name,
                    error = %e,
                    "Stored slider skipped"
                );
            }
        }
        Ok(ctx)
    }

    /// Snapshot the editable parts of a context, keeping the other sections
    pub fn capture(&mut self, ctx: &SchedulerContext, base_dir: &Path) {
        self.dbc_file = ctx
            .catalog()
            .and_then(|c| c.source())
            .map(|p| relative_path(base_dir, p));
        self.global_script = ctx.global_script().map(|p| relative_path(base_dir, p));
        self.signals = ctx
            .frames()
            .iter()
            .map(|f| FrameEntry::from_frame(f, base_dir))
            .collect();
        self.sliders = ctx.overrides().iter().map(SliderEntry::from_override).collect();
        self.scheduler = ctx.scheduler_config().clone();
    }
}
