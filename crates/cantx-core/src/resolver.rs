//! Payload resolution
//!
//! Produces the bytes sent on one tick of a frame:
//!
//! 1. the frame's own script, when linked and present on disk
//! 2. otherwise the global script
//! 3. otherwise the manual payload, padded or truncated to the DLC
//!
//! Slider overrides are then applied one after another, each one decoding the
//! output of the previous step and re-encoding the whole frame. The result is
//! always exactly `dlc` bytes.

use std::path::Path;

use crate::catalog::{FrameCatalog, MessageDef};
use crate::frame::FrameSpec;
use crate::overrides::SignalOverride;
use crate::plugin::{generate_checked, PluginCache, PluginError};

/// Where the base payload of a tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    FrameScript,
    GlobalScript,
    Manual,
}

/// Pad with zeros or truncate to exactly `dlc` bytes
pub fn fit_to_dlc(mut bytes: Vec<u8>, dlc: u8) -> Vec<u8> {
    bytes.resize(dlc as usize, 0);
    bytes
}

/// Base payload before overrides
pub fn base_payload(
    frame: &FrameSpec,
    plugins: &mut PluginCache,
    global_script: Option<&Path>,
) -> Result<(Vec<u8>, PayloadSource), PluginError> {
    let dlc = frame.dlc();

    if let Some(path) = frame.script_path.as_deref().filter(|p| p.exists()) {
        let plugin = plugins.get_or_load(path)?;
        let bytes = generate_checked(plugin, dlc, Some(frame.id))?;
        return Ok((bytes, PayloadSource::FrameScript));
    }

    if let Some(path) = global_script {
        let plugin = plugins.get_or_load(path)?;
        let bytes = generate_checked(plugin, dlc, Some(frame.id))?;
        return Ok((bytes, PayloadSource::GlobalScript));
    }

    Ok((
        fit_to_dlc(frame.manual_payload().to_vec(), dlc),
        PayloadSource::Manual,
    ))
}

/// Write one slider value into `payload`.
///
/// When the current payload does not decode, every signal of the message
/// restarts from physical zero before the slider value is set.
pub fn apply_override(message: &MessageDef, slider: &SignalOverride, payload: &[u8]) -> Option<Vec<u8>> {
    let mut values = match message.decode(payload) {
        Ok(values) => values,
        Err(e) => {
            tracing::debug!(
                frame_id = %crate::fmt_id(message.frame_id),
                error = %e,
                "Payload not decodable, slider applied over zeroed signals"
            );
            message.zero_values()
        }
    };
    values.insert(slider.signal_name.clone(), slider.value());

    match message.encode(&values) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(
                frame_id = %crate::fmt_id(message.frame_id),
                signal = %slider.signal_name,
                error = %e,
                "Slider skipped"
            );
            None
        }
    }
}

/// Resolve the payload for one tick of `frame`
pub fn resolve<'a>(
    frame: &FrameSpec,
    overrides: impl IntoIterator<Item = &'a SignalOverride>,
    plugins: &mut PluginCache,
    global_script: Option<&Path>,
    catalog: Option<&FrameCatalog>,
) -> Result<Vec<u8>, PluginError> {
    let dlc = frame.dlc();
    let (mut payload, _) = base_payload(frame, plugins, global_script)?;

    for slider in overrides.into_iter().filter(|o| o.frame_id == frame.id) {
        let Some(message) = catalog.and_then(|c| c.message_by_id(frame.id)) else {
            tracing::warn!(
                frame_id = %crate::fmt_id(frame.id),
                signal = %slider.signal_name,
                "No catalog message for slider, skipped"
            );
            continue;
        };
        if let Some(bytes) = apply_override(message, slider, &payload) {
            payload = bytes;
        }
    }

    Ok(fit_to_dlc(payload, dlc))
}
