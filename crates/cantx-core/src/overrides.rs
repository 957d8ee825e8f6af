//! Signal overrides (sliders)
//!
//! A slider binds one catalog signal of a frame to an integer position. The
//! range is the full raw range of the bit field mapped to engineering units,
//! so every position is encodable.

use serde::{Deserialize, Serialize};

use crate::catalog::{MessageDef, SignalDef};
use crate::error::TxError;

/// Live value injected into one signal of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOverride {
    pub frame_id: u32,
    pub message_name: String,
    pub signal_name: String,
    pub min_val: f64,
    pub max_val: f64,
    pub step: f64,
    #[serde(default)]
    pub unit: String,
    current_index: u64,
}

impl SignalOverride {
    /// Derive the slider range from the signal layout
    pub fn from_signal(message: &MessageDef, signal: &SignalDef) -> Self {
        let (min_val, max_val) = signal.physical_bounds();
        // Negative factors flip the mapping; keep min below max
        let (min_val, max_val) = if min_val <= max_val {
            (min_val, max_val)
        } else {
            (max_val, min_val)
        };
        let step = if signal.factor == 0.0 {
            1.0
        } else {
            signal.factor.abs()
        };
        Self {
            frame_id: message.frame_id,
            message_name: message.name.clone(),
            signal_name: signal.name.clone(),
            min_val,
            max_val,
            step,
            unit: signal.unit.clone(),
            current_index: 0,
        }
    }

    /// Rebuild a slider from persisted fields
    pub fn from_parts(
        frame_id: u32,
        message_name: impl Into<String>,
        signal_name: impl Into<String>,
        min_val: f64,
        max_val: f64,
        step: f64,
        index: u64,
    ) -> Self {
        let mut slider = Self {
            frame_id,
            message_name: message_name.into(),
            signal_name: signal_name.into(),
            min_val,
            max_val: max_val.max(min_val),
            step: if step > 0.0 { step } else { 1.0 },
            unit: String::new(),
            current_index: 0,
        };
        slider.set_index(index);
        slider
    }

    /// Highest valid position
    pub fn steps(&self) -> u64 {
        let span = ((self.max_val - self.min_val) / self.step).round();
        if span.is_finite() && span > 0.0 {
            span as u64
        } else {
            0
        }
    }

    pub fn index(&self) -> u64 {
        self.current_index
    }

    /// Move the slider, clamped to `[0, steps]`
    pub fn set_index(&mut self, index: u64) {
        self.current_index = index.min(self.steps());
    }

    /// Engineering value at the current position
    pub fn value(&self) -> f64 {
        self.min_val + self.current_index as f64 * self.step
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.message_name, &self.signal_name)
    }

    fn matches(&self, message: &str, signal: &str) -> bool {
        self.message_name == message && self.signal_name == signal
    }
}

/// Registered sliders in registration order
#[derive(Debug, Clone, Default)]
pub struct OverrideSet {
    overrides: Vec<SignalOverride>,
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slider; an existing `(message, signal)` pair is rejected untouched
    pub fn add(&mut self, slider: SignalOverride) -> Result<(), TxError> {
        if self.contains(&slider.message_name, &slider.signal_name) {
            return Err(TxError::DuplicateOverride {
                message: slider.message_name,
                signal: slider.signal_name,
            });
        }
        self.overrides.push(slider);
        Ok(())
    }

    pub fn remove(&mut self, message: &str, signal: &str) -> Result<SignalOverride, TxError> {
        let pos = self
            .overrides
            .iter()
            .position(|o| o.matches(message, signal))
            .ok_or_else(|| TxError::UnknownOverride {
                message: message.to_string(),
                signal: signal.to_string(),
            })?;
        Ok(self.overrides.remove(pos))
    }

    /// Drop every slider bound to a frame
    pub fn remove_frame(&mut self, frame_id: u32) -> usize {
        let before = self.overrides.len();
        self.overrides.retain(|o| o.frame_id != frame_id);
        before - self.overrides.len()
    }

    pub fn contains(&self, message: &str, signal: &str) -> bool {
        self.overrides.iter().any(|o| o.matches(message, signal))
    }

    pub fn get_mut(&mut self, message: &str, signal: &str) -> Option<&mut SignalOverride> {
        self.overrides.iter_mut().find(|o| o.matches(message, signal))
    }

    /// Sliders targeting `frame_id`, in registration order
    pub fn for_frame(&self, frame_id: u32) -> impl Iterator<Item = &SignalOverride> {
        self.overrides.iter().filter(move |o| o.frame_id == frame_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalOverride> {
        self.overrides.iter()
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ByteOrder;

    fn message(signal: SignalDef) -> MessageDef {
        MessageDef {
            frame_id: 0x100,
            is_extended: false,
            name: "Engine".into(),
            cycle_time: None,
            payload_length: 8,
            is_fd: false,
            sender: "ECU".into(),
            signals: vec![signal],
        }
    }

    #[test]
    fn test_signed_range() {
        let sig = SignalDef::new("Temp", 0, 8, ByteOrder::LittleEndian, true, 0.5, -40.0, "C");
        let msg = message(sig.clone());
        let slider = SignalOverride::from_signal(&msg, &sig);
        assert_eq!(slider.min_val, -128.0 * 0.5 - 40.0);
        assert_eq!(slider.max_val, 127.0 * 0.5 - 40.0);
        assert_eq!(slider.step, 0.5);
        assert_eq!(slider.steps(), 255);
    }

    #[test]
    fn test_index_clamped() {
        let sig = SignalDef::new("Gear", 0, 3, ByteOrder::LittleEndian, false, 1.0, 0.0, "");
        let msg = message(sig.clone());
        let mut slider = SignalOverride::from_signal(&msg, &sig);
        slider.set_index(100);
        assert_eq!(slider.index(), 7);
        assert_eq!(slider.value(), 7.0);
    }

    #[test]
    fn test_duplicate_rejected_without_mutation() {
        let sig = SignalDef::new("Rpm", 0, 16, ByteOrder::LittleEndian, false, 1.0, 0.0, "rpm");
        let msg = message(sig.clone());
        let mut set = OverrideSet::new();
        let mut first = SignalOverride::from_signal(&msg, &sig);
        first.set_index(1200);
        set.add(first.clone()).unwrap();

        let err = set.add(SignalOverride::from_signal(&msg, &sig)).unwrap_err();
        assert!(matches!(err, TxError::DuplicateOverride { .. }));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next(), Some(&first));
    }
}
