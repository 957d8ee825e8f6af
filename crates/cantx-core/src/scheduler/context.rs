//! Scheduler context
//!
//! Single owner of everything a tick needs: the frame table, the sliders,
//! the plugin cache, the global script, the catalog and the timer state.
//! All edits go through here so restarts and cache invalidation stay
//! consistent with what is running.

use std::path::{Path, PathBuf};
use tokio::time::Instant;

use super::{SchedulerConfig, TimerAction, TxScheduler, TxSchedulerState};
use crate::busload::BusLoadAccumulator;
use crate::catalog::FrameCatalog;
use crate::error::TxError;
use crate::frame::{FrameSpec, FrameTable};
use crate::overrides::{OverrideSet, SignalOverride};
use crate::plugin::PluginCache;
use crate::resolver;
use crate::transport::CanTransport;

/// Mutable scheduler state owned by one controller
#[derive(Debug, Default)]
pub struct SchedulerContext {
    frames: FrameTable,
    overrides: OverrideSet,
    plugins: PluginCache,
    global_script: Option<PathBuf>,
    catalog: Option<FrameCatalog>,
    scheduler: TxScheduler,
}

impl SchedulerContext {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            scheduler: TxScheduler::new(config),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn frame(&self, id: u32) -> Option<&FrameSpec> {
        self.frames.get(id)
    }

    pub fn overrides(&self) -> &OverrideSet {
        &self.overrides
    }

    pub fn catalog(&self) -> Option<&FrameCatalog> {
        self.catalog.as_ref()
    }

    pub fn global_script(&self) -> Option<&Path> {
        self.global_script.as_deref()
    }

    pub fn plugins(&self) -> &PluginCache {
        &self.plugins
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    pub fn set_scheduler_config(&mut self, config: SchedulerConfig) {
        self.scheduler.set_config(config);
    }

    /// Install a new catalog; sliders of the previous one are dropped
    pub fn set_catalog(&mut self, catalog: Option<FrameCatalog>) {
        if !self.overrides.is_empty() {
            tracing::info!(count = self.overrides.len(), "Sliders cleared for new catalog");
        }
        self.overrides = OverrideSet::new();
        self.catalog = catalog;
    }

    // ---- frame table -------------------------------------------------------

    pub fn add_frame(&mut self, frame: FrameSpec) -> Result<(), TxError> {
        tracing::debug!(frame_id = %crate::fmt_id(frame.id), name = %frame.name, "Frame added");
        Ok(self.frames.insert(frame)?)
    }

    /// Add a frame seeded from the catalog message with this id
    pub fn add_catalog_message(&mut self, frame_id: u32) -> Result<(), TxError> {
        let message = self
            .catalog
            .as_ref()
            .ok_or(TxError::NoCatalog)?
            .message_by_id(frame_id)
            .ok_or(TxError::UnknownMessage(frame_id))?;
        let frame = FrameSpec::from_message(message);
        self.add_frame(frame)
    }

    /// Delete a frame together with its timer and sliders
    pub fn remove_frame(&mut self, id: u32) -> Result<FrameSpec, TxError> {
        if !self.frames.contains(id) {
            return Err(TxError::UnknownFrame(id));
        }
        self.scheduler.remove_frame(id);
        let dropped = self.overrides.remove_frame(id);
        let frame = self.frames.remove(id)?;
        tracing::debug!(frame_id = %crate::fmt_id(id), sliders = dropped, "Frame removed");
        Ok(frame)
    }

    fn frame_mut(&mut self, id: u32) -> Result<&mut FrameSpec, TxError> {
        self.frames.get_mut(id).ok_or(TxError::UnknownFrame(id))
    }

    /// Returns true when the flag actually changed
    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Result<bool, TxError> {
        let frame = self.frame_mut(id)?;
        let changed = frame.enabled != enabled;
        frame.enabled = enabled;
        Ok(changed)
    }

    /// Change a frame's period; a running timer is patched in place
    pub fn set_period(&mut self, id: u32, period_ms: u32, now: Instant) -> Result<(), TxError> {
        let frame = self.frame_mut(id)?;
        frame.set_period_ms(period_ms);
        let period_ms = frame.period_ms();
        if self.scheduler.is_running() {
            self.scheduler.set_period(id, period_ms, now);
        }
        Ok(())
    }

    pub fn set_dlc(&mut self, id: u32, dlc: u8) -> Result<(), TxError> {
        self.frame_mut(id)?.set_dlc(dlc);
        Ok(())
    }

    /// Apply a manual payload edit; rejected text leaves the payload unchanged
    pub fn set_payload_text(&mut self, id: u32, text: &str) -> Result<(), TxError> {
        Ok(self.frame_mut(id)?.set_payload_text(text)?)
    }

    /// Link (or unlink) the per-frame script; the old script is evicted from the cache
    pub fn link_script(&mut self, id: u32, path: Option<PathBuf>) -> Result<(), TxError> {
        let frame = self.frames.get_mut(id).ok_or(TxError::UnknownFrame(id))?;
        let old = std::mem::replace(&mut frame.script_path, path);
        if let Some(old) = old {
            self.plugins.invalidate(&old);
        }
        Ok(())
    }

    /// Replace the global script and drop every cached plugin
    pub fn set_global_script(&mut self, path: Option<PathBuf>) {
        self.plugins.clear();
        self.global_script = path;
    }

    // ---- sliders -----------------------------------------------------------

    /// Register a slider for a catalog signal of a frame in the table
    pub fn add_override(&mut self, message_name: &str, signal_name: &str) -> Result<(), TxError> {
        let catalog = self.catalog.as_ref().ok_or(TxError::NoCatalog)?;
        let unknown = || TxError::UnknownSignal {
            message: message_name.to_string(),
            signal: signal_name.to_string(),
        };
        let message = catalog.message_by_name(message_name).ok_or_else(unknown)?;
        let signal = message.signal(signal_name).ok_or_else(unknown)?;
        if !self.frames.contains(message.frame_id) {
            return Err(TxError::UnknownFrame(message.frame_id));
        }
        let slider = SignalOverride::from_signal(message, signal);
        self.overrides.add(slider)
    }

    /// Register an already built slider (restored sessions).
    ///
    /// The slider's frame must be in the table; with a catalog loaded, its
    /// signal must also belong to that frame's message.
    pub fn insert_override(&mut self, slider: SignalOverride) -> Result<(), TxError> {
        if !self.frames.contains(slider.frame_id) {
            return Err(TxError::UnknownFrame(slider.frame_id));
        }
        if let Some(catalog) = &self.catalog {
            let known = catalog
                .message_by_name(&slider.message_name)
                .filter(|m| m.frame_id == slider.frame_id)
                .and_then(|m| m.signal(&slider.signal_name))
                .is_some();
            if !known {
                return Err(TxError::UnknownSignal {
                    message: slider.message_name.clone(),
                    signal: slider.signal_name.clone(),
                });
            }
        }
        self.overrides.add(slider)
    }

    pub fn remove_override(&mut self, message_name: &str, signal_name: &str) -> Result<SignalOverride, TxError> {
        self.overrides.remove(message_name, signal_name)
    }

    /// Move a slider; returns the new engineering value
    pub fn set_override_index(
        &mut self,
        message_name: &str,
        signal_name: &str,
        index: u64,
    ) -> Result<f64, TxError> {
        let slider = self
            .overrides
            .get_mut(message_name, signal_name)
            .ok_or_else(|| TxError::UnknownOverride {
                message: message_name.to_string(),
                signal: signal_name.to_string(),
            })?;
        slider.set_index(index);
        Ok(slider.value())
    }

    // ---- transmission ------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn start(&mut self, now: Instant) {
        self.scheduler.start(now, self.frames.iter());
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    /// Full stop and start, used when the enabled set or the sliders change
    pub fn restart(&mut self, now: Instant) {
        if self.scheduler.is_running() {
            self.scheduler.stop();
            self.scheduler.start(now, self.frames.iter());
        }
    }

    pub fn next_due(&mut self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn poll_due(&mut self, now: Instant) -> Vec<u32> {
        self.scheduler.poll_due(now)
    }

    pub fn timer_state(&self, id: u32) -> Option<&TxSchedulerState> {
        self.scheduler.state(id)
    }

    /// Payload the frame would send now, without sending it
    pub fn resolve_payload(&mut self, id: u32) -> Result<Vec<u8>, TxError> {
        let frame = self.frames.get(id).ok_or(TxError::UnknownFrame(id))?;
        Ok(resolver::resolve(
            frame,
            self.overrides.for_frame(id),
            &mut self.plugins,
            self.global_script.as_deref(),
            self.catalog.as_ref(),
        )?)
    }

    /// One fire of frame `id`: timer bookkeeping, resolution, send, accounting.
    ///
    /// On success the frame's manual payload shows the bytes actually sent.
    pub fn tick(
        &mut self,
        id: u32,
        now: Instant,
        transport: &mut dyn CanTransport,
        busload: &BusLoadAccumulator,
    ) -> Result<Vec<u8>, TxError> {
        if let TimerAction::Restarted { period_ms } = self.scheduler.on_tick(id, now) {
            tracing::trace!(frame_id = %crate::fmt_id(id), period_ms, "Corrected period armed");
        }

        let payload = self.resolve_payload(id)?;
        let frame = self.frame_mut(id)?;
        let (dlc, is_fd) = (frame.dlc(), frame.is_fd());

        transport.send(id, &payload, dlc, is_fd)?;
        frame.set_manual_payload(&payload);
        busload.record_tx(id, dlc, is_fd);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_remove_frame_drops_timer_and_sliders() {
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        ctx.add_frame(FrameSpec::new(0x100, "a", 8, 10, false)).unwrap();
        ctx.insert_override(SignalOverride::from_parts(0x100, "A", "S", 0.0, 10.0, 1.0, 3))
            .unwrap();
        ctx.start(Instant::now());
        assert!(ctx.timer_state(0x100).is_some());

        ctx.remove_frame(0x100).unwrap();
        assert!(ctx.timer_state(0x100).is_none());
        assert!(ctx.overrides().is_empty());
        assert!(matches!(ctx.remove_frame(0x100), Err(TxError::UnknownFrame(_))));
    }

    #[test]
    fn test_set_period_while_stopped_only_edits_frame() {
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        ctx.add_frame(FrameSpec::new(0x100, "a", 8, 10, false)).unwrap();
        ctx.set_period(0x100, 250, Instant::now()).unwrap();
        assert_eq!(ctx.frame(0x100).map(|f| f.period_ms()), Some(250));
        assert!(ctx.timer_state(0x100).is_none());
    }

    #[test]
    fn test_add_override_needs_catalog() {
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        assert!(matches!(
            ctx.add_override("Engine", "Rpm"),
            Err(TxError::NoCatalog)
        ));
    }

    #[test]
    fn test_restart_recreates_timer_state() {
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        ctx.add_frame(FrameSpec::new(0x100, "a", 8, 10, false)).unwrap();
        ctx.insert_override(SignalOverride::from_parts(0x100, "A", "S", 0.0, 10.0, 1.0, 3))
            .unwrap();
        let t0 = Instant::now();
        ctx.start(t0);
        for n in 1..=3u64 {
            let now = t0 + Duration::from_millis(10 * n);
            assert_eq!(ctx.poll_due(now), vec![0x100]);
            ctx.scheduler.on_tick(0x100, now);
        }
        let state = ctx.timer_state(0x100).unwrap();
        assert_eq!(state.fire_count, 3);
        assert_eq!(state.drift.sample_count(), 2);

        ctx.remove_override("A", "S").unwrap();
        let restart_at = t0 + Duration::from_millis(35);
        ctx.restart(restart_at);
        let state = ctx.timer_state(0x100).unwrap();
        assert_eq!(state.fire_count, 0);
        assert_eq!(state.drift.sample_count(), 0);
        assert!(state.last_fire_time.is_none());
        assert_eq!(ctx.next_due(), Some(restart_at + Duration::from_millis(10)));
    }

    #[test]
    fn test_restart_while_stopped_does_not_arm() {
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        ctx.add_frame(FrameSpec::new(0x100, "a", 8, 10, false)).unwrap();
        ctx.restart(Instant::now());
        assert!(!ctx.is_running());
        assert_eq!(ctx.next_due(), None);
    }

    #[test]
    fn test_insert_override_rejects_orphans() {
        let catalog = FrameCatalog::from_str(
            "BO_ 256 Engine: 8 ECU\n SG_ Rpm : 0|16@1+ (1,0) [0|65535] \"\" Vector__XXX\n",
        )
        .unwrap();
        let mut ctx = SchedulerContext::new(SchedulerConfig::default());
        ctx.set_catalog(Some(catalog));
        ctx.add_frame(FrameSpec::new(0x100, "Engine", 8, 10, false)).unwrap();

        let slider = |id, message: &str, signal: &str| {
            SignalOverride::from_parts(id, message, signal, 0.0, 10.0, 1.0, 0)
        };
        assert!(matches!(
            ctx.insert_override(slider(0x300, "Engine", "Rpm")),
            Err(TxError::UnknownFrame(0x300))
        ));
        assert!(matches!(
            ctx.insert_override(slider(0x100, "Engine", "Ghost")),
            Err(TxError::UnknownSignal { .. })
        ));
        assert!(matches!(
            ctx.insert_override(slider(0x100, "Other", "Rpm")),
            Err(TxError::UnknownSignal { .. })
        ));
        ctx.insert_override(slider(0x100, "Engine", "Rpm")).unwrap();
        assert_eq!(ctx.overrides().len(), 1);
    }
}
