//! Periodic transmission scheduler
//!
//! One logical timer per enabled frame, all driven by a single dispatcher:
//! a min-heap of `(due, frame_id, generation)`. Restarting a timer bumps the
//! frame's generation so the entry already in the heap goes stale and is
//! dropped when popped. Removing a frame drops its state, which makes every
//! heap entry for it stale as well.
//!
//! The scheduler never reads the clock itself; callers pass `now`.

mod context;
mod drift;

pub use context::SchedulerContext;
pub use drift::{DriftController, SchedulerConfig};

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;
use tokio::time::Instant;

use crate::frame::FrameSpec;

/// Runtime timer state of one frame while transmission runs
#[derive(Debug, Clone)]
pub struct TxSchedulerState {
    pub nominal_period_ms: u32,
    /// Period the timer is currently armed with
    pub current_period_ms: u32,
    pub last_fire_time: Option<Instant>,
    pub drift: DriftController,
    pub fire_count: u64,
    pub restart_count: u64,
    generation: u64,
}

impl TxSchedulerState {
    fn new(period_ms: u32) -> Self {
        Self {
            nominal_period_ms: period_ms,
            current_period_ms: period_ms,
            last_fire_time: None,
            drift: DriftController::new(),
            fire_count: 0,
            restart_count: 0,
            generation: 0,
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.drift.offset_ms()
    }
}

/// Timer action requested by a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Keep,
    /// Timer restarted with a corrected period
    Restarted { period_ms: u32 },
}

fn period(ms: u32) -> Duration {
    Duration::from_millis(ms.max(1) as u64)
}

/// Central tick dispatcher
#[derive(Debug, Default)]
pub struct TxScheduler {
    config: SchedulerConfig,
    states: BTreeMap<u32, TxSchedulerState>,
    queue: BinaryHeap<Reverse<(Instant, u32, u64)>>,
    running: bool,
}

impl TxScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Arm every enabled frame, in ascending id order, first fire one period from `now`
    pub fn start<'a>(&mut self, now: Instant, frames: impl IntoIterator<Item = &'a FrameSpec>) {
        self.stop();
        let mut enabled: Vec<&FrameSpec> = frames.into_iter().filter(|f| f.enabled).collect();
        enabled.sort_by_key(|f| f.id);

        for frame in enabled {
            let state = TxSchedulerState::new(frame.period_ms());
            self.queue
                .push(Reverse((now + period(state.current_period_ms), frame.id, 0)));
            self.states.insert(frame.id, state);
        }
        self.running = true;
        tracing::info!(frames = self.states.len(), "Transmission started");
    }

    /// Cancel every timer; no tick is reported after this returns
    pub fn stop(&mut self) {
        let was_running = self.running;
        self.states.clear();
        self.queue.clear();
        self.running = false;
        if was_running {
            tracing::info!("Transmission stopped");
        }
    }

    /// Drop stale heap entries from the top
    fn prune(&mut self) {
        while let Some(Reverse((_, id, generation))) = self.queue.peek().copied() {
            match self.states.get(&id) {
                Some(state) if state.generation == generation => break,
                _ => {
                    self.queue.pop();
                }
            }
        }
    }

    /// Earliest pending fire time
    pub fn next_due(&mut self) -> Option<Instant> {
        self.prune();
        self.queue.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Frames due at or before `now`, ascending by (due, id).
    ///
    /// Each returned frame is re-armed one current period after `now`.
    pub fn poll_due(&mut self, now: Instant) -> Vec<u32> {
        let mut due_ids = Vec::new();
        loop {
            self.prune();
            let Some(Reverse((due, id, generation))) = self.queue.peek().copied() else {
                break;
            };
            if due > now {
                break;
            }
            self.queue.pop();
            if let Some(state) = self.states.get(&id) {
                self.queue
                    .push(Reverse((now + period(state.current_period_ms), id, generation)));
                due_ids.push(id);
            }
        }
        due_ids
    }

    /// Bookkeeping for one fire of `id`: interval measurement and drift control
    pub fn on_tick(&mut self, id: u32, now: Instant) -> TimerAction {
        let config = &self.config;
        let Some(state) = self.states.get_mut(&id) else {
            return TimerAction::Keep;
        };
        state.fire_count += 1;

        let last = state.last_fire_time.replace(now);
        let Some(last) = last else {
            return TimerAction::Keep;
        };
        let interval_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;

        match state
            .drift
            .record(interval_ms, state.nominal_period_ms, config)
        {
            Some(new_period) => {
                state.current_period_ms = new_period;
                state.restart_count += 1;
                state.generation += 1;
                self.queue
                    .push(Reverse((now + period(new_period), id, state.generation)));
                tracing::debug!(
                    frame_id = %crate::fmt_id(id),
                    period_ms = new_period,
                    "Timer restarted"
                );
                TimerAction::Restarted {
                    period_ms: new_period,
                }
            }
            None => TimerAction::Keep,
        }
    }

    /// Change the period of one running timer without touching the others
    pub fn set_period(&mut self, id: u32, period_ms: u32, now: Instant) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        let period_ms = period_ms.max(1);
        state.nominal_period_ms = period_ms;
        state.current_period_ms = period_ms;
        state.generation += 1;
        self.queue
            .push(Reverse((now + period(period_ms), id, state.generation)));
        true
    }

    /// Cancel the timer of one frame and discard its state
    pub fn remove_frame(&mut self, id: u32) -> bool {
        let removed = self.states.remove(&id).is_some();
        self.prune();
        removed
    }

    pub fn state(&self, id: u32) -> Option<&TxSchedulerState> {
        self.states.get(&id)
    }

    /// Ids with a live timer
    pub fn armed(&self) -> impl Iterator<Item = u32> + '_ {
        self.states.keys().copied()
    }
}
