//! Transmission control loop
//!
//! [`TxController`] owns the scheduler context and the transport and runs
//! everything on one task: due ticks, received frames handed over from the
//! transport reader thread, periodic reports and user commands. Nothing
//! else touches scheduler state, so no locking is needed around it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::busload::{BusLoadAccumulator, BusLoadReport, BusTiming};
use crate::error::TxError;
use crate::frame::FrameSpec;
use crate::rx_monitor::{RxMonitor, RxRow};
use crate::scheduler::SchedulerContext;
use crate::transport::{CanTransport, ReceivedFrame};

/// Edits and control requests sent to a running controller
#[derive(Debug, Clone)]
pub enum Command {
    Start,
    Stop,
    SetEnabled { id: u32, enabled: bool },
    SetPeriod { id: u32, period_ms: u32 },
    SetPayloadText { id: u32, text: String },
    AddFrame(FrameSpec),
    RemoveFrame(u32),
    AddOverride { message: String, signal: String },
    RemoveOverride { message: String, signal: String },
    SetOverrideIndex { message: String, signal: String, index: u64 },
    LinkScript { id: u32, path: Option<PathBuf> },
    SetGlobalScript(Option<PathBuf>),
    Shutdown,
}

/// Notifications from the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    FrameSent { id: u32, payload: Vec<u8> },
    BusLoad(BusLoadReport),
    RxStats(Vec<RxRow>),
    TransmissionStopped { reason: String },
    /// A command could not be applied; state is unchanged
    CommandRejected { error: String },
}

/// Cloneable command sender
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: UnboundedSender<Command>,
}

impl ControllerHandle {
    /// Returns false once the controller has shut down
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(Command::Stop)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }
}

/// Owner of the scheduler context, the transport and the statistics
pub struct TxController {
    ctx: SchedulerContext,
    transport: Box<dyn CanTransport>,
    busload: Arc<BusLoadAccumulator>,
    rx_monitor: RxMonitor,
    report_interval: Duration,
    commands: UnboundedReceiver<Command>,
    events: UnboundedSender<ControllerEvent>,
}

impl TxController {
    /// Build a controller with its command handle and event stream.
    ///
    /// The transport should already be open; sends on a closed transport
    /// stop transmission like any other bus failure.
    pub fn new(
        ctx: SchedulerContext,
        transport: Box<dyn CanTransport>,
        timing: BusTiming,
        report_interval: Duration,
    ) -> (Self, ControllerHandle, UnboundedReceiver<ControllerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = Self {
            ctx,
            transport,
            busload: Arc::new(BusLoadAccumulator::new(timing)),
            rx_monitor: RxMonitor::new(),
            report_interval: report_interval.max(Duration::from_millis(1)),
            commands: cmd_rx,
            events: event_tx,
        };
        (controller, ControllerHandle { commands: cmd_tx }, event_rx)
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn busload(&self) -> Arc<BusLoadAccumulator> {
        self.busload.clone()
    }

    /// Run until `Shutdown` or until every handle is dropped.
    ///
    /// Returns the context (for saving the session) and the transport, which
    /// has been closed.
    pub async fn run(mut self) -> (SchedulerContext, Box<dyn CanTransport>) {
        let (rx_tx, mut rx_frames) = mpsc::unbounded_channel::<ReceivedFrame>();
        self.transport.set_receive_callback(Box::new(move |frame| {
            let _ = rx_tx.send(frame);
        }));

        let mut window_start = Instant::now();
        let mut report = time::interval_at(window_start + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.ctx.next_due();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command, Instant::now()),
                },
                _ = wait_until(next_due) => self.fire_due(Instant::now()),
                Some(frame) = rx_frames.recv() => {
                    self.busload.record_rx(frame.id, frame.dlc, frame.is_fd);
                    self.rx_monitor.record(&frame);
                }
                _ = report.tick() => {
                    let now = Instant::now();
                    self.report(now.saturating_duration_since(window_start));
                    window_start = now;
                }
            }
        }

        self.ctx.stop();
        if let Err(e) = self.transport.close() {
            tracing::warn!(error = %e, "Failed to close transport");
        }
        tracing::info!("Controller shut down");
        (self.ctx, self.transport)
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    /// Fire every frame due at `now`, in ascending id order for equal due times
    fn fire_due(&mut self, now: Instant) {
        for id in self.ctx.poll_due(now) {
            match self.ctx.tick(id, now, self.transport.as_mut(), &self.busload) {
                Ok(payload) => self.emit(ControllerEvent::FrameSent { id, payload }),
                Err(e) if e.is_transport() => {
                    tracing::error!(frame_id = %crate::fmt_id(id), error = %e, "Send failed, stopping transmission");
                    self.ctx.stop();
                    self.emit(ControllerEvent::TransmissionStopped {
                        reason: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(frame_id = %crate::fmt_id(id), error = %e, "Tick failed");
                }
            }
        }
    }

    fn report(&mut self, window: Duration) {
        let load = self.busload.sample_and_reset(window.as_millis() as u64);
        tracing::debug!(
            tx = load.tx_percent,
            rx = load.rx_percent,
            total = load.total_percent,
            "Bus load"
        );
        self.emit(ControllerEvent::BusLoad(load));
        self.emit(ControllerEvent::RxStats(
            self.rx_monitor.snapshot(self.ctx.catalog()),
        ));
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        if let Err(e) = self.apply(command, now) {
            tracing::warn!(error = %e, "Command rejected");
            self.emit(ControllerEvent::CommandRejected {
                error: e.to_string(),
            });
        }
    }

    fn apply(&mut self, command: Command, now: Instant) -> Result<(), TxError> {
        match command {
            Command::Start => self.ctx.start(now),
            Command::Stop => {
                if self.ctx.is_running() {
                    self.ctx.stop();
                    self.emit(ControllerEvent::TransmissionStopped {
                        reason: "stopped by request".to_string(),
                    });
                }
            }
            Command::SetEnabled { id, enabled } => {
                if self.ctx.set_enabled(id, enabled)? {
                    self.ctx.restart(now);
                }
            }
            Command::SetPeriod { id, period_ms } => self.ctx.set_period(id, period_ms, now)?,
            Command::SetPayloadText { id, text } => self.ctx.set_payload_text(id, &text)?,
            Command::AddFrame(frame) => {
                self.ctx.add_frame(frame)?;
                self.ctx.restart(now);
            }
            Command::RemoveFrame(id) => {
                self.ctx.remove_frame(id)?;
            }
            Command::AddOverride { message, signal } => {
                self.ctx.add_override(&message, &signal)?;
                self.ctx.restart(now);
            }
            Command::RemoveOverride { message, signal } => {
                self.ctx.remove_override(&message, &signal)?;
                self.ctx.restart(now);
            }
            Command::SetOverrideIndex {
                message,
                signal,
                index,
            } => {
                self.ctx.set_override_index(&message, &signal, index)?;
            }
            Command::LinkScript { id, path } => self.ctx.link_script(id, path)?,
            Command::SetGlobalScript(path) => self.ctx.set_global_script(path),
            Command::Shutdown => {}
        }
        Ok(())
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
