//! Integration tests for the transmission controller
//!
//! Timing tests run on a paused tokio clock against the virtual bus

use cantx_core::busload::BusTiming;
use cantx_core::catalog::FrameCatalog;
use cantx_core::controller::{Command, ControllerEvent, ControllerHandle, TxController};
use cantx_core::frame::FrameSpec;
use cantx_core::scheduler::{SchedulerConfig, SchedulerContext};
use cantx_core::transport::{CanTransport, ReceivedFrame, VirtualBus, VirtualBusHandle};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

type Run = Pin<Box<dyn Future<Output = (SchedulerContext, Box<dyn CanTransport>)>>>;

struct Harness {
    run: Run,
    commands: ControllerHandle,
    events: UnboundedReceiver<ControllerEvent>,
    bus: VirtualBusHandle,
}

impl Harness {
    fn new(ctx: SchedulerContext) -> Self {
        Self::with_report_interval(ctx, Duration::from_secs(1))
    }

    fn with_report_interval(ctx: SchedulerContext, report_interval: Duration) -> Self {
        let mut bus = VirtualBus::new();
        let handle = bus.handle();
        bus.open("virtual0", &BusTiming::default()).unwrap();
        let (controller, commands, events) = TxController::new(
            ctx,
            Box::new(bus),
            BusTiming::default(),
            report_interval,
        );
        Self {
            run: Box::pin(controller.run()),
            commands,
            events,
            bus: handle,
        }
    }

    /// Drive the controller for `ms` of virtual time
    async fn advance(&mut self, ms: u64) {
        tokio::select! {
            _ = &mut self.run => panic!("controller exited early"),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }

    async fn finish(mut self) -> (SchedulerContext, Vec<ControllerEvent>) {
        self.commands.shutdown();
        let (ctx, _transport) = self.run.await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        (ctx, events)
    }
}

fn no_drift() -> SchedulerConfig {
    SchedulerConfig {
        drift_correction: false,
        ..SchedulerConfig::default()
    }
}

fn two_frames() -> SchedulerContext {
    let mut ctx = SchedulerContext::new(no_drift());
    ctx.add_frame(FrameSpec::new(0x100, "slow", 8, 100, false)).unwrap();
    ctx.add_frame(FrameSpec::new(0x200, "fast", 8, 50, false)).unwrap();
    ctx
}

#[tokio::test(start_paused = true)]
async fn test_frames_fire_at_their_periods() {
    let mut h = Harness::new(two_frames());
    h.commands.start();
    h.advance(210).await;

    assert_eq!(h.bus.sent_with_id(0x200).len(), 4);
    assert_eq!(h.bus.sent_with_id(0x100).len(), 2);

    // Equal due times go out in ascending id order
    let order: Vec<u32> = h.bus.sent().iter().map(|f| f.id).collect();
    assert_eq!(order, vec![0x200, 0x100, 0x200, 0x200, 0x100, 0x200]);

    let (ctx, events) = h.finish().await;
    assert!(!ctx.is_running());
    let sent = events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::FrameSent { .. }))
        .count();
    assert_eq!(sent, 6);
}

#[tokio::test(start_paused = true)]
async fn test_deleted_frame_never_sends_again() {
    let mut h = Harness::new(two_frames());
    h.commands.start();
    h.advance(120).await;
    assert_eq!(h.bus.sent_with_id(0x100).len(), 1);

    h.commands.send(Command::RemoveFrame(0x100));
    h.advance(1).await;
    h.bus.clear_sent();
    h.advance(500).await;

    assert!(h.bus.sent_with_id(0x100).is_empty());
    assert_eq!(h.bus.sent_with_id(0x200).len(), 10);

    let (ctx, _) = h.finish().await;
    assert!(ctx.frame(0x100).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_every_timer() {
    let mut h = Harness::new(two_frames());
    h.commands.start();
    h.advance(60).await;
    h.commands.stop();
    h.advance(1).await;
    h.bus.clear_sent();
    h.advance(500).await;
    assert!(h.bus.sent().is_empty());

    let (_, events) = h.finish().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ControllerEvent::TransmissionStopped { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_stops_transmission_once() {
    let mut h = Harness::new(two_frames());
    h.bus.set_fail_sends(true);
    h.commands.start();
    h.advance(500).await;

    let (ctx, events) = h.finish().await;
    assert!(!ctx.is_running());
    let stops = events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::TransmissionStopped { .. }))
        .count();
    assert_eq!(stops, 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ControllerEvent::FrameSent { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_broken_script_skips_only_its_frame() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("broken.lua");
    std::fs::write(&script, "function get_payload(dlc) error('boom') end").unwrap();

    let mut ctx = two_frames();
    ctx.link_script(0x100, Some(script)).unwrap();
    let mut h = Harness::new(ctx);
    h.commands.start();
    h.advance(210).await;

    assert!(h.bus.sent_with_id(0x100).is_empty());
    assert_eq!(h.bus.sent_with_id(0x200).len(), 4);
    let (ctx, _) = h.finish().await;
    // Previous displayed payload retained
    assert_eq!(ctx.frame(0x100).unwrap().manual_payload(), &[0u8; 8]);
}

#[tokio::test(start_paused = true)]
async fn test_slider_moves_apply_to_next_tick() {
    let catalog = FrameCatalog::from_str(
        "BO_ 512 Status: 2 ECU\n SG_ Mode : 0|8@1+ (1,0) [0|255] \"\" Vector__XXX\n",
    )
    .unwrap();
    let mut ctx = SchedulerContext::new(no_drift());
    ctx.set_catalog(Some(catalog));
    ctx.add_catalog_message(0x200).unwrap();
    ctx.set_period(0x200, 50, tokio::time::Instant::now()).unwrap();
    ctx.add_override("Status", "Mode").unwrap();

    let mut h = Harness::new(ctx);
    h.commands.start();
    h.advance(60).await;
    assert_eq!(h.bus.sent_with_id(0x200)[0].data, vec![0, 0]);

    h.commands.send(Command::SetOverrideIndex {
        message: "Status".into(),
        signal: "Mode".into(),
        index: 9,
    });
    h.advance(50).await;
    let sent = h.bus.sent_with_id(0x200);
    assert_eq!(sent.last().map(|f| f.data.clone()), Some(vec![9, 0]));

    let (ctx, _) = h.finish().await;
    assert_eq!(ctx.frame(0x200).unwrap().manual_payload(), &[9, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_edit_is_reported() {
    let mut h = Harness::new(two_frames());
    h.commands.send(Command::SetPayloadText {
        id: 0x100,
        text: "01 02".into(),
    });
    h.advance(1).await;

    let (ctx, events) = h.finish().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ControllerEvent::CommandRejected { .. })));
    assert_eq!(ctx.frame(0x100).unwrap().manual_payload(), &[0u8; 8]);
}

#[tokio::test(start_paused = true)]
async fn test_bus_load_reported_each_window() {
    let mut ctx = SchedulerContext::new(no_drift());
    ctx.add_frame(FrameSpec::new(0x100, "x", 8, 300, false)).unwrap();
    let mut h = Harness::new(ctx);
    h.commands.start();
    h.advance(1100).await;

    let (_, events) = h.finish().await;
    let load = events
        .iter()
        .find_map(|e| match e {
            ControllerEvent::BusLoad(load) => Some(*load),
            _ => None,
        })
        .expect("one report after the first window");
    // Fires at 300, 600 and 900 ms: 3 * 111 bits at 500 kbit/s over 1 s
    assert_eq!(load.tx_frames, 3);
    assert!((load.tx_percent - 0.0666).abs() < 1e-9);
}

fn ids(h: &Harness) -> Vec<u32> {
    h.bus.sent().iter().map(|f| f.id).collect()
}

#[tokio::test(start_paused = true)]
async fn test_enable_toggle_restarts_every_timer() {
    let mut h = Harness::new(two_frames());
    h.commands.start();
    h.advance(120).await;
    assert_eq!(h.bus.sent_with_id(0x100).len(), 1);

    h.commands.send(Command::SetEnabled {
        id: 0x100,
        enabled: false,
    });
    h.advance(1).await;
    h.bus.clear_sent();

    // 0x200 is re-armed from the disable at 120 ms, so nothing goes out at 150
    h.advance(44).await;
    assert!(h.bus.sent().is_empty());
    h.advance(10).await;
    assert_eq!(ids(&h), vec![0x200]);
    h.advance(130).await;
    assert_eq!(h.bus.sent_with_id(0x200).len(), 3);
    assert!(h.bus.sent_with_id(0x100).is_empty());

    // Re-enabled at 305 ms: first 0x100 tick one period later
    h.commands.send(Command::SetEnabled {
        id: 0x100,
        enabled: true,
    });
    h.advance(1).await;
    h.bus.clear_sent();
    h.advance(95).await;
    assert!(h.bus.sent_with_id(0x100).is_empty());
    assert_eq!(h.bus.sent_with_id(0x200).len(), 1);
    h.advance(10).await;
    assert_eq!(h.bus.sent_with_id(0x100).len(), 1);

    let (ctx, events) = h.finish().await;
    assert!(ctx.frame(0x100).unwrap().enabled);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ControllerEvent::CommandRejected { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_added_frame_restarts_every_timer() {
    let mut h = Harness::new(two_frames());
    h.commands.start();
    h.advance(120).await;

    h.commands
        .send(Command::AddFrame(FrameSpec::new(0x300, "new", 8, 100, false)));
    h.advance(1).await;
    h.bus.clear_sent();

    h.advance(44).await;
    assert!(h.bus.sent().is_empty());
    h.advance(60).await;
    // 0x200 at 170 and 220, 0x100 and 0x300 at 220
    assert_eq!(ids(&h), vec![0x200, 0x100, 0x200, 0x300]);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_slider_add_and_remove_restart_timers() {
    let catalog = FrameCatalog::from_str(
        "BO_ 512 Status: 2 ECU\n SG_ Mode : 0|8@1+ (1,0) [0|255] \"\" Vector__XXX\n",
    )
    .unwrap();
    let mut ctx = SchedulerContext::new(no_drift());
    ctx.set_catalog(Some(catalog));
    ctx.add_catalog_message(0x200).unwrap();
    ctx.set_period(0x200, 50, tokio::time::Instant::now()).unwrap();

    let mut h = Harness::new(ctx);
    h.commands.start();
    h.advance(120).await;
    assert_eq!(h.bus.sent_with_id(0x200).len(), 2);

    h.commands.send(Command::AddOverride {
        message: "Status".into(),
        signal: "Mode".into(),
    });
    h.advance(1).await;
    h.bus.clear_sent();
    h.advance(44).await;
    assert!(h.bus.sent().is_empty());
    h.advance(10).await;
    assert_eq!(h.bus.sent_with_id(0x200).len(), 1);

    // Removed at 175 ms: next tick at 225 instead of 220
    h.commands.send(Command::RemoveOverride {
        message: "Status".into(),
        signal: "Mode".into(),
    });
    h.advance(1).await;
    h.bus.clear_sent();
    h.advance(47).await;
    assert!(h.bus.sent().is_empty());
    h.advance(5).await;
    assert_eq!(h.bus.sent_with_id(0x200).len(), 1);

    let (ctx, _) = h.finish().await;
    assert!(ctx.overrides().is_empty());
}

// Real clock: the virtual bus reader is an OS thread
#[tokio::test]
async fn test_received_frames_reach_reports() {
    let mut h = Harness::with_report_interval(
        SchedulerContext::new(no_drift()),
        Duration::from_millis(20),
    );
    // Let the controller install its receive callback first
    h.advance(5).await;
    assert!(h.bus.inject(ReceivedFrame::new(0x321, vec![0; 8], false)));

    let mut rx_frames = 0;
    let mut listed = false;
    for _ in 0..100 {
        h.advance(20).await;
        while let Ok(event) = h.events.try_recv() {
            match event {
                ControllerEvent::BusLoad(load) => rx_frames += load.rx_frames,
                ControllerEvent::RxStats(rows) => {
                    listed |= rows.iter().any(|r| r.id == 0x321 && r.count == 1)
                }
                _ => {}
            }
        }
        if rx_frames > 0 && listed {
            break;
        }
    }
    assert_eq!(rx_frames, 1);
    assert!(listed);
    h.finish().await;
}
