//! cantx headless runner
//!
//! Loads a session, opens the configured CAN channel and transmits until the
//! requested duration elapses or Ctrl-C is pressed.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cantx_core::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session JSON (default: <config dir>/cantx/session.json)
    session: Option<PathBuf>,

    /// Override the channel from the session
    #[arg(short, long)]
    channel: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Write the session back on exit
    #[arg(long)]
    save: bool,

    /// Print available channels and exit
    #[arg(long)]
    list_channels: bool,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

fn log_event(event: ControllerEvent) {
    match event {
        ControllerEvent::FrameSent { id, payload } => {
            tracing::trace!(frame_id = %format!("0x{:03X}", id), bytes = payload.len(), "Frame sent");
        }
        ControllerEvent::BusLoad(load) => {
            tracing::info!(
                tx = %format!("{:.2}%", load.tx_percent),
                rx = %format!("{:.2}%", load.rx_percent),
                total = %format!("{:.2}%", load.total_percent),
                tx_frames = load.tx_frames,
                rx_frames = load.rx_frames,
                "Bus load"
            );
        }
        ControllerEvent::RxStats(rows) => {
            for row in rows {
                tracing::debug!(
                    frame_id = %format!("0x{:03X}", row.id),
                    name = row.name.as_deref().unwrap_or("-"),
                    count = row.count,
                    avg_period_ms = row.avg_period_ms.unwrap_or(0.0),
                    std_dev_ms = row.std_dev_ms,
                    payload = %row.payload,
                    "RX"
                );
            }
        }
        ControllerEvent::TransmissionStopped { reason } => {
            tracing::warn!(%reason, "Transmission stopped");
        }
        ControllerEvent::CommandRejected { error } => {
            tracing::warn!(%error, "Command rejected");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.list_channels {
        for channel in enumerate_channels() {
            println!("{:<12} {}", channel.channel, channel.display_name);
        }
        return Ok(());
    }

    let path = match args.session {
        Some(path) => path,
        None => SessionConfig::default_path()?,
    };
    let mut session = SessionConfig::load(&path)
        .with_context(|| format!("failed to load session {}", path.display()))?;
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let ctx = session.build_context(&base_dir)?;
    tracing::info!(
        frames = ctx.frames().len(),
        sliders = ctx.overrides().len(),
        "Session ready"
    );

    let channel = args.channel.unwrap_or_else(|| session.link.channel.clone());
    let mut transport = create_transport(session.link.kind);
    transport
        .open(&channel, &session.bus)
        .with_context(|| format!("failed to open channel {}", channel))?;

    let (controller, handle, mut events) = TxController::new(
        ctx,
        transport,
        session.bus,
        Duration::from_millis(session.report_interval_ms),
    );
    handle.start();

    let run = controller.run();
    tokio::pin!(run);
    let duration = args.duration;
    let stop = async move {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
            }
        }
    };
    tokio::pin!(stop);
    let mut stopping = false;

    let (ctx, _transport) = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = &mut stop, if !stopping => {
                stopping = true;
                handle.shutdown();
            }
            Some(event) = events.recv() => log_event(event),
        }
    };
    while let Ok(event) = events.try_recv() {
        log_event(event);
    }

    if args.save {
        session.capture(&ctx, &base_dir);
        session.save(&path)?;
    }
    Ok(())
}
