//! # cantx core library
//!
//! Periodic CAN / CAN-FD transmission driven by DBC databases.
//!
//! This library provides:
//! - DBC parsing and whole-frame signal encode/decode
//! - A transmission table with manual hex payloads
//! - Payload plugins (Lua scripts, CSV replay) and signal sliders
//! - A drift-corrected periodic scheduler
//! - Bus-load accounting and receive statistics
//! - Virtual and SLCAN transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use cantx_core::prelude::*;
//!
//! let session = SessionConfig::load("session.json")?;
//! let ctx = session.build_context(Path::new("."))?;
//!
//! let mut transport = create_transport(session.link.kind);
//! transport.open(&session.link.channel, &session.bus)?;
//!
//! let (controller, handle, events) =
//!     TxController::new(ctx, transport, session.bus, Duration::from_secs(1));
//! handle.start();
//! controller.run().await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod busload;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod overrides;
pub mod plugin;
pub mod resolver;
pub mod rx_monitor;
pub mod scheduler;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::busload::{BusLoadAccumulator, BusLoadReport, BusTiming};
    pub use crate::catalog::{ByteOrder, FrameCatalog, MessageDef, SignalDef, SignalValues};
    pub use crate::config::{ConfigError, SessionConfig};
    pub use crate::controller::{Command, ControllerEvent, ControllerHandle, TxController};
    pub use crate::error::TxError;
    pub use crate::frame::{FrameSpec, FrameTable};
    pub use crate::overrides::{OverrideSet, SignalOverride};
    pub use crate::plugin::{PayloadPlugin, PluginCache, PluginError};
    pub use crate::rx_monitor::{RxMonitor, RxRow};
    pub use crate::scheduler::{SchedulerConfig, SchedulerContext, TxScheduler};
    pub use crate::transport::{
        create_transport, enumerate_channels, CanTransport, ReceivedFrame, TransportError,
        TransportKind,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Frame id as it appears in logs: `0x1A0`
pub(crate) fn fmt_id(id: u32) -> String {
    format!("0x{:03X}", id)
}
