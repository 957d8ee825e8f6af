//! In-process CAN bus
//!
//! Used by the headless runner when no adapter is present and by tests.
//! Sent frames are recorded; frames injected through a [`VirtualBusHandle`]
//! are delivered by a reader thread, like a hardware receive loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    deliver, CanTransport, ChannelInfo, ReceiveCallback, ReceivedFrame, SharedCallback,
    TransportError, TransportKind,
};
use crate::busload::BusTiming;

const CHANNEL_NAME: &str = "virtual0";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(super) fn enumerate_channels() -> Vec<ChannelInfo> {
    vec![ChannelInfo {
        display_name: "Virtual CAN bus".to_string(),
        channel: CHANNEL_NAME.to_string(),
        kind: TransportKind::Virtual,
    }]
}

/// A frame handed to the virtual bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub dlc: u8,
    pub is_fd: bool,
}

#[derive(Debug, Default)]
struct Shared {
    sent: Mutex<Vec<SentFrame>>,
    fail_sends: AtomicBool,
    loopback: AtomicBool,
}

/// Test-side view of a [`VirtualBus`]
#[derive(Debug, Clone)]
pub struct VirtualBusHandle {
    shared: Arc<Shared>,
    inject: Sender<ReceivedFrame>,
}

impl VirtualBusHandle {
    /// Frames sent so far
    pub fn sent(&self) -> Vec<SentFrame> {
        self.shared
            .sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Frames sent so far with the given id
    pub fn sent_with_id(&self, id: u32) -> Vec<SentFrame> {
        self.sent().into_iter().filter(|f| f.id == id).collect()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut s) = self.shared.sent.lock() {
            s.clear();
        }
    }

    /// Deliver a frame as if it came from another node
    pub fn inject(&self, frame: ReceivedFrame) -> bool {
        self.inject.send(frame).is_ok()
    }

    /// Make every following send fail, as on a disconnected adapter
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Echo sent frames back through the receive callback
    pub fn set_loopback(&self, on: bool) {
        self.shared.loopback.store(on, Ordering::SeqCst);
    }
}

/// In-process transport
pub struct VirtualBus {
    shared: Arc<Shared>,
    inject_tx: Sender<ReceivedFrame>,
    inject_rx: Option<Receiver<ReceivedFrame>>,
    callback: SharedCallback,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<Receiver<ReceivedFrame>>>,
    open: bool,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared::default()),
            inject_tx,
            inject_rx: Some(inject_rx),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
            open: false,
        }
    }

    pub fn handle(&self) -> VirtualBusHandle {
        VirtualBusHandle {
            shared: self.shared.clone(),
            inject: self.inject_tx.clone(),
        }
    }

    fn spawn_reader(&mut self) -> Result<(), TransportError> {
        let Some(rx) = self.inject_rx.take() else {
            return Err(TransportError::AlreadyOpen);
        };
        let callback = self.callback.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("virtual-can-rx".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(POLL_INTERVAL) {
                        Ok(frame) => deliver(&callback, frame),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Hand the receiver back so the bus can be reopened
                rx
            })?;
        self.reader = Some(handle);
        Ok(())
    }
}

impl CanTransport for VirtualBus {
    fn open(&mut self, channel: &str, _timing: &BusTiming) -> Result<(), TransportError> {
        if self.open {
            return Err(TransportError::AlreadyOpen);
        }
        if channel != CHANNEL_NAME {
            return Err(TransportError::InvalidChannel(channel.to_string()));
        }
        self.spawn_reader()?;
        self.open = true;
        tracing::info!(channel, "Virtual bus opened");
        Ok(())
    }

    fn send(&mut self, id: u32, data: &[u8], dlc: u8, is_fd: bool) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("virtual bus disconnected".into()));
        }
        let frame = SentFrame {
            id,
            data: data.to_vec(),
            dlc,
            is_fd,
        };
        if let Ok(mut sent) = self.shared.sent.lock() {
            sent.push(frame);
        }
        if self.shared.loopback.load(Ordering::SeqCst) {
            let _ = self.inject_tx.send(ReceivedFrame::new(id, data.to_vec(), is_fd));
        }
        Ok(())
    }

    fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            match reader.join() {
                Ok(rx) => self.inject_rx = Some(rx),
                Err(_) => tracing::warn!("Virtual bus reader thread panicked"),
            }
        }
        self.open = false;
        tracing::info!("Virtual bus closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
