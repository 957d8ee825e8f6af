//! Received frame statistics
//!
//! Keeps one row per received identifier with the last payload and period
//! statistics. Updated on the control thread after the transport hands a
//! frame over.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::catalog::FrameCatalog;
use crate::frame::format_hex_payload;
use crate::transport::ReceivedFrame;

/// Periods kept for the standard deviation
const PERIOD_WINDOW: usize = 20;
/// Frames whose periods are discarded from the deviation window
const WARMUP_FRAMES: u64 = 5;
/// Weight of the newest period in the moving average
const EMA_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone)]
struct RxEntry {
    count: u64,
    dlc: u8,
    data: Vec<u8>,
    is_fd: bool,
    last_time: DateTime<Local>,
    last_period_ms: Option<f64>,
    min_period_ms: Option<f64>,
    max_period_ms: Option<f64>,
    avg_period_ms: Option<f64>,
    periods: VecDeque<f64>,
}

impl RxEntry {
    fn new(frame: &ReceivedFrame) -> Self {
        Self {
            count: 1,
            dlc: frame.dlc,
            data: frame.data.clone(),
            is_fd: frame.is_fd,
            last_time: frame.received_at,
            last_period_ms: None,
            min_period_ms: None,
            max_period_ms: None,
            avg_period_ms: None,
            periods: VecDeque::from([0.0]),
        }
    }

    fn update(&mut self, frame: &ReceivedFrame) {
        let period = (frame.received_at - self.last_time)
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or(0.0);

        self.count += 1;
        self.last_time = frame.received_at;
        self.dlc = frame.dlc;
        self.data = frame.data.clone();
        self.is_fd = frame.is_fd;
        self.last_period_ms = Some(period);
        self.periods.push_back(period);

        self.min_period_ms = Some(self.min_period_ms.map_or(period, |m| m.min(period)));
        self.max_period_ms = Some(self.max_period_ms.map_or(period, |m| m.max(period)));
        self.avg_period_ms = Some(match self.avg_period_ms {
            Some(avg) => EMA_WEIGHT * period + (1.0 - EMA_WEIGHT) * avg,
            None => period,
        });

        if self.periods.len() > PERIOD_WINDOW || self.count < WARMUP_FRAMES {
            self.periods.pop_front();
        }
    }

    fn std_dev(&self) -> f64 {
        let n = self.periods.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.periods.iter().sum::<f64>() / n as f64;
        let var = self.periods.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n as f64;
        var.sqrt()
    }
}

/// One row of the receive table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RxRow {
    pub id: u32,
    /// Catalog message name, if known
    pub name: Option<String>,
    pub dlc: u8,
    pub is_fd: bool,
    pub payload: String,
    pub count: u64,
    pub last_period_ms: Option<f64>,
    pub avg_period_ms: Option<f64>,
    pub min_period_ms: Option<f64>,
    pub max_period_ms: Option<f64>,
    /// Population standard deviation of the recent periods
    pub std_dev_ms: f64,
    pub last_received: DateTime<Local>,
}

/// Per-identifier receive statistics
#[derive(Debug, Clone, Default)]
pub struct RxMonitor {
    entries: BTreeMap<u32, RxEntry>,
}

impl RxMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: &ReceivedFrame) {
        match self.entries.get_mut(&frame.id) {
            Some(entry) => entry.update(frame),
            None => {
                self.entries.insert(frame.id, RxEntry::new(frame));
            }
        }
    }

    /// Rows sorted by id
    pub fn snapshot(&self, catalog: Option<&FrameCatalog>) -> Vec<RxRow> {
        self.entries
            .iter()
            .map(|(&id, e)| RxRow {
                id,
                name: catalog
                    .and_then(|c| c.message_by_id(id))
                    .map(|m| m.name.clone()),
                dlc: e.dlc,
                is_fd: e.is_fd,
                payload: format_hex_payload(&e.data),
                count: e.count,
                last_period_ms: e.last_period_ms,
                avg_period_ms: e.avg_period_ms,
                min_period_ms: e.min_period_ms,
                max_period_ms: e.max_period_ms,
                std_dev_ms: e.std_dev(),
                last_received: e.last_time,
            })
            .collect()
    }

    /// Total frames received since the last clear
    pub fn total_frames(&self) -> u64 {
        self.entries.values().map(|e| e.count).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
