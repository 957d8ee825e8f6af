//! Bus-load accounting
//!
//! Every sent and received frame adds its bit budget to per-direction
//! counters. Once per reporting window the counters are turned into a bus
//! time percentage and cleared under the same lock.
//!
//! Bit stuffing is not counted.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::frame::MAX_STANDARD_ID;

/// Start of frame
const SOF_BITS: u64 = 1;
const STANDARD_ID_BITS: u64 = 11;
const EXTENDED_ID_BITS: u64 = 29;
/// RTR/IDE/r0 (or SRR/IDE/RTR on extended frames)
const CONTROL_BITS: u64 = 3;
const DLC_BITS: u64 = 4;
/// CRC sequence and delimiter
const CLASSIC_CRC_BITS: u64 = 16;
const ACK_BITS: u64 = 2;
const EOF_BITS: u64 = 7;
const IFS_BITS: u64 = 3;
/// CRC17/CRC21 plus delimiter
const FD_CRC_SHORT_BITS: u64 = 18;
const FD_CRC_LONG_BITS: u64 = 22;

/// Bitrates of the bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTiming {
    /// Nominal (arbitration) bitrate in bit/s
    pub nominal_bitrate: u32,
    /// CAN-FD data phase bitrate in bit/s
    pub data_bitrate: u32,
    /// Link opened in CAN-FD mode
    pub fd: bool,
    /// Count every frame with a 29-bit identifier
    pub extended_ids: bool,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            nominal_bitrate: 500_000,
            data_bitrate: 2_000_000,
            fd: false,
            extended_ids: false,
        }
    }
}

/// Bits of one frame split by the bitrate they travel at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameBits {
    /// Bits sent at the nominal bitrate
    pub arbitration: u64,
    /// Bits sent at the data bitrate (nominal bitrate for classic frames)
    pub data: u64,
}

impl FrameBits {
    /// Bit budget of one frame
    pub fn of(dlc: u8, extended: bool, is_fd: bool) -> Self {
        let id_bits = if extended {
            EXTENDED_ID_BITS
        } else {
            STANDARD_ID_BITS
        };
        let header = SOF_BITS + id_bits + CONTROL_BITS + DLC_BITS;
        let payload = 8 * dlc as u64;
        let trailer = ACK_BITS + EOF_BITS + IFS_BITS;

        if is_fd {
            let crc = if dlc <= 16 {
                FD_CRC_SHORT_BITS
            } else {
                FD_CRC_LONG_BITS
            };
            Self {
                arbitration: header + trailer,
                data: payload + crc,
            }
        } else {
            Self {
                arbitration: header,
                data: payload + CLASSIC_CRC_BITS + trailer,
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.arbitration + self.data
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DirectionCounters {
    arbitration_bits: u64,
    data_bits: u64,
    /// Data bits of classic frames, which stay at the nominal rate
    classic_bits: u64,
    frames: u64,
}

impl DirectionCounters {
    fn add(&mut self, bits: FrameBits, is_fd: bool) {
        self.arbitration_bits += bits.arbitration;
        self.data_bits += bits.data;
        if !is_fd {
            self.classic_bits += bits.data;
        }
        self.frames += 1;
    }

    /// Bus time occupied in seconds
    fn seconds(&self, timing: &BusTiming) -> f64 {
        let nominal = timing.nominal_bitrate.max(1) as f64;
        let data_rate = timing.data_bitrate.max(1) as f64;
        let fd_data_bits = self.data_bits - self.classic_bits;
        (self.arbitration_bits + self.classic_bits) as f64 / nominal + fd_data_bits as f64 / data_rate
    }
}

/// Utilization of one reporting window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BusLoadReport {
    pub tx_percent: f64,
    pub rx_percent: f64,
    pub total_percent: f64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub tx_arbitration_bits: u64,
    pub tx_data_bits: u64,
    pub rx_arbitration_bits: u64,
    pub rx_data_bits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tx: DirectionCounters,
    rx: DirectionCounters,
}

/// TX/RX bit counters
#[derive(Debug)]
pub struct BusLoadAccumulator {
    timing: BusTiming,
    counters: Mutex<Counters>,
}

impl BusLoadAccumulator {
    pub fn new(timing: BusTiming) -> Self {
        Self {
            timing,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    fn bits(&self, id: u32, dlc: u8, is_fd: bool) -> FrameBits {
        let extended = self.timing.extended_ids || id > MAX_STANDARD_ID;
        FrameBits::of(dlc, extended, is_fd)
    }

    pub fn record_tx(&self, id: u32, dlc: u8, is_fd: bool) {
        let bits = self.bits(id, dlc, is_fd);
        if let Ok(mut c) = self.counters.lock() {
            c.tx.add(bits, is_fd);
        }
    }

    pub fn record_rx(&self, id: u32, dlc: u8, is_fd: bool) {
        let bits = self.bits(id, dlc, is_fd);
        if let Ok(mut c) = self.counters.lock() {
            c.rx.add(bits, is_fd);
        }
    }

    /// Read and clear the counters in one step
    pub fn sample_and_reset(&self, window_ms: u64) -> BusLoadReport {
        let (tx, rx) = match self.counters.lock() {
            Ok(mut c) => {
                let taken = std::mem::take(&mut *c);
                (taken.tx, taken.rx)
            }
            Err(_) => return BusLoadReport::default(),
        };

        let window_s = window_ms.max(1) as f64 / 1000.0;
        let tx_percent = tx.seconds(&self.timing) * 100.0 / window_s;
        let rx_percent = rx.seconds(&self.timing) * 100.0 / window_s;
        BusLoadReport {
            tx_percent,
            rx_percent,
            total_percent: tx_percent + rx_percent,
            tx_frames: tx.frames,
            rx_frames: rx.frames,
            tx_arbitration_bits: tx.arbitration_bits,
            tx_data_bits: tx.data_bits,
            rx_arbitration_bits: rx.arbitration_bits,
            rx_data_bits: rx.data_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_bits() {
        let small = FrameBits::of(16, false, true);
        assert_eq!(small.arbitration, 19 + 12);
        assert_eq!(small.data, 128 + 18);

        let large = FrameBits::of(64, true, true);
        assert_eq!(large.arbitration, 37 + 12);
        assert_eq!(large.data, 512 + 22);
    }

    #[test]
    fn test_extended_by_id() {
        let acc = BusLoadAccumulator::new(BusTiming::default());
        acc.record_tx(0x800, 0, false);
        let report = acc.sample_and_reset(1000);
        assert_eq!(report.tx_arbitration_bits, 37);
    }

    #[test]
    fn test_fd_data_phase_at_data_rate() {
        let timing = BusTiming {
            nominal_bitrate: 500_000,
            data_bitrate: 2_000_000,
            fd: true,
            extended_ids: false,
        };
        let acc = BusLoadAccumulator::new(timing);
        acc.record_tx(0x100, 64, true);
        let report = acc.sample_and_reset(1000);
        let expected = (31.0 / 500_000.0 + 534.0 / 2_000_000.0) * 100.0;
        assert!((report.tx_percent - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reset_after_sample() {
        let acc = BusLoadAccumulator::new(BusTiming::default());
        acc.record_rx(0x1, 8, false);
        assert_eq!(acc.sample_and_reset(1000).rx_frames, 1);
        assert_eq!(acc.sample_and_reset(1000), BusLoadReport::default());
    }
}
