//! Signal definitions and bit-level layout
//!
//! A signal's bit field is compiled once into a list of per-byte steps so that
//! extraction and insertion are simple mask/shift loops over the payload.

use serde::{Deserialize, Serialize};

/// Bit numbering of a signal inside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Intel (`@1`): start bit is the LSB, bits grow towards higher bytes
    LittleEndian,
    /// Motorola (`@0`): start bit is the MSB, bits continue into the next byte
    BigEndian,
}

/// One contiguous run of bits inside a single payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BitStep {
    /// Payload byte index
    byte_index: usize,
    /// LSB of the run within the payload byte (0..7)
    src_lsb: u8,
    /// Number of bits in the run (1..8)
    width: u8,
    /// Position of the run's LSB within the raw value
    dst_lsb: u16,
}

impl BitStep {
    fn mask(&self) -> u8 {
        if self.width >= 8 {
            0xFF
        } else {
            ((1u16 << self.width) - 1) as u8
        }
    }
}

/// Definition of one signal of a DBC message
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDef {
    /// Signal name
    pub name: String,
    /// DBC start bit
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Bit numbering
    pub byte_order: ByteOrder,
    /// Two's complement raw value
    pub is_signed: bool,
    /// Scale applied to the raw value
    pub factor: f64,
    /// Offset applied after scaling
    pub offset: f64,
    /// Declared physical minimum (absent when the DBC leaves `[0|0]`)
    pub minimum: Option<f64>,
    /// Declared physical maximum
    pub maximum: Option<f64>,
    /// Engineering unit
    pub unit: String,
    steps: Vec<BitStep>,
}

impl SignalDef {
    /// Create a signal and compile its bit layout
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        start_bit: u16,
        length: u16,
        byte_order: ByteOrder,
        is_signed: bool,
        factor: f64,
        offset: f64,
        unit: impl Into<String>,
    ) -> Self {
        let mut signal = Self {
            name: name.into(),
            start_bit,
            length: length.clamp(1, 64),
            byte_order,
            is_signed,
            factor,
            offset,
            minimum: None,
            maximum: None,
            unit: unit.into(),
            steps: Vec::new(),
        };
        signal.compile();
        signal
    }

    /// Attach the declared physical range
    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    fn compile(&mut self) {
        self.steps.clear();
        match self.byte_order {
            ByteOrder::LittleEndian => self.compile_intel(),
            ByteOrder::BigEndian => self.compile_motorola(),
        }
    }

    fn compile_intel(&mut self) {
        let mut remaining = self.length;
        let mut bit = self.start_bit as usize;
        let mut dst = 0u16;

        while remaining > 0 {
            let bit_off = (bit % 8) as u8;
            let take = remaining.min((8 - bit_off) as u16) as u8;
            self.steps.push(BitStep {
                byte_index: bit / 8,
                src_lsb: bit_off,
                width: take,
                dst_lsb: dst,
            });
            bit += take as usize;
            dst += take as u16;
            remaining -= take as u16;
        }
    }

    fn compile_motorola(&mut self) {
        // Start bit addresses the MSB; walk MSB-first, wrapping to bit 7 of the next byte.
        let mut remaining = self.length;
        let mut byte = (self.start_bit / 8) as usize;
        let mut bit_msb = (self.start_bit % 8) as u8;

        while remaining > 0 {
            let take = (bit_msb as u16 + 1).min(remaining);
            let src_lsb = bit_msb + 1 - take as u8;
            remaining -= take;
            self.steps.push(BitStep {
                byte_index: byte,
                src_lsb,
                width: take as u8,
                dst_lsb: remaining,
            });
            if src_lsb == 0 {
                byte += 1;
                bit_msb = 7;
            } else {
                bit_msb = src_lsb - 1;
            }
        }
    }

    /// Number of payload bytes needed to hold this signal
    pub fn required_bytes(&self) -> usize {
        self.steps
            .iter()
            .map(|s| s.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Unsigned raw bits of the signal
    pub fn extract_raw(&self, bytes: &[u8]) -> u64 {
        let mut out = 0u64;
        for step in &self.steps {
            if let Some(&b) = bytes.get(step.byte_index) {
                let chunk = ((b >> step.src_lsb) & step.mask()) as u64;
                out |= chunk << step.dst_lsb;
            }
        }
        out
    }

    /// Raw value with sign extension applied for signed signals
    pub fn extract_raw_signed(&self, bytes: &[u8]) -> i64 {
        let raw = self.extract_raw(bytes);
        let n = self.length.min(64);
        if self.is_signed && n < 64 {
            let sign_bit = 1u64 << (n - 1);
            if raw & sign_bit != 0 {
                return (raw | !((1u64 << n) - 1)) as i64;
            }
        }
        raw as i64
    }

    /// Write raw bits into the payload, leaving other bits untouched
    pub fn insert_raw(&self, bytes: &mut [u8], raw: u64) {
        for step in &self.steps {
            if let Some(b) = bytes.get_mut(step.byte_index) {
                let mask = step.mask();
                let chunk = ((raw >> step.dst_lsb) as u8) & mask;
                *b = (*b & !(mask << step.src_lsb)) | (chunk << step.src_lsb);
            }
        }
    }

    /// Raw integer bounds representable by the bit field
    pub fn raw_bounds(&self) -> (f64, f64) {
        let bits = self.length as i32;
        if self.is_signed {
            let half = 2f64.powi(bits - 1);
            (-half, half - 1.0)
        } else {
            (0.0, 2f64.powi(bits) - 1.0)
        }
    }

    /// Raw bounds mapped through factor/offset
    pub fn physical_bounds(&self) -> (f64, f64) {
        let (raw_min, raw_max) = self.raw_bounds();
        (
            raw_min * self.factor + self.offset,
            raw_max * self.factor + self.offset,
        )
    }

    /// Physical value of the signal in `bytes`
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        self.extract_raw_signed(bytes) as f64 * self.factor + self.offset
    }

    /// Encode a physical value into `bytes`, saturating at the raw bounds
    pub fn encode(&self, bytes: &mut [u8], value: f64) {
        let factor = if self.factor == 0.0 { 1.0 } else { self.factor };
        let (raw_min, raw_max) = self.raw_bounds();
        let raw = ((value - self.offset) / factor).round();
        let raw = if raw.is_nan() {
            0.0
        } else {
            raw.clamp(raw_min, raw_max)
        };
        let bits = if self.is_signed {
            raw as i64 as u64
        } else {
            raw as u64
        };
        self.insert_raw(bytes, bits);
    }
}
