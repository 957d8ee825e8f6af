//! SLCAN (Lawicel ASCII) transport over a serial port
//!
//! Works with the common USB-CAN adapters that expose a CDC-ACM serial
//! device (CANable, CANtact and clones). Commands and frames are ASCII lines
//! terminated by `\r`:
//!
//! - `S0`..`S8` nominal bitrate, `Y<n>` CAN-FD data bitrate in Mbit/s
//! - `O` open, `C` close
//! - `t`/`T` classic frames, `d`/`D` FD frames, `b`/`B` FD frames with bitrate switch
//!
//! Lower-case letters carry an 11-bit id (3 hex digits), upper-case a 29-bit
//! id (8 hex digits).

use serialport::{SerialPort, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    deliver, CanTransport, ChannelInfo, ReceiveCallback, ReceivedFrame, SharedCallback,
    TransportError, TransportKind,
};
use crate::busload::BusTiming;
use crate::frame::{MAX_EXTENDED_ID, MAX_STANDARD_ID};

/// Serial speed; ignored by CDC-ACM adapters but required by the port API
const SERIAL_BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const NOMINAL_BITRATES: [(u32, u8); 9] = [
    (10_000, 0),
    (20_000, 1),
    (50_000, 2),
    (100_000, 3),
    (125_000, 4),
    (250_000, 5),
    (500_000, 6),
    (800_000, 7),
    (1_000_000, 8),
];

const DATA_BITRATES: [u32; 5] = [1_000_000, 2_000_000, 4_000_000, 5_000_000, 8_000_000];

/// Valid CAN-FD payload sizes indexed by DLC code
const FD_LENGTHS: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

fn nominal_command(bitrate: u32) -> Result<String, TransportError> {
    NOMINAL_BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, code)| format!("S{}", code))
        .ok_or(TransportError::UnsupportedBitrate(bitrate))
}

fn data_command(bitrate: u32) -> Result<String, TransportError> {
    if DATA_BITRATES.contains(&bitrate) {
        Ok(format!("Y{}", bitrate / 1_000_000))
    } else {
        Err(TransportError::UnsupportedBitrate(bitrate))
    }
}

/// DLC code of the smallest FD frame holding `len` bytes
fn fd_dlc_code(len: usize) -> Option<usize> {
    FD_LENGTHS.iter().position(|&l| l as usize >= len)
}

/// Encode one frame as an SLCAN line (including the trailing `\r`).
///
/// FD payloads are padded with zeros up to the next valid FD length.
pub fn encode_frame(
    id: u32,
    data: &[u8],
    is_fd: bool,
    bitrate_switch: bool,
) -> Result<String, TransportError> {
    let extended = id > MAX_STANDARD_ID;
    if id > MAX_EXTENDED_ID {
        return Err(TransportError::InvalidFrame(format!("id {:#X} out of range", id)));
    }

    let (command, code, wire_len) = if is_fd {
        let code = fd_dlc_code(data.len()).ok_or_else(|| {
            TransportError::InvalidFrame(format!("{} bytes exceed CAN-FD payload", data.len()))
        })?;
        let command = match (extended, bitrate_switch) {
            (false, false) => 'd',
            (true, false) => 'D',
            (false, true) => 'b',
            (true, true) => 'B',
        };
        (command, code, FD_LENGTHS[code] as usize)
    } else {
        if data.len() > 8 {
            return Err(TransportError::InvalidFrame(format!(
                "{} bytes exceed classic CAN payload",
                data.len()
            )));
        }
        (if extended { 'T' } else { 't' }, data.len(), data.len())
    };

    let mut line = String::with_capacity(10 + wire_len * 2);
    line.push(command);
    if extended {
        line.push_str(&format!("{:08X}", id));
    } else {
        line.push_str(&format!("{:03X}", id));
    }
    line.push_str(&format!("{:X}", code));
    for i in 0..wire_len {
        line.push_str(&format!("{:02X}", data.get(i).copied().unwrap_or(0)));
    }
    line.push('\r');
    Ok(line)
}

/// Parse a received SLCAN frame line (without the `\r`).
///
/// Returns `None` for anything that is not a data frame (acks, status, remote
/// frames, garbage).
pub fn parse_frame_line(line: &str) -> Option<ReceivedFrame> {
    let line = line.trim();
    if !line.is_ascii() {
        return None;
    }
    let command = line.chars().next()?;
    let (extended, is_fd) = match command {
        't' => (false, false),
        'T' => (true, false),
        'd' | 'b' => (false, true),
        'D' | 'B' => (true, true),
        _ => return None,
    };

    let id_len = if extended { 8 } else { 3 };
    let rest = line.get(1..)?;
    let id = u32::from_str_radix(rest.get(..id_len)?, 16).ok()?;
    let code = usize::from_str_radix(rest.get(id_len..id_len + 1)?, 16).ok()?;
    let len = if is_fd {
        *FD_LENGTHS.get(code)? as usize
    } else if code <= 8 {
        code
    } else {
        return None;
    };

    let hex = rest.get(id_len + 1..id_len + 1 + len * 2)?;
    let data = (0..len)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;

    Some(ReceivedFrame::new(id, data, is_fd))
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

fn describe_port(name: &str, port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.clone().unwrap_or_else(|| "USB serial".into());
            format!("{} ({}, {:04x}:{:04x})", name, product, usb.vid, usb.pid)
        }
        _ => name.to_string(),
    }
}

/// Serial ports usable as SLCAN channels, ttyACM first
pub(super) fn enumerate_channels() -> Vec<ChannelInfo> {
    let mut map: HashMap<String, String> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let display = describe_port(&info.port_name, &info.port_type);
        map.entry(info.port_name).or_insert(display);
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert(full);
                }
            }
        }
    }

    let mut names: Vec<(String, String)> = map.into_iter().collect();
    names.sort_by_key(|(name, _)| port_sort_key(name));
    names
        .into_iter()
        .map(|(channel, display)| ChannelInfo {
            display_name: format!("SLCAN {}", display),
            channel,
            kind: TransportKind::Slcan,
        })
        .collect()
}

fn open_port(name: &str) -> Result<Box<dyn SerialPort>, TransportError> {
    serialport::new(name, SERIAL_BAUD_RATE)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| TransportError::SerialError(format!("{}: {}", name, e)))
}

/// Longest line an adapter sends: `D`, 8 id digits, DLC, 64 data bytes,
/// plus room for an optional timestamp
const MAX_LINE_LEN: usize = 1 + 8 + 1 + 128 + 8;

/// Reassembles `\r`-terminated lines from raw serial bytes
#[derive(Debug, Default)]
struct LineAssembler {
    line: String,
    overflowed: bool,
}

impl LineAssembler {
    /// Feed one byte; returns a complete line at a terminator.
    ///
    /// A line longer than [`MAX_LINE_LEN`] is dropped up to the next
    /// terminator.
    fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\r' | b'\n' => {
                let overflowed = std::mem::take(&mut self.overflowed);
                let line = std::mem::take(&mut self.line);
                (!overflowed && !line.is_empty()).then_some(line)
            }
            // Adapter error reply
            0x07 => {
                tracing::warn!("SLCAN adapter reported an error");
                self.line.clear();
                None
            }
            _ if self.overflowed => None,
            b => {
                if self.line.len() >= MAX_LINE_LEN {
                    tracing::warn!(limit = MAX_LINE_LEN, "SLCAN line too long, discarded");
                    self.line.clear();
                    self.overflowed = true;
                } else {
                    self.line.push(b as char);
                }
                None
            }
        }
    }
}

fn reader_loop(mut port: Box<dyn SerialPort>, running: Arc<AtomicBool>, callback: SharedCallback) {
    let mut buf = [0u8; 512];
    let mut lines = LineAssembler::default();

    while running.load(Ordering::SeqCst) {
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "SLCAN read failed, receive loop stopped");
                break;
            }
        };
        for &byte in &buf[..n] {
            let Some(line) = lines.push(byte) else {
                continue;
            };
            match parse_frame_line(&line) {
                Some(frame) => deliver(&callback, frame),
                None => tracing::trace!(line = %line, "SLCAN line ignored"),
            }
        }
    }
}

/// SLCAN adapter on a serial port
pub struct SlcanTransport {
    port: Option<Box<dyn SerialPort>>,
    callback: SharedCallback,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    bitrate_switch: bool,
}

impl Default for SlcanTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SlcanTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
            bitrate_switch: false,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(line.as_bytes())?;
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<(), TransportError> {
        tracing::debug!(command = cmd, "SLCAN command");
        self.write_line(&format!("{}\r", cmd))
    }

    fn configure(&mut self, nominal: &str, data: Option<&str>) -> Result<(), TransportError> {
        // Channel may still be open from a previous session
        self.command("C")?;
        self.command(nominal)?;
        if let Some(data) = data {
            self.command(data)?;
        }
        self.command("O")
    }
}

impl CanTransport for SlcanTransport {
    fn open(&mut self, channel: &str, timing: &BusTiming) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let nominal = nominal_command(timing.nominal_bitrate)?;
        let data = if timing.fd {
            Some(data_command(timing.data_bitrate)?)
        } else {
            None
        };

        self.port = Some(open_port(channel)?);
        if let Err(e) = self.configure(&nominal, data.as_deref()) {
            self.port = None;
            return Err(e);
        }
        self.bitrate_switch = timing.fd;

        let reader_port = match self.port.as_ref().map(|p| p.try_clone()) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                self.port = None;
                return Err(e.into());
            }
            None => return Err(TransportError::NotOpen),
        };
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let callback = self.callback.clone();
        let spawned = thread::Builder::new()
            .name("slcan-rx".into())
            .spawn(move || reader_loop(reader_port, running, callback));
        match spawned {
            Ok(handle) => self.reader = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.port = None;
                return Err(e.into());
            }
        }

        tracing::info!(
            channel,
            nominal_bitrate = timing.nominal_bitrate,
            fd = timing.fd,
            "SLCAN channel opened"
        );
        Ok(())
    }

    fn send(&mut self, id: u32, data: &[u8], dlc: u8, is_fd: bool) -> Result<(), TransportError> {
        let payload = data.get(..dlc as usize).unwrap_or(data);
        let line = encode_frame(id, payload, is_fd, is_fd && self.bitrate_switch)?;
        self.write_line(&line)
    }

    fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.is_none() {
            return Ok(());
        }
        let result = self.command("C");
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!("SLCAN reader thread panicked");
            }
        }
        self.port = None;
        tracing::info!("SLCAN channel closed");
        result
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SlcanTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_classic() {
        assert_eq!(
            encode_frame(0x123, &[0xDE, 0xAD], false, false).unwrap(),
            "t1232DEAD\r"
        );
        assert_eq!(
            encode_frame(0x18DAF110, &[1], false, false).unwrap(),
            "T18DAF110101\r"
        );
    }

    #[test]
    fn test_encode_fd_pads_to_valid_length() {
        let line = encode_frame(0x100, &[0xAA; 10], true, true).unwrap();
        assert!(line.starts_with("b1009"));
        assert_eq!(line.len(), 5 + 24 + 1);
        assert!(line.ends_with("AAAA0000\r"));
    }

    #[test]
    fn test_classic_too_long() {
        assert!(encode_frame(0x1, &[0; 9], false, false).is_err());
    }

    #[test]
    fn test_parse_lines() {
        let f = parse_frame_line("t1232DEAD").unwrap();
        assert_eq!((f.id, f.data.clone(), f.is_fd), (0x123, vec![0xDE, 0xAD], false));

        let f = parse_frame_line("B18DAF110A").map(|f| f.dlc);
        assert_eq!(f, None, "truncated FD frame");

        let f = parse_frame_line(&format!("d7FFA{}", "01".repeat(16))).unwrap();
        assert_eq!((f.id, f.dlc, f.is_fd), (0x7FF, 16, true));

        assert!(parse_frame_line("z").is_none());
        assert!(parse_frame_line("r1230").is_none());
        assert!(parse_frame_line("t12390000").is_none());
    }

    #[test]
    fn test_bitrate_commands() {
        assert_eq!(nominal_command(500_000).unwrap(), "S6");
        assert_eq!(nominal_command(1_000_000).unwrap(), "S8");
        assert!(nominal_command(333_333).is_err());
        assert_eq!(data_command(2_000_000).unwrap(), "Y2");
        assert!(data_command(3_000_000).is_err());
    }

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));
        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_line_assembler_caps_runaway_input() {
        let mut lines = LineAssembler::default();
        for _ in 0..10_000 {
            assert_eq!(lines.push(b'A'), None);
            assert!(lines.line.len() <= MAX_LINE_LEN);
        }
        // The overlong line is dropped at its terminator
        assert_eq!(lines.push(b'\r'), None);

        let mut out = Vec::new();
        for &b in b"t1232DEAD\r\r" {
            out.extend(lines.push(b));
        }
        assert_eq!(out, vec!["t1232DEAD".to_string()]);
    }

    #[test]
    fn test_line_assembler_fits_largest_fd_frame() {
        let mut lines = LineAssembler::default();
        let text = format!("B18DAF110F{}", "AB".repeat(64));
        let mut out = None;
        for b in text.bytes().chain([b'\r']) {
            out = out.or(lines.push(b));
        }
        let frame = out.as_deref().and_then(parse_frame_line).unwrap();
        assert_eq!((frame.id, frame.dlc), (0x18DAF110, 64));
    }
}
