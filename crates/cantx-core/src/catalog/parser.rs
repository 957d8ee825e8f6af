//! DBC text parser
//!
//! Line-oriented: only `BO_`, `SG_` and the `GenMsgCycleTime` / `VFrameFormat`
//! message attributes are interpreted, everything else is skipped.

use regex::Regex;
use std::collections::HashMap;

use super::{ByteOrder, CatalogError, MessageDef, SignalDef};

/// DBC encodes extended identifiers with bit 31 set
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Pseudo message some tools emit to host unassigned signals
const INDEPENDENT_SIGNALS_MSG: &str = "VECTOR__INDEPENDENT_SIG_MSG";

/// `VFrameFormat` values that denote CAN-FD frames
const FD_FRAME_FORMATS: [u32; 2] = [14, 15];

struct DbcPatterns {
    message: Regex,
    signal: Regex,
    cycle_time: Regex,
    frame_format: Regex,
}

impl DbcPatterns {
    fn new() -> Result<Self, CatalogError> {
        let compile =
            |p: &str| Regex::new(p).map_err(|e| CatalogError::PatternError(e.to_string()));
        Ok(Self {
            message: compile(r"^BO_\s+(\d+)\s+(\w+)\s*:\s*(\d+)\s+(\S+)")?,
            signal: compile(
                r#"^SG_\s+(\w+)\s*(?:[Mm]\d*\s*)?:\s*(\d+)\|(\d+)@([01])([+-])\s*\(\s*([^,\s]+)\s*,\s*([^)\s]+)\s*\)\s*\[\s*([^|\s]*)\s*\|\s*([^\]\s]*)\s*\]\s*"([^"]*)""#,
            )?,
            cycle_time: compile(r#"^BA_\s+"GenMsgCycleTime"\s+BO_\s+(\d+)\s+(\d+)\s*;"#)?,
            frame_format: compile(r#"^BA_\s+"VFrameFormat"\s+BO_\s+(\d+)\s+(\d+)\s*;"#)?,
        })
    }
}

fn syntax(line: usize, message: impl Into<String>) -> CatalogError {
    CatalogError::SyntaxError {
        line,
        message: message.into(),
    }
}

fn parse_num<T: std::str::FromStr>(text: &str, line: usize, what: &str) -> Result<T, CatalogError> {
    text.trim()
        .parse::<T>()
        .map_err(|_| syntax(line, format!("invalid {what} '{text}'")))
}

fn split_raw_id(raw: u32) -> (u32, bool) {
    if raw & EXTENDED_ID_FLAG != 0 {
        (raw & 0x1FFF_FFFF, true)
    } else {
        (raw, false)
    }
}

/// Parse DBC content into message definitions (file order preserved)
pub(super) fn parse_dbc(content: &str) -> Result<Vec<MessageDef>, CatalogError> {
    let patterns = DbcPatterns::new()?;
    let mut messages: Vec<MessageDef> = Vec::new();
    let mut index: HashMap<u32, usize> = HashMap::new();
    // Index of the message the following SG_ lines belong to; None inside skipped blocks
    let mut current: Option<usize> = None;
    let mut in_skipped_block = false;

    for (n, raw_line) in content.lines().enumerate() {
        let line_no = n + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        if line.starts_with("BO_ ") {
            let caps = patterns
                .message
                .captures(line)
                .ok_or_else(|| syntax(line_no, "malformed BO_ definition"))?;
            let raw_id: u32 = parse_num(&caps[1], line_no, "message id")?;
            let name = caps[2].to_string();
            let length: u8 = parse_num(&caps[3], line_no, "message length")?;

            if name == INDEPENDENT_SIGNALS_MSG {
                current = None;
                in_skipped_block = true;
                continue;
            }
            if length == 0 || length > 64 {
                return Err(syntax(line_no, format!("message length {length} out of range")));
            }

            let (frame_id, is_extended) = split_raw_id(raw_id);
            if index.contains_key(&frame_id) {
                return Err(CatalogError::DuplicateMessage(frame_id));
            }

            index.insert(frame_id, messages.len());
            current = Some(messages.len());
            in_skipped_block = false;
            messages.push(MessageDef {
                frame_id,
                is_extended,
                name,
                cycle_time: None,
                payload_length: length,
                is_fd: length > 8,
                sender: caps[4].to_string(),
                signals: Vec::new(),
            });
        } else if line.starts_with("SG_ ") {
            let caps = patterns
                .signal
                .captures(line)
                .ok_or_else(|| syntax(line_no, "malformed SG_ definition"))?;

            let Some(msg_idx) = current else {
                if in_skipped_block {
                    continue;
                }
                return Err(CatalogError::OrphanSignal {
                    line: line_no,
                    signal: caps[1].to_string(),
                });
            };

            let byte_order = if &caps[4] == "1" {
                ByteOrder::LittleEndian
            } else {
                ByteOrder::BigEndian
            };
            let length: u16 = parse_num(&caps[3], line_no, "signal length")?;
            if length == 0 || length > 64 {
                return Err(syntax(line_no, format!("signal length {length} out of range")));
            }
            let minimum: f64 = parse_num(&caps[8], line_no, "minimum").unwrap_or(0.0);
            let maximum: f64 = parse_num(&caps[9], line_no, "maximum").unwrap_or(0.0);
            let (minimum, maximum) = if minimum == 0.0 && maximum == 0.0 {
                (None, None)
            } else {
                (Some(minimum), Some(maximum))
            };

            let signal = SignalDef::new(
                &caps[1],
                parse_num(&caps[2], line_no, "start bit")?,
                length,
                byte_order,
                &caps[5] == "-",
                parse_num(&caps[6], line_no, "factor")?,
                parse_num(&caps[7], line_no, "offset")?,
                &caps[10],
            )
            .with_range(minimum, maximum);

            messages[msg_idx].signals.push(signal);
        } else if let Some(caps) = patterns.cycle_time.captures(line) {
            let (frame_id, _) = split_raw_id(parse_num(&caps[1], line_no, "message id")?);
            if let Some(&i) = index.get(&frame_id) {
                messages[i].cycle_time = Some(parse_num(&caps[2], line_no, "cycle time")?);
            }
        } else if let Some(caps) = patterns.frame_format.captures(line) {
            let (frame_id, _) = split_raw_id(parse_num(&caps[1], line_no, "message id")?);
            let format: u32 = parse_num(&caps[2], line_no, "frame format")?;
            if let Some(&i) = index.get(&frame_id) {
                messages[i].is_fd = messages[i].is_fd || FD_FRAME_FORMATS.contains(&format);
            }
        } else {
            // Any other keyword closes the current message block
            current = None;
            in_skipped_block = false;
        }
    }

    if messages.is_empty() {
        return Err(CatalogError::Empty);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_id_flag_stripped() {
        let dbc = "BO_ 2364539904 Ext: 8 ECU\n SG_ A : 0|8@1+ (1,0) [0|0] \"\" Vector__XXX\n";
        let messages = parse_dbc(dbc).unwrap();
        assert_eq!(messages[0].frame_id, 0x0CF00400);
        assert!(messages[0].is_extended);
        assert_eq!(messages[0].signals[0].minimum, None);
    }

    #[test]
    fn test_multiplexed_signal_accepted() {
        let dbc = "BO_ 100 Mux: 8 ECU\n SG_ Sel M : 0|8@1+ (1,0) [0|255] \"\" X\n SG_ Val m1 : 8|8@1+ (1,0) [0|255] \"\" X\n";
        let messages = parse_dbc(dbc).unwrap();
        assert_eq!(messages[0].signals.len(), 2);
    }

    #[test]
    fn test_orphan_signal_rejected() {
        let dbc = "BU_: A\n SG_ Lost : 0|8@1+ (1,0) [0|255] \"\" X\n";
        assert!(matches!(
            parse_dbc(dbc),
            Err(CatalogError::OrphanSignal { line: 2, .. })
        ));
    }

    #[test]
    fn test_independent_block_skipped() {
        let dbc = "BO_ 3221225472 VECTOR__INDEPENDENT_SIG_MSG: 0 Vector__XXX\n SG_ Free : 0|8@1+ (1,0) [0|0] \"\" X\n\nBO_ 1 Real: 1 ECU\n";
        let messages = parse_dbc(dbc).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name, "Real");
    }
}
