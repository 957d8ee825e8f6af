//! Hex payload text
//!
//! The TX table shows payloads as space separated byte pairs (`01 A0 FF`).

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Malformed manual payload text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadFormatError {
    #[error("Payload must contain exactly {dlc} bytes in hexadecimal (00-FF), e.g. {example}")]
    WrongByteCount {
        dlc: u8,
        found: usize,
        example: String,
    },

    #[error("Invalid byte '{token}': payload must contain exactly {dlc} bytes in hexadecimal (00-FF), e.g. {example}")]
    InvalidByte {
        dlc: u8,
        token: String,
        example: String,
    },
}

fn hex_pair() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9a-fA-F]{2}$").ok())
        .as_ref()
}

fn example(dlc: u8) -> String {
    vec!["00"; dlc as usize].join(" ")
}

/// Strictly parse `dlc` whitespace separated hex pairs
pub fn parse_hex_payload(text: &str, dlc: u8) -> Result<Vec<u8>, PayloadFormatError> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != dlc as usize {
        return Err(PayloadFormatError::WrongByteCount {
            dlc,
            found: parts.len(),
            example: example(dlc),
        });
    }

    parts
        .iter()
        .map(|token| {
            let valid = match hex_pair() {
                Some(re) => re.is_match(token),
                None => token.len() == 2,
            };
            valid
                .then(|| u8::from_str_radix(token, 16).ok())
                .flatten()
                .ok_or_else(|| PayloadFormatError::InvalidByte {
                    dlc,
                    token: token.to_string(),
                    example: example(dlc),
                })
        })
        .collect()
}

/// Render bytes as upper-case hex pairs separated by spaces
pub fn format_hex_payload(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
