//! CSV payload replay
//!
//! Each non-empty row after the header is one payload; cells are bytes in
//! decimal or `0x` hex. Rows are replayed cyclically and truncated to the DLC.
//!
//! A directory source holds one file per frame, named
//! `payload_sequence_ID_<HEX>.csv`. Sequences are loaded on first use and kept
//! in an LRU so a large capture directory does not stay resident.

use std::path::{Path, PathBuf};

use super::lru::LruCache;
use super::{PayloadPlugin, PluginError};

/// Per-ID sequences kept resident in a directory source
pub const DEFAULT_SEQUENCE_CAPACITY: usize = 16;

/// File name of the sequence for `frame_id` inside a directory source
pub fn sequence_file_name(frame_id: u32) -> String {
    format!("payload_sequence_ID_{:X}.csv", frame_id)
}

#[derive(Debug, Clone)]
struct Sequence {
    rows: Vec<Vec<u8>>,
    cursor: usize,
}

impl Sequence {
    fn load(path: &Path) -> Result<Self, PluginError> {
        let display = path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| PluginError::LoadFailed {
                path: display.clone(),
                message: e.to_string(),
            })?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| PluginError::Csv {
                path: display.clone(),
                line: e.position().map(|p| p.line()).unwrap_or(0),
                message: e.to_string(),
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let row = record
                .iter()
                .filter(|cell| !cell.is_empty())
                .map(|cell| {
                    parse_byte(cell).ok_or_else(|| PluginError::Csv {
                        path: display.clone(),
                        line,
                        message: format!("'{cell}' is not a byte"),
                    })
                })
                .collect::<Result<Vec<u8>, _>>()?;
            if !row.is_empty() {
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Err(PluginError::EmptySequence(display));
        }
        tracing::debug!(path = %path.display(), rows = rows.len(), "Payload sequence loaded");
        Ok(Self { rows, cursor: 0 })
    }

    fn next(&mut self, dlc: u8) -> Vec<u8> {
        let row = &self.rows[self.cursor % self.rows.len()];
        self.cursor = (self.cursor + 1) % self.rows.len();
        row.iter().copied().take(dlc as usize).collect()
    }
}

fn parse_byte(cell: &str) -> Option<u8> {
    match cell.strip_prefix("0x").or_else(|| cell.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => cell.parse::<u8>().ok(),
    }
}

#[derive(Debug)]
enum Source {
    Single(Sequence),
    PerId {
        dir: PathBuf,
        cache: LruCache<u32, Sequence>,
    },
}

/// Replays recorded payload sequences
#[derive(Debug)]
pub struct CsvReplay {
    source: Source,
}

impl CsvReplay {
    /// One sequence used for every frame
    pub fn from_file(path: &Path) -> Result<Self, PluginError> {
        Ok(Self {
            source: Source::Single(Sequence::load(path)?),
        })
    }

    /// Per-ID sequences looked up in `dir`, at most `capacity` kept loaded
    pub fn from_directory(dir: &Path, capacity: usize) -> Result<Self, PluginError> {
        if !dir.is_dir() {
            return Err(PluginError::LoadFailed {
                path: dir.display().to_string(),
                message: "not a directory".into(),
            });
        }
        Ok(Self {
            source: Source::PerId {
                dir: dir.to_path_buf(),
                cache: LruCache::new(capacity),
            },
        })
    }

    /// Frame ids currently resident, most recent first
    pub fn resident_ids(&self) -> Vec<u32> {
        match &self.source {
            Source::Single(_) => Vec::new(),
            Source::PerId { cache, .. } => cache.keys(),
        }
    }
}

impl PayloadPlugin for CsvReplay {
    fn generate(&mut self, dlc: u8, frame_id: Option<u32>) -> Result<Vec<u8>, PluginError> {
        match &mut self.source {
            Source::Single(seq) => Ok(seq.next(dlc)),
            Source::PerId { dir, cache } => {
                let id = frame_id.ok_or_else(|| PluginError::NoSequence("<none>".into()))?;
                if !cache.contains(&id) {
                    let path = dir.join(sequence_file_name(id));
                    if !path.is_file() {
                        return Err(PluginError::NoSequence(format!("{:#05X}", id)));
                    }
                    let seq = Sequence::load(&path)?;
                    if let Some((evicted, _)) = cache.insert(id, seq) {
                        tracing::debug!(frame_id = %crate::fmt_id(evicted), "Payload sequence evicted");
                    }
                }
                cache
                    .get_mut(&id)
                    .map(|seq| seq.next(dlc))
                    .ok_or_else(|| PluginError::NoSequence(format!("{:#05X}", id)))
            }
        }
    }
}
