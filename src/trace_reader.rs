//! Readers for the two runtime output streams
//!
//! The stored-value stream is scanned sequentially, the same way an offline
//! checker replays it; the event stream is parsed line by line and can be
//! re-ordered by sequence number, since file order follows flush order and
//! not the logical clock.

use crate::runtime::config::MAX_VALUE_LEN;
use crate::runtime::sequence::{INVALID_SEQUENCE, OLD_VALUE_OFFSET};
use crate::runtime::sink::VALUE_HEADER_LEN;
use memmap2::Mmap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("truncated value record at offset {offset}: need {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: u64,
        available: usize,
    },

    #[error("value record at offset {offset} claims {len} bytes (max {max})")]
    Oversized { offset: usize, len: u64, max: u64 },

    #[error("line {line}: malformed event record: {reason}")]
    MalformedEvent { line: usize, reason: String },
}

/// Whether `seq` names a pre-image record
pub fn is_old_value(seq: u64) -> bool {
    (OLD_VALUE_OFFSET..INVALID_SEQUENCE).contains(&seq)
}

/// Sequence number of the event a value belongs to, with the pre-image
/// offset removed
pub fn base_sequence(seq: u64) -> u64 {
    if is_old_value(seq) {
        seq - OLD_VALUE_OFFSET
    } else {
        seq
    }
}

/// One stored-value record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRecord<'a> {
    pub seq: u64,
    /// Byte offset of the record header in the stream
    pub offset: usize,
    pub bytes: &'a [u8],
}

impl ValueRecord<'_> {
    pub fn is_old_value(&self) -> bool {
        is_old_value(self.seq)
    }
}

/// Sequential scan over `u64 seq | u64 len | bytes` records
///
/// Yields an error and stops at the first truncated or oversized record.
#[derive(Debug)]
pub struct ValueStream<'a> {
    data: &'a [u8],
    offset: usize,
    max_len: u64,
    failed: bool,
}

impl<'a> ValueStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_max_len(data, MAX_VALUE_LEN)
    }

    pub fn with_max_len(data: &'a [u8], max_len: u64) -> Self {
        Self {
            data,
            offset: 0,
            max_len,
            failed: false,
        }
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    fn next_record(&mut self) -> Result<ValueRecord<'a>, TraceReadError> {
        let offset = self.offset;
        let available = self.data.len() - offset;
        if (available as u64) < VALUE_HEADER_LEN {
            return Err(TraceReadError::Truncated {
                offset,
                needed: VALUE_HEADER_LEN,
                available,
            });
        }
        let seq = self.read_u64(offset);
        let len = self.read_u64(offset + 8);
        if len > self.max_len {
            return Err(TraceReadError::Oversized {
                offset,
                len,
                max: self.max_len,
            });
        }
        let body = offset + VALUE_HEADER_LEN as usize;
        let remaining = self.data.len() - body;
        if len > remaining as u64 {
            return Err(TraceReadError::Truncated {
                offset,
                needed: VALUE_HEADER_LEN + len,
                available,
            });
        }
        let end = body + len as usize;
        self.offset = end;
        Ok(ValueRecord {
            seq,
            offset,
            bytes: &self.data[body..end],
        })
    }
}

impl<'a> Iterator for ValueStream<'a> {
    type Item = Result<ValueRecord<'a>, TraceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let record = self.next_record();
        self.failed = record.is_err();
        Some(record)
    }
}

/// Owned copy of a [`ValueRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedValue {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Memory-map a stored-value file and read every record
pub fn read_value_file(path: impl AsRef<Path>) -> Result<Vec<OwnedValue>, TraceReadError> {
    let path = path.as_ref();
    let io_err = |source| TraceReadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    if file.metadata().map_err(io_err)?.len() == 0 {
        return Ok(Vec::new());
    }
    // SAFETY: the file is only read, and trace files are not modified while
    // a reader holds them
    let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
    ValueStream::new(&map)
        .map(|record| {
            record.map(|r| OwnedValue {
                seq: r.seq,
                bytes: r.bytes.to_vec(),
            })
        })
        .collect()
}

/// One parsed event-stream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub seq: u64,
    pub pid: i32,
    pub label: String,
    /// `None` only for lines cut before the id field
    pub id: Option<u32>,
    /// Everything after the label, as written
    pub fields: String,
    /// Source-location line that followed this event, if any
    pub location: Option<String>,
}

impl EventLine {
    /// Render back into event-stream form, location line included
    pub fn to_lines(&self) -> String {
        let mut out = format!(
            "{:>8}, {:>8}, {:<15}, {}\n",
            self.seq, self.pid, self.label, self.fields
        );
        if let Some(text) = &self.location {
            out.push_str(&format!("{:>8}, {:>8}, \t\t{}\n", self.seq, self.pid, text));
        }
        out
    }
}

/// A line of the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Event(EventLine),
    /// `\t\tfile: ...` continuation line
    Location { seq: u64, text: String },
}

fn malformed(line: usize, reason: impl Into<String>) -> TraceReadError {
    TraceReadError::MalformedEvent {
        line,
        reason: reason.into(),
    }
}

/// Parse one line; `line_no` is only used in errors
pub fn parse_event_line(line: &str, line_no: usize) -> Result<ParsedLine, TraceReadError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let mut parts = line.splitn(3, ", ");
    let seq = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| malformed(line_no, "missing sequence number"))?;
    let pid = parts
        .next()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| malformed(line_no, "missing process id"))?;
    let rest = parts
        .next()
        .ok_or_else(|| malformed(line_no, "missing event label"))?;

    if let Some(text) = rest.strip_prefix("\t\t") {
        return Ok(ParsedLine::Location {
            seq,
            text: text.to_string(),
        });
    }

    let (label, fields) = rest.split_once(", ").unwrap_or((rest, ""));
    let label = label.trim_end();
    if label.is_empty() {
        return Err(malformed(line_no, "empty event label"));
    }
    let id = fields
        .strip_prefix("id: ")
        .and_then(|s| s.split([',', '.']).next())
        .and_then(|s| s.trim().parse().ok());
    Ok(ParsedLine::Event(EventLine {
        seq,
        pid,
        label: label.to_string(),
        id,
        fields: fields.to_string(),
        location: None,
    }))
}

/// Parse an event stream, attaching location lines to their event
pub fn parse_events(text: &str) -> Result<Vec<EventLine>, TraceReadError> {
    let mut events: Vec<EventLine> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_event_line(line, idx + 1)? {
            ParsedLine::Event(event) => events.push(event),
            ParsedLine::Location { seq, text } => match events.last_mut() {
                Some(prev) if prev.seq == seq => prev.location = Some(text),
                _ => {
                    tracing::warn!(line = idx + 1, seq, "location line without its event");
                }
            },
        }
    }
    Ok(events)
}

pub fn read_event_file(path: impl AsRef<Path>) -> Result<Vec<EventLine>, TraceReadError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| TraceReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_events(&text)
}

/// Stable sort into logical-clock order
pub fn sort_by_sequence(events: &mut [EventLine]) {
    events.sort_by_key(|e| e.seq);
}

/// Half-open ranges `[start, end)` of sequence numbers missing between the
/// smallest and largest of `sequences`
///
/// Gaps are expected where an event was filtered or dropped; a gap no
/// event explains points at lost records.
pub fn find_gaps(sequences: impl IntoIterator<Item = u64>) -> Vec<(u64, u64)> {
    let mut seqs: Vec<u64> = sequences.into_iter().collect();
    seqs.sort_unstable();
    seqs.dedup();
    seqs.windows(2)
        .filter(|w| w[1] > w[0] + 1)
        .map(|w| (w[0] + 1, w[1]))
        .collect()
}
