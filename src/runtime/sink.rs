//! Output files written at reserved offsets
//!
//! A writer first reserves its byte range under the file's own offset lock,
//! then writes outside of it. Records never interleave even when several
//! flushes overlap, and the offset lock never nests inside the sequencer.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// `u64 seq | u64 len` prefix of a stored-value record
pub const VALUE_HEADER_LEN: u64 = 16;

/// Little-endian record header
pub fn encode_value_header(seq: u64, len: u64) -> [u8; VALUE_HEADER_LEN as usize] {
    let mut header = [0u8; VALUE_HEADER_LEN as usize];
    header[..8].copy_from_slice(&seq.to_le_bytes());
    header[8..].copy_from_slice(&len.to_le_bytes());
    header
}

#[derive(Debug)]
pub struct OffsetFile {
    file: File,
    path: PathBuf,
    offset: Mutex<u64>,
}

impl OffsetFile {
    /// Create or truncate `path` for writing
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset: Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim `len` bytes at the end of the file, returning their start
    pub fn reserve(&self, len: u64) -> io::Result<u64> {
        let mut offset = self
            .offset
            .lock()
            .map_err(|_| io::Error::other("offset lock poisoned"))?;
        let start = *offset;
        *offset += len;
        Ok(start)
    }

    /// Bytes reserved so far
    pub fn len(&self) -> u64 {
        self.offset.lock().map(|offset| *offset).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one event line
    pub fn write_record(&self, data: &[u8]) -> io::Result<()> {
        let start = self.reserve(data.len() as u64)?;
        self.file.write_all_at(data, start)
    }

    /// Append one stored-value record
    pub fn write_value(&self, seq: u64, bytes: &[u8]) -> io::Result<()> {
        let len = bytes.len() as u64;
        let start = self.reserve(VALUE_HEADER_LEN + len)?;
        self.file
            .write_all_at(&encode_value_header(seq, len), start)?;
        self.file.write_all_at(bytes, start + VALUE_HEADER_LEN)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// The event stream and the stored-value stream
#[derive(Debug)]
pub struct Sinks {
    pub events: OffsetFile,
    pub values: OffsetFile,
}

impl Sinks {
    pub fn open(event_path: &Path, value_path: &Path) -> io::Result<Self> {
        Ok(Self {
            events: OffsetFile::create(event_path)?,
            values: OffsetFile::create(value_path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_value_record_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("values");
        let sink = OffsetFile::create(&path).unwrap();
        sink.write_value(3, b"abc").unwrap();
        sink.write_value(4, b"").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16 + 3 + 16);
        assert_eq!(&bytes[..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..19], b"abc");
        assert_eq!(&bytes[19..27], &4u64.to_le_bytes());
        assert_eq!(sink.len(), 35);
    }

    #[test]
    fn test_create_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events");
        std::fs::write(&path, "stale content\n").unwrap();
        let sink = OffsetFile::create(&path).unwrap();
        sink.write_record(b"new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn test_concurrent_writers_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events");
        let sink = Arc::new(OffsetFile::create(&path).unwrap());
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let line = [b'a' + t, b'a' + t, b'a' + t, b'\n'];
                    for _ in 0..250 {
                        sink.write_record(&line).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1000);
        assert!(text
            .lines()
            .all(|l| l.len() == 3 && l.chars().all(|c| c == l.as_bytes()[0] as char)));
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope").join("events");
        assert!(Sinks::open(&missing, &dir.path().join("values")).is_err());
    }
}
