//! Append-only object log.
//!
//! Frame layout (little endian):
//! magic(4) + format(1) + flags(1) + version(8) + body_len(4) + body + crc32(4).
//! The body is a MessagePack-encoded [`LogOp`]; the checksum covers the body.

use crate::error::{BrokerError, Result};
use crate::types::{TaggedObject, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for log frames.
const LOG_MAGIC: &[u8; 4] = b"TCL\0";

/// Current frame format version.
const LOG_FORMAT: u8 = 1;

/// Fixed part of a frame before the body.
const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 4;

/// Trailing checksum size.
const FRAME_TRAILER_SIZE: usize = 4;

/// One logged mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Put {
        owner: String,
        key: String,
        tags: Vec<String>,
        recipients: Option<Vec<String>>,
        /// JSON-encoded payload fields.
        payload: Vec<u8>,
    },
    Delete {
        owner: String,
        key: String,
    },
}

impl LogOp {
    pub fn put(object: &TaggedObject) -> Result<Self> {
        Ok(LogOp::Put {
            owner: object.owner.clone(),
            key: object.key.clone(),
            tags: object.tags.iter().cloned().collect(),
            recipients: object.recipients.clone(),
            payload: serde_json::to_vec(&object.payload)?,
        })
    }

    pub fn delete(owner: &str, key: &str) -> Self {
        LogOp::Delete {
            owner: owner.to_string(),
            key: key.to_string(),
        }
    }
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub version: Version,
    pub op: LogOp,
}

impl LogEntry {
    /// Rebuild the stored object of a `Put` entry.
    pub fn to_object(&self) -> Result<Option<TaggedObject>> {
        match &self.op {
            LogOp::Put {
                owner,
                key,
                tags,
                recipients,
                payload,
            } => Ok(Some(TaggedObject {
                key: key.clone(),
                owner: owner.clone(),
                tags: tags.iter().cloned().collect(),
                recipients: recipients.clone(),
                version: self.version,
                payload: serde_json::from_slice(payload)
                    .map_err(|e| BrokerError::Deserialization(e.to_string()))?,
            })),
            LogOp::Delete { .. } => Ok(None),
        }
    }
}

enum FrameRead {
    Frame(LogEntry, u64),
    End,
    /// The file ends partway through a frame.
    Torn,
}

struct LogWriter {
    file: File,
    size: u64,
    writes_since_sync: u64,
    /// Bytes past `size` may hold a partial frame that still has to be cut.
    dirty_tail: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl LogWriter {
    fn write_frame(&mut self, offset: u64, frame: &[u8], sync: bool) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(frame)?;
        if sync {
            if self.take_injected_failure() {
                return Err(std::io::Error::new(ErrorKind::Other, "injected sync failure"));
            }
            self.file.sync_all()?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn take_injected_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_sync)
    }

    #[cfg(not(test))]
    fn take_injected_failure(&mut self) -> bool {
        false
    }

    /// Cut the file back to `size`, dropping anything a failed append left.
    fn truncate_tail(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.size)?;
        self.dirty_tail = false;
        Ok(())
    }
}

/// Append-only log of object writes and deletes.
pub struct ObjectLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    /// Sync every N frames (1 = every frame).
    sync_interval: u64,
}

impl ObjectLog {
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log.
    ///
    /// A torn frame at the tail (crash mid-append) is cut off.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let valid_size = Self::scan_valid_prefix(&path)?;
        if valid_size < file_size {
            tracing::warn!(
                path = %path.display(),
                file_size,
                valid_size,
                "truncating torn frame at end of object log"
            );
            file.set_len(valid_size)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                size: valid_size,
                writes_since_sync: 0,
                dirty_tail: false,
                #[cfg(test)]
                fail_next_sync: false,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a frame. Returns the offset it was written at.
    ///
    /// On failure the file is cut back to where the frame started.
    pub fn append(&self, version: Version, op: &LogOp) -> Result<u64> {
        let body = rmp_serde::to_vec(op)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
        frame.extend_from_slice(LOG_MAGIC);
        frame.push(LOG_FORMAT);
        frame.push(0u8);
        frame.extend_from_slice(&version.0.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

        let mut writer = self.writer.lock();
        if writer.dirty_tail {
            writer.truncate_tail()?;
        }

        let offset = writer.size;
        let sync = writer.writes_since_sync + 1 >= self.sync_interval;
        if let Err(e) = writer.write_frame(offset, &frame, sync) {
            if let Err(cut) = writer.truncate_tail() {
                writer.dirty_tail = true;
                tracing::error!(
                    path = %self.path.display(),
                    offset,
                    error = %cut,
                    "failed to cut back object log after failed append"
                );
            }
            return Err(e.into());
        }

        writer.size = offset + frame.len() as u64;
        writer.writes_since_sync = if sync { 0 } else { writer.writes_since_sync + 1 };

        Ok(offset)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.writer.lock().fail_next_sync = true;
    }

    /// Force sync all pending frames to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.sync_all()?;
        writer.writes_since_sync = 0;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    /// Read every frame from the start of the log.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let end = self.size();
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut offset = 0u64;
        let mut entries = Vec::new();

        while offset < end {
            match read_frame(&mut reader)? {
                FrameRead::Frame(entry, len) => {
                    offset += len;
                    entries.push(entry);
                }
                FrameRead::End | FrameRead::Torn => break,
            }
        }

        Ok(entries)
    }

    /// Length of the prefix made of complete frames.
    fn scan_valid_prefix(path: &Path) -> Result<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut valid = 0u64;

        loop {
            match read_frame(&mut reader)? {
                FrameRead::Frame(_, len) => valid += len,
                FrameRead::End | FrameRead::Torn => return Ok(valid),
            }
        }
    }
}

/// Read up to `buf.len()` bytes, returning how many arrived before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        n if n < FRAME_HEADER_SIZE => return Ok(FrameRead::Torn),
        _ => {}
    }

    if &header[0..4] != LOG_MAGIC {
        return Err(BrokerError::Corruption("invalid frame magic".into()));
    }
    if header[4] != LOG_FORMAT {
        return Err(BrokerError::InvalidFormat(format!(
            "Unsupported log format: {}",
            header[4]
        )));
    }

    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&header[6..14]);
    let version = Version(u64::from_le_bytes(version_bytes));

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[14..18]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; body_len];
    if read_full(reader, &mut body)? < body_len {
        return Ok(FrameRead::Torn);
    }

    let mut checksum_bytes = [0u8; FRAME_TRAILER_SIZE];
    if read_full(reader, &mut checksum_bytes)? < FRAME_TRAILER_SIZE {
        return Ok(FrameRead::Torn);
    }
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&body);
    if stored_checksum != computed_checksum {
        return Err(BrokerError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let op: LogOp = rmp_serde::from_slice(&body)?;
    let len = (FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE) as u64;

    Ok(FrameRead::Frame(LogEntry { version, op }, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectInput;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(key: &str, version: u64) -> (Version, LogOp) {
        let object = ObjectInput::new(key)
            .tag("t")
            .field("n", json!(version))
            .into_object("u", Version(version));
        (Version(version), LogOp::put(&object).unwrap())
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = ObjectLog::open(dir.path().join("objects.log")).unwrap();

        let (version, op) = put("a", 1);
        let offset = log.append(version, &op).unwrap();
        assert_eq!(offset, 0);

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        let object = entries[0].to_object().unwrap().unwrap();
        assert_eq!(object.key, "a");
        assert_eq!(object.version, Version(1));
        assert_eq!(object.payload["n"], json!(1));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");

        {
            let log = ObjectLog::open(&path).unwrap();
            for i in 1..=5 {
                let (version, op) = put(&format!("k{}", i), i);
                log.append(version, &op).unwrap();
            }
            log.append(Version(6), &LogOp::delete("u", "k1")).unwrap();
        }

        let log = ObjectLog::open(&path).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[5].op, LogOp::delete("u", "k1"));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");

        let good_size = {
            let log = ObjectLog::open(&path).unwrap();
            let (version, op) = put("a", 1);
            log.append(version, &op).unwrap();
            log.sync().unwrap();
            log.size()
        };

        // Half a frame header
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"TCL\0\x01").unwrap();
        }

        let log = ObjectLog::open(&path).unwrap();
        assert_eq!(log.size(), good_size);
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");

        {
            let log = ObjectLog::open(&path).unwrap();
            let (version, op) = put("a", 1);
            log.append(version, &op).unwrap();
        }

        // Flip a body byte
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(FRAME_HEADER_SIZE as u64 + 1)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(FRAME_HEADER_SIZE as u64 + 1)).unwrap();
            file.write_all(&[byte[0] ^ 0xff]).unwrap();
        }

        let result = ObjectLog::open(&path);
        assert!(matches!(result, Err(BrokerError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_failed_append_is_cut_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");
        let log = ObjectLog::open_with_sync_interval(&path, 1).unwrap();

        let (version, op) = put("a", 1);
        log.append(version, &op).unwrap();
        let good_size = log.size();

        log.fail_next_sync();
        let (version, op) = put("b", 2);
        assert!(log.append(version, &op).is_err());
        assert_eq!(log.size(), good_size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);

        // The same version can be written again
        let offset = log.append(version, &op).unwrap();
        assert_eq!(offset, good_size);
        drop(log);

        let log = ObjectLog::open(&path).unwrap();
        let versions: Vec<_> = log.entries().unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![Version(1), Version(2)]);
    }
}
