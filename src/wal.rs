//! Write-ahead log of committed transactions and upgrades.
//!
//! Every committed write transaction and every schema upgrade is appended as
//! one checksummed entry and fsynced before the commit resolves. On open the
//! log is replayed on top of the last checkpoint snapshot; a torn entry at the
//! tail is truncated away.

use crate::error::{DataDbError, Result};
use crate::schema::MigrationStep;
use crate::types::{Key, Record};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"DWL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Header length (magic + version).
const WAL_HEADER_LEN: u64 = 5;

/// A single record-level write inside a commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriteOp {
    Put {
        collection: String,
        key: Key,
        record: Record,
    },
    Delete {
        collection: String,
        key: Key,
    },
}

/// Operations that can be recorded in the WAL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WalOperation {
    /// A schema upgrade, replayed step by step.
    Upgrade {
        old_version: u32,
        new_version: u32,
        steps: Vec<MigrationStep>,
    },
    /// A committed write transaction.
    Commit {
        writes: Vec<WriteOp>,
        /// Key generator state of each touched collection after the commit.
        key_generators: Vec<(String, u64)>,
    },
}

/// A single WAL entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub operation: WalOperation,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Write-Ahead Log manager.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<LogState>,
    writer: Mutex<Option<BufWriter<File>>>,
}

struct LogState {
    next_seq: u64,
    /// File length up to the end of the last complete entry.
    len: u64,
}

impl WriteAheadLog {
    /// Create or open a WAL file, dropping any torn entry at the tail.
    ///
    /// A damaged entry followed by further data is reported as corruption.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let (entries, valid_len) = Self::scan(&file)?;

            if file.metadata()?.len() > valid_len {
                tracing::warn!(path = %path.display(), valid_len, "truncating torn WAL tail");
                file.set_len(valid_len)?;
                file.sync_all()?;
            }

            LogState {
                next_seq: entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1,
                len: valid_len,
            }
        } else {
            Self::write_header(&path)?;
            LogState {
                next_seq: 1,
                len: WAL_HEADER_LEN,
            }
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok(Self {
            path,
            state: Mutex::new(state),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Append an operation and fsync it. Returns its sequence number.
    ///
    /// A failed append is cut back off the file before the error is returned.
    pub fn append(&self, operation: WalOperation) -> Result<u64> {
        let mut state = self.state.lock();
        let seq = state.next_seq;

        let entry = WalEntry {
            seq,
            operation,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let frame = Self::encode_entry(&entry)?;

        let mut writer = self.writer.lock();
        if writer.is_none() {
            *writer = Some(self.reopen_at(state.len)?);
        }
        let written = match writer.as_mut() {
            Some(w) => w
                .write_all(&frame)
                .and_then(|_| w.flush())
                .and_then(|_| w.get_ref().sync_all()),
            None => return Err(DataDbError::Transaction("WAL is closed".into())),
        };
        if let Err(e) = written {
            // Discard buffered bytes unflushed, then cut any partial entry off the file.
            if let Some(w) = writer.take() {
                drop(w.into_parts());
            }
            match self.reopen_at(state.len) {
                Ok(reopened) => *writer = Some(reopened),
                Err(reopen) => {
                    tracing::warn!(path = %self.path.display(), error = %reopen, "could not reset WAL tail")
                }
            }
            return Err(e.into());
        }

        state.next_seq += 1;
        state.len += frame.len() as u64;
        Ok(seq)
    }

    /// Every entry currently in the log, in order.
    pub fn entries(&self) -> Result<Vec<WalEntry>> {
        let file = File::open(&self.path)?;
        let (entries, _) = Self::scan(&file)?;
        Ok(entries)
    }

    /// Number of entries appended since the log was created or cleared.
    pub fn len(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the WAL (called after a successful checkpoint).
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut writer = self.writer.lock();
        *writer = None;

        Self::write_header(&self.path)?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        state.next_seq = 1;
        state.len = WAL_HEADER_LEN;

        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Truncate the file to `len` and open a fresh appender.
    fn reopen_at(&self, len: u64) -> Result<BufWriter<File>> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ))
    }

    /// Read every complete entry, returning them with the length of the file
    /// they cover. Stops at a torn final entry.
    fn scan(file: &File) -> Result<(Vec<WalEntry>, u64)> {
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;
        Self::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = WAL_HEADER_LEN;
        loop {
            let (payload, checksum) = match Self::read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(DataDbError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let frame_len = payload.len() as u64 + 8;

            match Self::decode_entry(&payload, checksum) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_len += frame_len;
                }
                Err(e) if valid_len + frame_len < file_len => {
                    return Err(DataDbError::Corruption(format!(
                        "WAL entry at offset {}: {}",
                        valid_len, e
                    )));
                }
                // Damaged final entry: an interrupted write.
                Err(_) => break,
            }
        }
        Ok((entries, valid_len))
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(DataDbError::InvalidFormat("Invalid WAL magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(DataDbError::InvalidFormat(format!(
                "Unsupported WAL version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    /// Length prefix, payload, CRC32 of the payload.
    fn encode_entry(entry: &WalEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec_named(entry)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    fn read_frame(reader: &mut impl Read) -> Result<(Vec<u8>, u32)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 100 * 1024 * 1024 {
            return Err(DataDbError::Corruption("WAL entry too large".into()));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        Ok((payload, u32::from_le_bytes(checksum_bytes)))
    }

    fn decode_entry(payload: &[u8], checksum: u32) -> Result<WalEntry> {
        if crc32fast::hash(payload) != checksum {
            return Err(DataDbError::Corruption("WAL checksum mismatch".into()));
        }
        Ok(rmp_serde::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(n: i64) -> WalOperation {
        WalOperation::Commit {
            writes: vec![WriteOp::Put {
                collection: "subtitles".to_string(),
                key: Key::from(n),
                record: json!({ "n": n }),
            }],
            key_generators: vec![("subtitles".to_string(), n as u64 + 1)],
        }
    }

    #[test]
    fn test_wal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        assert_eq!(wal.append(put(1)).unwrap(), 1);
        assert_eq!(wal.append(put(2)).unwrap(), 2);
        assert_eq!(wal.len(), 2);

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[1].operation {
            WalOperation::Commit { writes, .. } => match &writes[0] {
                WriteOp::Put { key, record, .. } => {
                    assert_eq!(key, &Key::from(2));
                    assert_eq!(record, &json!({"n": 2}));
                }
                other => panic!("unexpected write {:?}", other),
            },
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_wal_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.append(put(1)).unwrap();
        }

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 1);
        assert_eq!(wal.append(put(2)).unwrap(), 2);
    }

    #[test]
    fn test_wal_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.append(put(1)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 1);
        wal.append(put(2)).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_wal_damaged_middle_entry_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&path).unwrap();
            for n in 1..=3 {
                wal.append(put(n)).unwrap();
            }
        }
        let before = std::fs::metadata(&path).unwrap().len();

        // Flip a payload byte of the first entry
        let mut bytes = std::fs::read(&path).unwrap();
        let offset = WAL_HEADER_LEN as usize + 4 + 2;
        bytes[offset] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            WriteAheadLog::open(&path),
            Err(DataDbError::Corruption(_))
        ));
        // Nothing was truncated away
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn test_wal_damaged_final_entry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.append(put(1)).unwrap();
            wal.append(put(2)).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 1);
        assert_eq!(wal.append(put(2)).unwrap(), 2);
    }

    #[test]
    fn test_wal_recovers_after_failed_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        wal.append(put(1)).unwrap();

        // Leave a partial entry behind the way an interrupted write would
        *wal.writer.lock() = None;
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[200, 0, 0, 0, 9, 9, 9]).unwrap();
        }

        assert_eq!(wal.append(put(2)).unwrap(), 2);
        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 2);
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, b"nope!").unwrap();
        assert!(matches!(
            WriteAheadLog::open(&path),
            Err(DataDbError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_wal_clear() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        wal.append(put(1)).unwrap();
        assert!(!wal.is_empty());

        wal.clear().unwrap();
        assert!(wal.is_empty());
        assert!(wal.entries().unwrap().is_empty());

        assert_eq!(wal.append(put(2)).unwrap(), 1);
    }
}
