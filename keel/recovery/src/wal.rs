//! Durable storage for log records.
//!
//! Records are framed the same way in every file this module writes
//! (little-endian):
//!
//! ```text
//! ┌────────────┬────────────┬───────────┐
//! │ u32 len    │ u32 crc32  │ payload…  │
//! └────────────┴────────────┴───────────┘
//! ```
//!
//! The payload of a log frame is a postcard-encoded `(lsn, record)` pair. The
//! master record is kept out of the append-only log, in a sibling file holding
//! a single frame that is replaced atomically on every checkpoint.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::Lsn;
use crate::config::{MASTER_FILE_NAME, WAL_FILE_NAME};
use crate::error::{WalError, WalResult};
use crate::record::LogRecord;

/// 4 bytes length + 4 bytes crc32.
pub const FRAME_HEADER_SIZE: usize = 8;

#[derive(Serialize, Deserialize)]
struct LogEntry {
    lsn: Lsn,
    record: LogRecord,
}

/// Backing store of a [`crate::LogManager`].
///
/// Appends only need to become durable once [`LogStorage::sync`] returns.
pub trait LogStorage: Send {
    /// Every durable record, in append order. Anything written but never
    /// synced may be dropped.
    fn read_records(&mut self) -> WalResult<Vec<(Lsn, LogRecord)>>;

    fn append(&mut self, lsn: Lsn, record: &LogRecord) -> WalResult<()>;

    /// Make every appended record durable.
    fn sync(&mut self) -> WalResult<()>;

    /// The checkpoint LSN stored in the master record, `None` for a new log.
    fn read_master(&mut self) -> WalResult<Option<Lsn>>;

    /// Durably replace the master record.
    fn write_master(&mut self, last_checkpoint_lsn: Lsn) -> WalResult<()>;
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    let len = payload.len() as u32;

    let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// Read one frame. `Ok(None)` on a clean end of input or a frame cut short by
/// a crash.
fn read_frame(reader: &mut impl Read) -> WalResult<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(WalError::Io(e));
    }
    let (len_bytes, checksum_bytes) = header.split_at(4);
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let checksum = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);

    let mut payload = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut payload) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(WalError::Io(e));
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != checksum {
        return Err(WalError::ChecksumMismatch);
    }
    Ok(Some(payload))
}

/// Log storage in an append-only file plus a master record file, both in
/// one directory.
pub struct FileLogStorage {
    file: BufWriter<File>,
    path: PathBuf,
    master_path: PathBuf,
}

impl FileLogStorage {
    /// Open the log in `dir`, creating the directory and files if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> WalResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE_NAME);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;

        tracing::debug!(path = %path.display(), "opened log file");
        Ok(Self {
            file: BufWriter::new(file),
            path,
            master_path: dir.join(MASTER_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStorage for FileLogStorage {
    /// Reads every frame from the start of the file. A frame torn by a crash
    /// ends the log; it is cut off so later appends follow the last complete
    /// record.
    fn read_records(&mut self) -> WalResult<Vec<(Lsn, LogRecord)>> {
        self.file.flush()?;
        let mut reader = io::BufReader::new(self.file.get_ref().try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut records = Vec::new();
        let mut valid_end = 0u64;
        while let Some(payload) = read_frame(&mut reader)? {
            let entry: LogEntry = postcard::from_bytes(&payload)
                .map_err(|e| WalError::DeserializationFailed(e.to_string()))?;
            valid_end += (FRAME_HEADER_SIZE + payload.len()) as u64;
            records.push((entry.lsn, entry.record));
        }

        let file_len = self.file.get_ref().metadata()?.len();
        if file_len > valid_end {
            tracing::warn!(
                path = %self.path.display(),
                dropped = file_len - valid_end,
                "dropping torn log tail"
            );
            self.file.get_ref().set_len(valid_end)?;
        }
        self.file.seek(SeekFrom::Start(valid_end))?;
        Ok(records)
    }

    /// Writes one frame. If the write fails, the file is truncated back to
    /// where it was so no partial frame stays behind.
    fn append(&mut self, lsn: Lsn, record: &LogRecord) -> WalResult<()> {
        let entry = LogEntry {
            lsn,
            record: record.clone(),
        };
        let payload = postcard::to_allocvec(&entry)
            .map_err(|e| WalError::SerializationFailed(e.to_string()))?;
        let data = encode_frame(&payload);

        let original_pos = self.file.stream_position()?;
        match self.file.write_all(&data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.file.seek(SeekFrom::Start(original_pos))?;
                self.file.get_ref().set_len(original_pos)?;
                Err(WalError::Io(e))
            }
        }
    }

    fn sync(&mut self) -> WalResult<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    fn read_master(&mut self) -> WalResult<Option<Lsn>> {
        let mut file = match File::open(&self.master_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        };
        let Some(payload) = read_frame(&mut file)? else {
            return Err(WalError::DeserializationFailed(format!(
                "truncated master record in {}",
                self.master_path.display()
            )));
        };
        let lsn = postcard::from_bytes(&payload)
            .map_err(|e| WalError::DeserializationFailed(e.to_string()))?;
        Ok(Some(lsn))
    }

    /// Writes the new master record next to the old one and renames it into
    /// place, so a crash leaves either the old or the new record.
    fn write_master(&mut self, last_checkpoint_lsn: Lsn) -> WalResult<()> {
        let payload = postcard::to_allocvec(&last_checkpoint_lsn)
            .map_err(|e| WalError::SerializationFailed(e.to_string()))?;
        let tmp_path = self.master_path.with_extension("master.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encode_frame(&payload))?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.master_path)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLog {
    durable: Vec<(Lsn, LogRecord)>,
    pending: Vec<(Lsn, LogRecord)>,
    master: Option<Lsn>,
}

/// Log storage kept in memory.
///
/// Clones share their contents, so a test can drop a log manager to simulate
/// a crash and open a new one over a clone: records that were synced survive,
/// the rest are gone.
#[derive(Clone, Default)]
pub struct MemoryLogStorage {
    inner: Arc<Mutex<MemoryLog>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records that would survive a crash.
    pub fn durable_len(&self) -> usize {
        self.inner.lock().durable.len()
    }
}

impl LogStorage for MemoryLogStorage {
    fn read_records(&mut self) -> WalResult<Vec<(Lsn, LogRecord)>> {
        let mut log = self.inner.lock();
        log.pending.clear();
        Ok(log.durable.clone())
    }

    fn append(&mut self, lsn: Lsn, record: &LogRecord) -> WalResult<()> {
        self.inner.lock().pending.push((lsn, record.clone()));
        Ok(())
    }

    fn sync(&mut self) -> WalResult<()> {
        let mut log = self.inner.lock();
        let pending = std::mem::take(&mut log.pending);
        log.durable.extend(pending);
        Ok(())
    }

    fn read_master(&mut self) -> WalResult<Option<Lsn>> {
        Ok(self.inner.lock().master)
    }

    fn write_master(&mut self, last_checkpoint_lsn: Lsn) -> WalResult<()> {
        self.inner.lock().master = Some(last_checkpoint_lsn);
        Ok(())
    }
}
