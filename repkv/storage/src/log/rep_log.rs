// rep_log.rs
// Append-only replicated log.
//
// Frame layout (little-endian):
// ┌────────────┬────────────┬───────────┐
// │ u32 len    │ u32 crc32  │ payload…  │
// └────────────┴────────────┴───────────┘
// - `len`    : number of bytes in payload
// - `crc32`  : checksum of payload for corruption detection
//
// The LSN of an entry is the byte offset of its frame. Every entry is also kept in an
// in-memory position index so that transactions can fetch their own earlier entries
// (undo, rollback) without re-reading the file.
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher;
use dashmap::DashMap;
use parking_lot::Mutex;
use repkv_transaction::{Lsn, SyncPolicy, TxnId, Vlsn};
use tracing::warn;

use super::entry::{LogBody, LogEntry};
use super::utilization::{CountMode, ObsoleteTracker};
use super::LogRecord;
use crate::config::LogConfig;
use crate::error::{LogError, StorageResult};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

/// How an appended entry obtains its VLSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlsnSource {
    /// Not part of the replication stream.
    Local,
    /// Assign the next VLSN (master side).
    Generate,
    /// Use the VLSN mandated by the replicated record (replica side).
    Replicated(Vlsn),
}

struct LogWriter {
    file: Option<BufWriter<File>>,
    end_offset: u64,
}

/// The replicated log: append, fetch-by-position and obsolete tracking.
pub struct RepLog {
    /// The log-append mutex. Everything that must be decided at serialization time runs
    /// while it is held.
    writer: Mutex<LogWriter>,
    entries: DashMap<Lsn, Arc<LogEntry>>,
    last_vlsn: AtomicI64,
    /// Latest VLSN known to be replicated to a quorum in the current term.
    dtvlsn: AtomicI64,
    obsolete: ObsoleteTracker,
    path: Option<PathBuf>,
}

impl RepLog {
    /// A log that lives only in memory. Positions still advance by frame size.
    pub fn in_memory() -> Self {
        Self {
            writer: Mutex::new(LogWriter {
                file: None,
                end_offset: 0,
            }),
            entries: DashMap::new(),
            last_vlsn: AtomicI64::new(Vlsn::UNINITIALIZED.raw()),
            dtvlsn: AtomicI64::new(Vlsn::UNINITIALIZED.raw()),
            obsolete: ObsoleteTracker::new(),
            path: None,
        }
    }

    /// Opens the log described by `config`, re-reading any entries already on disk.
    ///
    /// A frame cut short at the end of the file (a torn write) is discarded and the file is
    /// truncated to the last complete frame. A checksum mismatch is reported as corruption.
    pub fn open(config: &LogConfig) -> StorageResult<Self> {
        let Some(path) = config.log_path.as_ref() else {
            return Ok(Self::in_memory());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(LogError::Io)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(LogError::Io)?;

        let (recovered, valid_end) = read_frames(&mut file)?;
        file.set_len(valid_end).map_err(LogError::Io)?;
        file.seek(SeekFrom::Start(valid_end)).map_err(LogError::Io)?;

        let mut log = Self::in_memory();
        log.path = Some(path.clone());
        {
            let writer = log.writer.get_mut();
            writer.file = Some(BufWriter::new(file));
            writer.end_offset = valid_end;
        }
        for entry in recovered {
            if let Some(vlsn) = entry.vlsn {
                log.last_vlsn.fetch_max(vlsn.raw(), Ordering::SeqCst);
            }
            if let Some(end) = entry.as_txn_end() {
                log.dtvlsn.fetch_max(end.dtvlsn.raw(), Ordering::SeqCst);
            }
            log.entries.insert(entry.lsn, Arc::new(entry));
        }
        Ok(log)
    }

    /// Appends an entry whose body is already known.
    pub fn append(
        &self,
        txn_id: TxnId,
        vlsn: VlsnSource,
        body: LogBody,
    ) -> StorageResult<Arc<LogEntry>> {
        self.append_with(txn_id, vlsn, |_, _| body)
    }

    /// Appends an entry whose body is built while the log-append mutex is held.
    ///
    /// `build` receives the VLSN the entry gets and the current DTVLSN. Anything it captures
    /// or publishes (the master term, the corrected DTVLSN, the commit VLSN) is therefore
    /// ordered consistently with the position the entry gets.
    ///
    /// If writing the frame fails, the file is truncated back to where the frame started so
    /// that no partial frame is left behind.
    pub fn append_with<F>(
        &self,
        txn_id: TxnId,
        vlsn: VlsnSource,
        build: F,
    ) -> StorageResult<Arc<LogEntry>>
    where
        F: FnOnce(Option<Vlsn>, Vlsn) -> LogBody,
    {
        let mut writer = self.writer.lock();
        let lsn = Lsn::new(writer.end_offset);
        let vlsn = match vlsn {
            VlsnSource::Local => None,
            VlsnSource::Generate => Some(self.last_vlsn().next()),
            VlsnSource::Replicated(vlsn) => Some(vlsn),
        };
        let body = build(vlsn, self.dtvlsn());
        let entry = LogEntry {
            lsn,
            vlsn,
            txn_id,
            body,
        };

        let payload = entry.to_bytes()?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        let len = payload.len() as u32;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        let original_pos = writer.end_offset;
        if let Some(file) = writer.file.as_mut() {
            if let Err(e) = file.write_all(&data) {
                file.seek(SeekFrom::Start(original_pos))
                    .map_err(LogError::Io)?;
                file.get_ref().set_len(original_pos).map_err(LogError::Io)?;
                return Err(LogError::Io(e).into());
            }
        }
        writer.end_offset += data.len() as u64;

        if let Some(vlsn) = vlsn {
            self.last_vlsn.fetch_max(vlsn.raw(), Ordering::SeqCst);
        }
        let entry = Arc::new(entry);
        self.entries.insert(lsn, entry.clone());
        Ok(entry)
    }

    /// Makes appended entries durable according to `policy`.
    pub fn flush(&self, policy: SyncPolicy) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        let Some(file) = writer.file.as_mut() else {
            return Ok(());
        };
        match policy {
            SyncPolicy::NoSync => Ok(()),
            SyncPolicy::WriteNoSync => file.flush().map_err(|e| LogError::Io(e).into()),
            SyncPolicy::Sync => {
                file.flush().map_err(LogError::Io)?;
                file.get_ref()
                    .sync_data()
                    .map_err(|e| LogError::Io(e).into())
            }
        }
    }

    /// Reads the entry at `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> StorageResult<Arc<LogEntry>> {
        self.entries
            .get(&lsn)
            .map(|e| e.value().clone())
            .ok_or_else(|| LogError::EntryNotFound(lsn).into())
    }

    /// Returns every entry in position order.
    pub fn read_all(&self) -> Vec<Arc<LogEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.lsn);
        entries
    }

    /// Position the next entry will get.
    pub fn end_of_log(&self) -> Lsn {
        Lsn::new(self.writer.lock().end_offset)
    }

    pub fn last_vlsn(&self) -> Vlsn {
        Vlsn::new(self.last_vlsn.load(Ordering::SeqCst))
    }

    pub fn dtvlsn(&self) -> Vlsn {
        Vlsn::new(self.dtvlsn.load(Ordering::SeqCst))
    }

    /// Advances the DTVLSN watermark. It never moves backwards.
    pub fn update_dtvlsn(&self, vlsn: Vlsn) {
        self.dtvlsn.fetch_max(vlsn.raw(), Ordering::SeqCst);
    }

    pub fn count_obsolete(&self, lsn: Lsn, mode: CountMode) -> bool {
        self.obsolete.count(lsn, mode)
    }

    pub fn obsolete(&self) -> &ObsoleteTracker {
        &self.obsolete
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Reads complete frames from the start of `file`, returning them with the offset just past
/// the last complete frame.
fn read_frames(file: &mut File) -> StorageResult<(Vec<LogEntry>, u64)> {
    file.seek(SeekFrom::Start(0)).map_err(LogError::Io)?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut header = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                break;
            }
            return Err(LogError::Io(e).into());
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(offset, "discarding torn frame at end of log");
                break;
            }
            return Err(LogError::Io(e).into());
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != checksum {
            return Err(LogError::ChecksumMismatch.into());
        }

        entries.push(LogEntry::from_bytes(&payload)?);
        offset += (HEADER_SIZE + len) as u64;
    }
    Ok((entries, offset))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use repkv_transaction::MasterIdTerm;
    use serial_test::serial;

    use super::*;
    use crate::error::StorageError;
    use crate::log::entry::{LnRecord, RecordKey, TxnEndRecord};

    fn temp_log_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("test_rep_log_{}.log", std::process::id()));
        path
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_file(path);
    }

    fn ln(key: &str, prev_lsn: Option<Lsn>) -> LogBody {
        LogBody::Ln(LnRecord {
            key: RecordKey::new(1, key.as_bytes()),
            data: Some(b"value".to_vec()),
            abort_lsn: None,
            abort_known_deleted: false,
            prev_lsn,
        })
    }

    #[test]
    fn test_append_and_fetch() {
        let log = RepLog::in_memory();
        let txn = TxnId::new(-1);

        let first = log.append(txn, VlsnSource::Generate, ln("a", None)).unwrap();
        let second = log
            .append(txn, VlsnSource::Generate, ln("b", Some(first.lsn)))
            .unwrap();

        assert_eq!(first.lsn, Lsn::new(0));
        assert!(second.lsn > first.lsn);
        assert_eq!(first.vlsn, Some(Vlsn::FIRST));
        assert_eq!(second.vlsn, Some(Vlsn::new(2)));
        assert_eq!(log.fetch(second.lsn).unwrap().prev_lsn(), Some(first.lsn));
        assert_eq!(log.read_all().len(), 2);

        match log.fetch(Lsn::new(1)) {
            Err(StorageError::Log(LogError::EntryNotFound(lsn))) => assert_eq!(lsn, Lsn::new(1)),
            other => panic!("expected EntryNotFound, got {:?}", other.map(|e| e.lsn)),
        }
    }

    #[test]
    fn test_replicated_vlsn_advances_counter() {
        let log = RepLog::in_memory();
        log.append(TxnId::new(-4), VlsnSource::Replicated(Vlsn::new(40)), ln("a", None))
            .unwrap();
        assert_eq!(log.last_vlsn(), Vlsn::new(40));
        let local = log.append(TxnId::new(3), VlsnSource::Local, ln("b", None)).unwrap();
        assert_eq!(local.vlsn, None);
        let next = log.append(TxnId::new(-5), VlsnSource::Generate, ln("c", None)).unwrap();
        assert_eq!(next.vlsn, Some(Vlsn::new(41)));
    }

    #[test]
    fn test_builder_sees_current_dtvlsn() {
        let log = RepLog::in_memory();
        log.update_dtvlsn(Vlsn::new(12));
        log.update_dtvlsn(Vlsn::new(7));
        assert_eq!(log.dtvlsn(), Vlsn::new(12));

        let entry = log
            .append_with(TxnId::new(-1), VlsnSource::Generate, |vlsn, dtvlsn| {
                assert_eq!(vlsn, Some(Vlsn::FIRST));
                LogBody::Commit(TxnEndRecord {
                    last_lsn: None,
                    master_id_term: MasterIdTerm::new(1, 1),
                    dtvlsn,
                    time_ms: now_ms(),
                })
            })
            .unwrap();
        assert_eq!(entry.as_txn_end().unwrap().dtvlsn, Vlsn::new(12));
    }

    #[test]
    #[serial]
    fn test_reopen_restores_entries() {
        let path = temp_log_path();
        cleanup(&path);
        let config = LogConfig {
            log_path: Some(path.clone()),
        };

        let (first, second) = {
            let log = RepLog::open(&config).unwrap();
            let first = log.append(TxnId::new(-1), VlsnSource::Generate, ln("a", None)).unwrap();
            let second = log
                .append(TxnId::new(-1), VlsnSource::Generate, ln("b", Some(first.lsn)))
                .unwrap();
            log.flush(SyncPolicy::Sync).unwrap();
            (first.lsn, second.lsn)
        };

        let log = RepLog::open(&config).unwrap();
        let entries = log.read_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].lsn, first);
        assert_eq!(entries[1].lsn, second);
        assert_eq!(log.last_vlsn(), Vlsn::new(2));

        // New entries continue after the recovered ones.
        let third = log.append(TxnId::new(-2), VlsnSource::Generate, ln("c", None)).unwrap();
        assert!(third.lsn > second);
        assert_eq!(third.vlsn, Some(Vlsn::new(3)));

        cleanup(&path);
    }

    #[test]
    #[serial]
    fn test_torn_tail_is_discarded() {
        let path = temp_log_path();
        cleanup(&path);
        let config = LogConfig {
            log_path: Some(path.clone()),
        };

        let end = {
            let log = RepLog::open(&config).unwrap();
            log.append(TxnId::new(-1), VlsnSource::Generate, ln("a", None)).unwrap();
            log.flush(SyncPolicy::Sync).unwrap();
            log.end_of_log()
        };

        {
            // A header promising more payload than was written.
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
            file.sync_data().unwrap();
        }

        let log = RepLog::open(&config).unwrap();
        assert_eq!(log.read_all().len(), 1);
        assert_eq!(log.end_of_log(), end);
        assert_eq!(fs::metadata(&path).unwrap().len(), end.raw());

        cleanup(&path);
    }

    #[test]
    #[serial]
    fn test_checksum_mismatch_is_reported() {
        let path = temp_log_path();
        cleanup(&path);
        {
            let mut file = File::create(&path).unwrap();
            let payload = vec![0u8; 20];
            file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&12345u32.to_le_bytes()).unwrap();
            file.write_all(&payload).unwrap();
            file.sync_data().unwrap();
        }

        let config = LogConfig {
            log_path: Some(path.clone()),
        };
        match RepLog::open(&config) {
            Err(StorageError::Log(LogError::ChecksumMismatch)) => {}
            Err(e) => panic!("expected checksum mismatch, got {e}"),
            Ok(_) => panic!("expected checksum mismatch"),
        }

        cleanup(&path);
    }
}
