//! # Write-Ahead Log
//!
//! The authoritative linearization of durable two-phase events. Every
//! PREPARE, COMMIT PREPARED and ROLLBACK PREPARED writes a record here
//! before any other durable effect, and crash recovery replays the log to
//! reconcile whatever the crash interrupted.
//!
//! ## Record Format
//!
//! ```text
//! +------------------+------------------+
//! | Record Header    | Payload          |
//! | (16 bytes)       | (len bytes)      |
//! +------------------+------------------+
//! ```
//!
//! The header carries the payload length, record kind, flag bits, the
//! owning XID and a CRC-32 over header fields and payload. A PREPARE
//! record's payload is the complete state-file content, passed as the same
//! buffer chain the state-file writer streams to disk; commit/abort records
//! carry their drop list and subtransaction XIDs.
//!
//! ## Write Protocol
//!
//! `append` buffers the record at the current end of log and returns its
//! end position; nothing is durable until `flush(lsn)` returns. Separating
//! the two is what lets the prepare path order its three fsyncs around a
//! single WAL flush.
//!
//! ## Read Protocol
//!
//! The reader walks records from the start of the log, validating each
//! CRC. A short read or checksum mismatch terminates the scan; a torn tail
//! is the normal shape of a crash, not an error.
//!
//! ## Checkpoint-Start Lock
//!
//! Prepare and finish hold this lock shared around their WAL insert and
//! the writes that must land with it; a checkpointer acquires it exclusive
//! before deciding where replay will begin. Holding it shared guarantees a
//! checkpoint cannot complete between a WAL insert and the matching disk
//! state, which would make replay skip the record.
//!
//! ## Concurrency
//!
//! A `Mutex` serializes writers; the reader opens its own file handle and
//! never touches writer state.

use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::WAL_DIR;
use crate::error::{Result, TwoPhaseError};
use crate::types::{Lsn, RelFileId, Xid};

pub const WAL_RECORD_HEADER_SIZE: usize = 16;

/// Flag on commit/abort-prepared records: the record's XID does not own the
/// record (the owning transaction already ended at PREPARE).
pub const WAL_FLAG_NO_TRAN: u8 = 0x01;

/// Upper bound on a plausible record payload; anything larger terminates a
/// scan as garbage.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

const SEGMENT_FILE: &str = "wal.000001";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Prepare = 1,
    CommitPrepared = 2,
    AbortPrepared = 3,
}

impl RecordKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Prepare),
            2 => Some(Self::CommitPrepared),
            3 => Some(Self::AbortPrepared),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct WalRecordHeader {
    pub len: u32,
    pub kind: u8,
    pub flags: u8,
    _reserved: [u8; 2],
    pub xid: Xid,
    pub crc: u32,
}

const _: () = assert!(size_of::<WalRecordHeader>() == WAL_RECORD_HEADER_SIZE);

fn compute_record_crc(header: &WalRecordHeader, segments: &[&[u8]]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&header.len.to_ne_bytes());
    digest.update(&[header.kind, header.flags]);
    digest.update(&header.xid.to_ne_bytes());
    for segment in segments {
        digest.update(segment);
    }
    digest.finalize()
}

/// Fixed-size head of a commit/abort-prepared payload, followed by the drop
/// list and the subtransaction XIDs.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct XlFinishPrepared {
    pub nrels: u32,
    pub nsubxacts: u32,
}

/// Decode a commit/abort-prepared payload into its drop list and children.
pub fn decode_finish_payload(payload: &[u8]) -> Result<(Vec<RelFileId>, Vec<Xid>)> {
    let (xl, rest) = XlFinishPrepared::read_from_prefix(payload)
        .map_err(|_| TwoPhaseError::Internal("short commit/abort-prepared payload".into()))?;

    let rels_len = xl.nrels as usize * size_of::<RelFileId>();
    let children_len = xl.nsubxacts as usize * size_of::<Xid>();
    if rest.len() < rels_len + children_len {
        return Err(TwoPhaseError::Internal(
            "commit/abort-prepared payload shorter than its counts".into(),
        ));
    }

    let rels = rest[..rels_len]
        .chunks_exact(size_of::<RelFileId>())
        .map(|chunk| RelFileId::read_from_bytes(chunk).unwrap())
        .collect();
    let children = rest[rels_len..rels_len + children_len]
        .chunks_exact(size_of::<Xid>())
        .map(|chunk| Xid::from_ne_bytes(chunk.try_into().unwrap()))
        .collect();

    Ok((rels, children))
}

struct WalWriter {
    file: File,
    write_offset: u64,
    flushed_to: u64,
}

pub struct Wal {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    checkpoint_start: RwLock<()>,
}

impl Wal {
    /// Open (or create) the log under `<data-dir>/wal/`, positioning the
    /// writer at the current end of log.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(WAL_DIR);
        create_dir_all(&dir).map_err(|err| {
            TwoPhaseError::io(format!("could not create WAL directory {}", dir.display()), err)
        })?;

        let path = dir.join(SEGMENT_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                TwoPhaseError::io(format!("could not open WAL segment {}", path.display()), err)
            })?;

        let end = file
            .seek(SeekFrom::End(0))
            .map_err(|err| TwoPhaseError::io("could not seek to end of WAL", err))?;

        Ok(Self {
            path,
            writer: Mutex::new(WalWriter {
                file,
                write_offset: end,
                flushed_to: end,
            }),
            checkpoint_start: RwLock::new(()),
        })
    }

    /// Append one logical record whose payload is the concatenation of
    /// `segments`. Returns the record's end position; the record is not
    /// durable until [`flush`](Self::flush) covers that position.
    pub fn append(
        &self,
        kind: RecordKind,
        flags: u8,
        xid: Xid,
        segments: &[&[u8]],
    ) -> Result<Lsn> {
        let payload_len: usize = segments.iter().map(|s| s.len()).sum();

        let mut header = WalRecordHeader {
            len: payload_len as u32,
            kind: kind as u8,
            flags,
            _reserved: [0; 2],
            xid,
            crc: 0,
        };
        header.crc = compute_record_crc(&header, segments);

        let mut writer = self.writer.lock();
        writer
            .file
            .write_all(header.as_bytes())
            .map_err(|err| TwoPhaseError::io("could not write WAL record header", err))?;
        for segment in segments {
            writer
                .file
                .write_all(segment)
                .map_err(|err| TwoPhaseError::io("could not write WAL record payload", err))?;
        }
        writer.write_offset += (WAL_RECORD_HEADER_SIZE + payload_len) as u64;

        Ok(writer.write_offset)
    }

    /// Make every record ending at or before `lsn` durable.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.flushed_to >= lsn {
            return Ok(());
        }
        writer
            .file
            .sync_data()
            .map_err(|err| TwoPhaseError::io("could not fsync WAL", err))?;
        writer.flushed_to = writer.write_offset;
        Ok(())
    }

    /// Block checkpoint start for the duration of the guard. Prepare and
    /// finish hold this across their critical sections.
    pub fn checkpoint_start_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.checkpoint_start.read()
    }

    /// The checkpointer's side of the lock.
    pub fn checkpoint_start_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.checkpoint_start.write()
    }

    /// A sequential reader over the whole log, on its own file handle.
    pub fn reader(&self) -> Result<WalReader> {
        let file = File::open(&self.path).map_err(|err| {
            TwoPhaseError::io(
                format!("could not open WAL segment {} for replay", self.path.display()),
                err,
            )
        })?;
        Ok(WalReader { file, offset: 0 })
    }
}

#[derive(Debug)]
pub struct WalRecord {
    pub kind: RecordKind,
    pub flags: u8,
    pub xid: Xid,
    pub payload: Vec<u8>,
    /// Position just past this record.
    pub end_lsn: Lsn,
}

pub struct WalReader {
    file: File,
    offset: u64,
}

impl WalReader {
    /// The next valid record, or `None` at end of log. A short read, an
    /// unknown kind or a checksum mismatch all read as end-of-log: that is
    /// what an interrupted append looks like after a crash.
    pub fn next_record(&mut self) -> Option<WalRecord> {
        let mut header_bytes = [0u8; WAL_RECORD_HEADER_SIZE];
        if self.file.read_exact(&mut header_bytes).is_err() {
            return None;
        }

        let header = WalRecordHeader::read_from_bytes(&header_bytes).ok()?;
        if header.len > MAX_RECORD_LEN {
            return None;
        }
        let kind = RecordKind::from_u8(header.kind)?;

        let mut payload = vec![0u8; header.len as usize];
        if self.file.read_exact(&mut payload).is_err() {
            return None;
        }

        // The CRC covers the non-CRC header fields plus the payload.
        if compute_record_crc(&header, &[payload.as_slice()]) != header.crc {
            return None;
        }

        self.offset += (WAL_RECORD_HEADER_SIZE + payload.len()) as u64;

        Some(WalRecord {
            kind,
            flags: header.flags,
            xid: header.xid,
            payload,
            end_lsn: self.offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_flush_read_round_trip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        let lsn = wal
            .append(RecordKind::Prepare, 0, 7, &[b"hello " as &[u8], b"world"])
            .unwrap();
        wal.flush(lsn).unwrap();

        let mut reader = wal.reader().unwrap();
        let record = reader.next_record().unwrap();
        assert_eq!(record.kind, RecordKind::Prepare);
        assert_eq!(record.xid, 7);
        assert_eq!(record.payload, b"hello world");
        assert_eq!(record.end_lsn, lsn);
        assert!(reader.next_record().is_none());
    }

    #[test]
    fn records_replay_in_append_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        wal.append(RecordKind::Prepare, 0, 1, &[b"a" as &[u8]]).unwrap();
        wal.append(RecordKind::CommitPrepared, WAL_FLAG_NO_TRAN, 1, &[b"b" as &[u8]])
            .unwrap();
        let lsn = wal.append(RecordKind::AbortPrepared, WAL_FLAG_NO_TRAN, 2, &[]).unwrap();
        wal.flush(lsn).unwrap();

        let mut reader = wal.reader().unwrap();
        assert_eq!(reader.next_record().unwrap().kind, RecordKind::Prepare);
        let commit = reader.next_record().unwrap();
        assert_eq!(commit.kind, RecordKind::CommitPrepared);
        assert_eq!(commit.flags, WAL_FLAG_NO_TRAN);
        assert_eq!(reader.next_record().unwrap().kind, RecordKind::AbortPrepared);
        assert!(reader.next_record().is_none());
    }

    #[test]
    fn torn_tail_terminates_scan() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let first = wal
            .append(RecordKind::Prepare, 0, 1, &[b"intact" as &[u8]])
            .unwrap();
        wal.append(RecordKind::Prepare, 0, 2, &[b"torn" as &[u8]])
            .unwrap();
        wal.flush(u64::MAX).unwrap();
        drop(wal);

        // Chop the second record mid-payload, as a crash during append would.
        let path = dir.path().join(WAL_DIR).join(SEGMENT_FILE);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(first + WAL_RECORD_HEADER_SIZE as u64 + 2).unwrap();

        let wal = Wal::open(dir.path()).unwrap();
        let mut reader = wal.reader().unwrap();
        let record = reader.next_record().unwrap();
        assert_eq!(record.xid, 1);
        assert!(reader.next_record().is_none());
    }

    #[test]
    fn corrupt_crc_terminates_scan() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let lsn = wal
            .append(RecordKind::Prepare, 0, 1, &[b"payload" as &[u8]])
            .unwrap();
        wal.flush(lsn).unwrap();
        drop(wal);

        let path = dir.path().join(WAL_DIR).join(SEGMENT_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let wal = Wal::open(dir.path()).unwrap();
        assert!(wal.reader().unwrap().next_record().is_none());
    }

    #[test]
    fn finish_payload_round_trip() {
        let rels = [RelFileId::new(1, 10), RelFileId::new(1, 11)];
        let children: [Xid; 3] = [5, 6, 7];
        let xl = XlFinishPrepared {
            nrels: rels.len() as u32,
            nsubxacts: children.len() as u32,
        };

        let mut payload = Vec::new();
        payload.extend_from_slice(xl.as_bytes());
        payload.extend_from_slice(rels.as_bytes());
        payload.extend_from_slice(children.as_bytes());

        let (decoded_rels, decoded_children) = decode_finish_payload(&payload).unwrap();
        assert_eq!(decoded_rels, rels);
        assert_eq!(decoded_children, children);
    }
}
