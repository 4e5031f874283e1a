//! # Two-Phase State Files
//!
//! One file per prepared transaction makes the transaction durable across
//! restarts. Files live in `pg_twophase/` under the data directory and are
//! named by the transaction's XID as eight uppercase hex digits.
//!
//! ## File Format
//!
//! ```text
//! +---------------------------+
//! | StateFileHeader           |  magic, total_len, xid, database, owner,
//! |                           |  counts, gid (fixed 200 bytes)
//! +---------------------------+
//! | Xid[nsubxacts]            |  subtransaction XIDs
//! +---------------------------+
//! | RelFileId[ncommitrels]    |  files to delete on commit
//! +---------------------------+
//! | RelFileId[nabortrels]     |  files to delete on abort
//! +---------------------------+
//! | RecordHeader + payload    |  one per resource manager, repeated
//! | ...                       |
//! | RecordHeader (END, len=0) |  end sentinel
//! +---------------------------+
//! | CRC-32                    |  over everything above
//! +---------------------------+
//! ```
//!
//! Every segment except the trailing CRC is padded to a [`MAX_ALIGN`]
//! multiple. Multi-byte fields are native-endian; state files are not
//! portable across architectures, matching their role as crash-recovery
//! state rather than interchange data.
//!
//! ## Validation
//!
//! [`read_state_file`] accepts a file only if its size is within bounds,
//! its CRC slot lands on an aligned offset, the magic and recorded total
//! length match, and the CRC verifies. Anything else returns `None`; the
//! caller decides whether that means "corrupt, remove it" (startup scan)
//! or "corrupt, fail the command" (finish).

pub mod builder;

pub use builder::StateFileBuilder;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::warn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{max_align, GID_SIZE, MAX_STATE_FILE_SIZE, STATE_FILE_MAGIC, TWOPHASE_DIR};
use crate::error::{Result, TwoPhaseError};
use crate::rmgr::{TwoPhaseCallback, RM_END_ID, RM_TABLE_SIZE};
use crate::types::{DbId, RelFileId, UserId, Xid};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Size of the trailing checksum.
pub const CRC_SIZE: usize = 4;

/// Fixed header at the start of every state file.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct StateFileHeader {
    pub magic: u32,
    /// Actual file length in bytes, including the trailing CRC.
    pub total_len: u32,
    pub xid: Xid,
    pub database: DbId,
    pub owner: UserId,
    pub nsubxacts: u32,
    pub ncommitrels: u32,
    pub nabortrels: u32,
    pub gid: [u8; GID_SIZE],
}

impl StateFileHeader {
    /// The GID field decoded up to its NUL terminator.
    pub fn gid_str(&self) -> String {
        let end = self.gid.iter().position(|&b| b == 0).unwrap_or(GID_SIZE);
        String::from_utf8_lossy(&self.gid[..end]).into_owned()
    }

    pub(crate) fn encode_gid(gid: &str) -> [u8; GID_SIZE] {
        debug_assert!(gid.len() < GID_SIZE);
        let mut buf = [0u8; GID_SIZE];
        buf[..gid.len()].copy_from_slice(gid.as_bytes());
        buf
    }
}

/// Header of each resource-manager record in the record stream.
///
/// `len` counts only the payload, not this header; the payload starts on
/// the next MAX_ALIGN boundary after it.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RecordHeader {
    pub len: u32,
    pub rmid: u16,
    pub info: u16,
}

const _: () = assert!(size_of::<StateFileHeader>() % crate::config::MAX_ALIGN == 0);
const _: () = assert!(size_of::<RecordHeader>() % crate::config::MAX_ALIGN == 0);

/// Smallest file that can possibly be valid: header, end sentinel, CRC.
const MIN_STATE_FILE_SIZE: u64 =
    (max_align(size_of::<StateFileHeader>()) + max_align(size_of::<RecordHeader>()) + CRC_SIZE)
        as u64;

pub fn twophase_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(TWOPHASE_DIR)
}

/// `<data-dir>/pg_twophase/<xid as eight uppercase hex digits>`
pub fn state_file_path(data_dir: &Path, xid: Xid) -> PathBuf {
    twophase_dir(data_dir).join(format!("{xid:08X}"))
}

/// Whether a directory entry name is a state file: exactly eight uppercase
/// hex digits.
pub fn is_state_file_name(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Read and validate the state file for `xid`.
///
/// Returns the file contents when the magic, length and CRC all check out,
/// `None` otherwise. I/O errors are logged as warnings and also yield
/// `None`; the callers treat an unreadable file the same as a corrupt one.
pub fn read_state_file(data_dir: &Path, xid: Xid) -> Option<Vec<u8>> {
    let path = state_file_path(data_dir, xid);

    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), %err, "could not open two-phase state file");
            return None;
        }
    };

    let len = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(path = %path.display(), %err, "could not stat two-phase state file");
            return None;
        }
    };

    // A lower bound is easy; the upper bound mainly avoids a huge
    // allocation on a garbage length.
    if len < MIN_STATE_FILE_SIZE || len > MAX_STATE_FILE_SIZE {
        return None;
    }

    let crc_offset = len as usize - CRC_SIZE;
    if crc_offset != max_align(crc_offset) {
        return None;
    }

    let mut buf = vec![0u8; len as usize];
    if let Err(err) = file.read_exact(&mut buf) {
        warn!(path = %path.display(), %err, "could not read two-phase state file");
        return None;
    }

    let Ok((header, _)) = StateFileHeader::read_from_prefix(&buf) else {
        return None;
    };
    if header.magic != STATE_FILE_MAGIC || header.total_len as u64 != len {
        return None;
    }

    let mut digest = CRC32.digest();
    digest.update(&buf[..crc_offset]);
    let calc_crc = digest.finalize();
    let file_crc = u32::from_ne_bytes(buf[crc_offset..].try_into().unwrap());
    if calc_crc != file_crc {
        return None;
    }

    Some(buf)
}

/// Structured view over a validated state-file buffer.
#[derive(Debug)]
pub struct ParsedStateFile {
    pub header: StateFileHeader,
    pub children: Vec<Xid>,
    pub commit_drops: Vec<RelFileId>,
    pub abort_drops: Vec<RelFileId>,
    /// Offset of the resource-manager record stream within the buffer.
    pub records_offset: usize,
}

/// Disassemble a buffer returned by [`read_state_file`]. The CRC has
/// already vouched for the bytes; this still bounds-checks so a logic bug
/// cannot walk off the end.
pub fn parse_state_file(buf: &[u8]) -> Result<ParsedStateFile> {
    let (header, _) = StateFileHeader::read_from_prefix(buf)
        .map_err(|_| TwoPhaseError::Internal("state-file buffer shorter than header".into()))?;

    let mut offset = max_align(size_of::<StateFileHeader>());

    let children = read_array::<4, Xid>(buf, &mut offset, header.nsubxacts as usize, |bytes| {
        Xid::from_ne_bytes(bytes.try_into().unwrap())
    })?;
    let commit_drops =
        read_array::<8, RelFileId>(buf, &mut offset, header.ncommitrels as usize, |bytes| {
            RelFileId::read_from_bytes(bytes).unwrap()
        })?;
    let abort_drops =
        read_array::<8, RelFileId>(buf, &mut offset, header.nabortrels as usize, |bytes| {
            RelFileId::read_from_bytes(bytes).unwrap()
        })?;

    Ok(ParsedStateFile {
        header,
        children,
        commit_drops,
        abort_drops,
        records_offset: offset,
    })
}

fn read_array<const ITEM: usize, T>(
    buf: &[u8],
    offset: &mut usize,
    count: usize,
    decode: impl Fn(&[u8]) -> T,
) -> Result<Vec<T>> {
    let raw_len = count
        .checked_mul(ITEM)
        .ok_or_else(|| TwoPhaseError::Internal("state-file array count overflow".into()))?;
    let end = *offset + raw_len;
    if end > buf.len() {
        return Err(TwoPhaseError::Internal(
            "state-file array extends past end of buffer".into(),
        ));
    }
    let items = buf[*offset..end].chunks_exact(ITEM).map(decode).collect();
    *offset += max_align(raw_len);
    Ok(items)
}

/// Walk the resource-manager record stream starting at `offset`, invoking
/// the callback registered for each record's rmid until the end sentinel.
pub fn process_records(
    buf: &[u8],
    offset: usize,
    xid: Xid,
    callbacks: &[Option<TwoPhaseCallback>; RM_TABLE_SIZE],
) {
    let mut offset = offset;
    loop {
        let Ok((record, _)) = RecordHeader::read_from_prefix(buf.get(offset..).unwrap_or(&[]))
        else {
            debug_assert!(false, "record stream ran past end of state file");
            return;
        };
        debug_assert!((record.rmid as usize) < RM_TABLE_SIZE);
        if record.rmid == RM_END_ID {
            return;
        }

        offset += max_align(size_of::<RecordHeader>());
        let payload_end = offset + record.len as usize;
        if payload_end > buf.len() {
            debug_assert!(false, "record payload runs past end of state file");
            return;
        }

        if let Some(callback) = callbacks.get(record.rmid as usize).and_then(|c| c.as_ref()) {
            callback(xid, record.info, &buf[offset..payload_end]);
        }

        offset += max_align(record.len as usize);
    }
}

/// Remove the state file for `xid`.
///
/// With `give_warning = false`, a missing file is silently accepted; WAL
/// replay removes files that may never have been recreated.
pub fn remove_state_file(data_dir: &Path, xid: Xid, give_warning: bool) {
    let path = state_file_path(data_dir, xid);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound || give_warning {
            warn!(path = %path.display(), %err, "could not remove two-phase state file");
        }
    }
}

/// Recreate a state file from the payload of a PREPARE WAL record.
///
/// `content` excludes the CRC; it is recomputed here. No ordering dance is
/// needed: WAL is the canonical truth during replay and the file is merely
/// its materialization.
pub fn recreate_state_file(data_dir: &Path, xid: Xid, content: &[u8]) -> Result<()> {
    let mut digest = CRC32.digest();
    digest.update(content);
    let crc = digest.finalize();

    let path = state_file_path(data_dir, xid);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|err| {
            TwoPhaseError::io(
                format!("could not recreate two-phase state file {}", path.display()),
                err,
            )
        })?;

    file.write_all(content)
        .map_err(|err| TwoPhaseError::io("could not write two-phase state file", err))?;
    file.write_all(&crc.to_ne_bytes())
        .map_err(|err| TwoPhaseError::io("could not write two-phase state file", err))?;
    file.sync_data()
        .map_err(|err| TwoPhaseError::io("could not fsync two-phase state file", err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmgr::RmgrTable;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_content(xid: Xid, children: &[Xid]) -> Vec<u8> {
        let mut builder = StateFileBuilder::new();
        let header = StateFileHeader {
            magic: STATE_FILE_MAGIC,
            total_len: 0,
            xid,
            database: 1,
            owner: 42,
            nsubxacts: children.len() as u32,
            ncommitrels: 1,
            nabortrels: 0,
            gid: StateFileHeader::encode_gid("test-gid"),
        };
        builder.start(&header, children, &[RelFileId::new(1, 77)], &[]);
        builder.register_record(1, 3, b"lock payload");
        builder.finish();
        let mut content = Vec::new();
        for segment in builder.segments() {
            content.extend_from_slice(segment);
        }
        content
    }

    fn write_via_recreate(dir: &Path, xid: Xid, children: &[Xid]) {
        std::fs::create_dir_all(twophase_dir(dir)).unwrap();
        recreate_state_file(dir, xid, &sample_content(xid, children)).unwrap();
    }

    #[test]
    fn state_file_name_filter() {
        assert!(is_state_file_name("0000000A"));
        assert!(is_state_file_name("FFFFFFFE"));
        assert!(!is_state_file_name("0000000a"));
        assert!(!is_state_file_name("0000000"));
        assert!(!is_state_file_name("000000001"));
        assert!(!is_state_file_name("0000000G"));
    }

    #[test]
    fn header_is_maxaligned() {
        assert_eq!(size_of::<StateFileHeader>(), 232);
        assert_eq!(size_of::<RecordHeader>(), 8);
    }

    #[test]
    fn round_trip_through_recreate_and_read() {
        let dir = tempdir().unwrap();
        write_via_recreate(dir.path(), 0x1C, &[0x1D, 0x1E]);

        let buf = read_state_file(dir.path(), 0x1C).expect("file should validate");
        let parsed = parse_state_file(&buf).unwrap();

        assert_eq!(parsed.header.xid, 0x1C);
        assert_eq!(parsed.header.gid_str(), "test-gid");
        assert_eq!(parsed.children, vec![0x1D, 0x1E]);
        assert_eq!(parsed.commit_drops, vec![RelFileId::new(1, 77)]);
        assert!(parsed.abort_drops.is_empty());
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let dir = tempdir().unwrap();
        write_via_recreate(dir.path(), 0x2A, &[]);

        let path = state_file_path(dir.path(), 0x2A);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(read_state_file(dir.path(), 0x2A).is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        write_via_recreate(dir.path(), 0x2B, &[]);

        let path = state_file_path(dir.path(), 0x2B);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(read_state_file(dir.path(), 0x2B).is_none());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        write_via_recreate(dir.path(), 0x2C, &[]);

        let path = state_file_path(dir.path(), 0x2C);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - CRC_SIZE]).unwrap();

        assert!(read_state_file(dir.path(), 0x2C).is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(twophase_dir(dir.path())).unwrap();

        assert!(read_state_file(dir.path(), 0x99).is_none());
    }

    #[test]
    fn process_records_dispatches_payload_and_stops_at_sentinel() {
        let dir = tempdir().unwrap();
        write_via_recreate(dir.path(), 0x30, &[]);
        let buf = read_state_file(dir.path(), 0x30).unwrap();
        let parsed = parse_state_file(&buf).unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let mut table = RmgrTable::new();
        let hits_in = Arc::clone(&hits);
        table.register(
            1,
            None,
            None,
            Some(Arc::new(move |xid, info, payload: &[u8]| {
                assert_eq!(xid, 0x30);
                assert_eq!(info, 3);
                assert_eq!(payload, b"lock payload");
                hits_in.fetch_add(1, Ordering::SeqCst);
            })),
        );

        process_records(&buf, parsed.records_offset, 0x30, table.recover());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_state_file_tolerates_missing_during_replay() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(twophase_dir(dir.path())).unwrap();

        remove_state_file(dir.path(), 0x44, false);
        write_via_recreate(dir.path(), 0x44, &[]);
        remove_state_file(dir.path(), 0x44, true);

        assert!(!state_file_path(dir.path(), 0x44).exists());
    }
}
