//! # Commit Log
//!
//! Per-XID transaction status, two bits per transaction, packed four to a
//! byte. The commit log answers "did this XID commit or abort?" for every
//! reader in the system.
//!
//! The log is kept in memory and reconstructed from the WAL at startup; the
//! WAL is the durable truth, the commit log a fast materialization of it.
//!
//! ## Ordering contract
//!
//! When a transaction tree commits, the parent must be marked before its
//! children so no concurrent reader ever sees a committed child under a
//! still-in-progress parent. Callers express this by calling
//! [`set_committed`](CommitLog::set_committed) for the parent before
//! [`commit_tree`](CommitLog::commit_tree) for the children.

use parking_lot::RwLock;

use crate::types::Xid;

const STATUSES_PER_BYTE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XidStatus {
    InProgress = 0b00,
    Committed = 0b01,
    Aborted = 0b10,
    SubCommitted = 0b11,
}

impl XidStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Self::Committed,
            0b10 => Self::Aborted,
            0b11 => Self::SubCommitted,
            _ => Self::InProgress,
        }
    }
}

/// In-memory commit log, growing on demand as XIDs are assigned.
#[derive(Debug, Default)]
pub struct CommitLog {
    bytes: RwLock<Vec<u8>>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, xid: Xid) -> XidStatus {
        let bytes = self.bytes.read();
        let index = xid as usize / STATUSES_PER_BYTE;
        match bytes.get(index) {
            Some(byte) => {
                let shift = (xid as usize % STATUSES_PER_BYTE) * 2;
                XidStatus::from_bits(byte >> shift)
            }
            None => XidStatus::InProgress,
        }
    }

    fn set_status(&self, xid: Xid, status: XidStatus) {
        let mut bytes = self.bytes.write();
        let index = xid as usize / STATUSES_PER_BYTE;
        if index >= bytes.len() {
            bytes.resize(index + 1, 0);
        }
        let shift = (xid as usize % STATUSES_PER_BYTE) * 2;
        bytes[index] = (bytes[index] & !(0b11 << shift)) | ((status as u8) << shift);
    }

    pub fn set_committed(&self, xid: Xid) {
        self.set_status(xid, XidStatus::Committed);
    }

    pub fn set_aborted(&self, xid: Xid) {
        self.set_status(xid, XidStatus::Aborted);
    }

    /// Mark a set of subtransactions committed. The parent must already be
    /// committed; see the module notes.
    pub fn commit_tree(&self, children: &[Xid]) {
        for &child in children {
            self.set_status(child, XidStatus::Committed);
        }
    }

    pub fn abort_tree(&self, children: &[Xid]) {
        for &child in children {
            self.set_status(child, XidStatus::Aborted);
        }
    }

    pub fn did_commit(&self, xid: Xid) -> bool {
        self.status(xid) == XidStatus::Committed
    }

    pub fn did_abort(&self, xid: Xid) -> bool {
        self.status(xid) == XidStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_xid_is_in_progress() {
        let clog = CommitLog::new();

        assert_eq!(clog.status(12345), XidStatus::InProgress);
        assert!(!clog.did_commit(12345));
        assert!(!clog.did_abort(12345));
    }

    #[test]
    fn commit_and_abort_are_recorded_independently() {
        let clog = CommitLog::new();

        clog.set_committed(4);
        clog.set_aborted(5);

        assert!(clog.did_commit(4));
        assert!(clog.did_abort(5));
        assert_eq!(clog.status(6), XidStatus::InProgress);
    }

    #[test]
    fn neighbors_in_one_byte_do_not_clobber() {
        let clog = CommitLog::new();

        clog.set_committed(8);
        clog.set_aborted(9);
        clog.set_committed(10);
        clog.set_aborted(11);

        assert!(clog.did_commit(8));
        assert!(clog.did_abort(9));
        assert!(clog.did_commit(10));
        assert!(clog.did_abort(11));
    }

    #[test]
    fn commit_tree_marks_all_children() {
        let clog = CommitLog::new();

        clog.set_committed(20);
        clog.commit_tree(&[21, 22, 23]);

        for xid in 20..=23 {
            assert!(clog.did_commit(xid));
        }
    }
}
