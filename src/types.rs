//! # Core Identifier Types
//!
//! Identifiers shared across the two-phase commit subsystem.
//!
//! ## Transaction Identifiers
//!
//! Transaction IDs (`Xid`) are 32-bit monotonically increasing integers
//! assigned by the server. They double as state-file names (eight uppercase
//! hex digits), which is why they are not 64-bit.
//!
//! Special values:
//! - `Xid = 0` (`INVALID_XID`): no transaction; an unlocked slot
//!
//! XIDs compare by plain integer order. A state file whose XID is at or past
//! the next-XID watermark is from a discarded timeline and is removed during
//! the startup scan rather than loaded.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::REL_BASE_DIR;
use std::path::{Path, PathBuf};

/// Server-assigned transaction identifier.
pub type Xid = u32;

/// The null transaction identifier. An unlocked `locking_xid` field holds
/// this value.
pub const INVALID_XID: Xid = 0;

/// Database identifier.
pub type DbId = u32;

/// Authenticated-user identifier.
pub type UserId = u32;

/// WAL position, a byte offset into the log. `flush(lsn)` guarantees every
/// record ending at or before `lsn` is on disk.
pub type Lsn = u64;

/// Identifier of a physical relation file, carried in the commit-drop and
/// abort-drop lists of a state file. Written to disk verbatim, so the layout
/// is fixed.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelFileId {
    pub database: DbId,
    pub relation: u32,
}

impl RelFileId {
    pub fn new(database: DbId, relation: u32) -> Self {
        Self { database, relation }
    }

    /// Path of the physical file under the data directory.
    pub fn path(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join(REL_BASE_DIR)
            .join(self.database.to_string())
            .join(self.relation.to_string())
    }
}

/// Identity of the backend session driving an operation. The original system
/// kept these as process globals; callers here pass them explicitly.
#[derive(Debug, Clone, Copy)]
pub struct BackendContext {
    /// Top-level XID of the backend's current transaction.
    pub xid: Xid,
    /// Database the backend is connected to.
    pub database: DbId,
    /// Authenticated user driving the operation.
    pub user: UserId,
    /// Superusers may finish any prepared transaction regardless of owner.
    pub superuser: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_file_id_is_8_bytes() {
        assert_eq!(size_of::<RelFileId>(), 8);
    }

    #[test]
    fn rel_file_path_nests_database_then_relation() {
        let rel = RelFileId::new(5, 1234);
        let path = rel.path(Path::new("/data"));
        assert_eq!(path, Path::new("/data/base/5/1234"));
    }
}
