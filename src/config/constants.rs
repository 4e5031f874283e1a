//! # Configuration Constants
//!
//! All numeric configuration values for the two-phase commit subsystem,
//! grouped by functional area. Constants that depend on each other are
//! co-located and their relationships enforced through compile-time
//! assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! MAX_ALIGN (8 bytes)
//!       │
//!       ├─> every state-file segment is padded to a MAX_ALIGN multiple
//!       │
//!       ├─> size_of::<StateFileHeader>() must be a MAX_ALIGN multiple
//!       │     (the header is the first segment; if it were not aligned,
//!       │      the subxact array following it would be misaligned)
//!       │
//!       └─> size_of::<RecordHeader>() must be a MAX_ALIGN multiple
//!
//! GID_SIZE (200 bytes)
//!       │
//!       └─> fixed width of the GID field in StateFileHeader, including
//!           the NUL terminator; client GIDs are limited to GID_SIZE - 1
//!
//! MIN_STATE_FILE_SIZE / MAX_STATE_FILE_SIZE
//!       │
//!       └─> validation bounds in the state-file reader; files outside
//!           this range are treated as corrupt
//! ```
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{GID_SIZE, MAX_ALIGN};
//! ```

// ============================================================================
// REGISTRY CONFIGURATION
// ============================================================================

/// Default capacity of the prepared-transaction registry.
/// Deliberately small: prepared transactions are expected to be short-lived
/// and administrator-resolved when they are not.
pub const DEFAULT_MAX_PREPARED_XACTS: usize = 50;

/// Maximum number of subtransaction XIDs cached in a participant entry.
/// Beyond this the participant's overflow flag is set and visibility checks
/// fall back to the subtransaction parent map.
pub const MAX_CACHED_SUBXIDS: usize = 64;

// ============================================================================
// STATE FILE FORMAT
// These define the on-disk layout and must never change for existing data
// ============================================================================

/// Format identifier in the first four bytes of every state file.
pub const STATE_FILE_MAGIC: u32 = 0x57F9_4530;

/// Fixed width of the GID field in the state-file header, including the
/// NUL terminator. Client-supplied GIDs are limited to `GID_SIZE - 1` bytes.
pub const GID_SIZE: usize = 200;

/// Alignment unit for state-file segments. Every segment except the trailing
/// CRC starts on a MAX_ALIGN boundary.
pub const MAX_ALIGN: usize = 8;

/// Upper bound on a plausible state file. Larger files are treated as
/// corrupt rather than risking an enormous allocation.
pub const MAX_STATE_FILE_SIZE: u64 = 10_000_000;

/// Round `len` up to the next MAX_ALIGN multiple.
#[inline]
pub const fn max_align(len: usize) -> usize {
    (len + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

// ============================================================================
// ON-DISK LAYOUT
// ============================================================================

/// Directory under the data directory holding one state file per prepared
/// transaction, named by the transaction's XID as eight uppercase hex digits.
pub const TWOPHASE_DIR: &str = "pg_twophase";

/// Directory under the data directory holding the write-ahead log.
pub const WAL_DIR: &str = "wal";

/// Directory prefix for physical relation files referenced by drop lists.
pub const REL_BASE_DIR: &str = "base";

const _: () = assert!(
    MAX_ALIGN.is_power_of_two(),
    "MAX_ALIGN must be a power of two for max_align() to round correctly"
);

const _: () = assert!(
    GID_SIZE % 4 == 0,
    "GID_SIZE must keep StateFileHeader free of implicit padding"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_align_rounds_up_to_eight() {
        assert_eq!(max_align(0), 0);
        assert_eq!(max_align(1), 8);
        assert_eq!(max_align(7), 8);
        assert_eq!(max_align(8), 8);
        assert_eq!(max_align(9), 16);
        assert_eq!(max_align(232), 232);
    }
}
