//! # Error Types
//!
//! The subsystem's error taxonomy. User-visible failures carry enough
//! context for the SQL layer to map them onto its own error codes; I/O
//! failures outside a critical section surface as [`TwoPhaseError::Io`],
//! while I/O failures inside one never return at all (see
//! `coordinator::critical_section`).

use crate::types::Xid;

pub type Result<T> = std::result::Result<T, TwoPhaseError>;

#[derive(Debug, thiserror::Error)]
pub enum TwoPhaseError {
    #[error("global transaction identifier \"{0}\" is too long")]
    GidTooLong(String),

    #[error("global transaction identifier \"{0}\" is already in use")]
    DuplicateGid(String),

    #[error("maximum number of prepared transactions reached; increase max_prepared_xacts (currently {max})")]
    OutOfSlots { max: usize },

    #[error("prepared transaction with gid \"{0}\" does not exist")]
    NoSuchGid(String),

    #[error("prepared transaction with gid \"{0}\" is busy")]
    Busy(String),

    #[error("permission denied to finish prepared transaction; must be superuser or the user that prepared it")]
    PermissionDenied,

    #[error("two-phase state file for transaction {xid} is corrupt")]
    Corrupt { xid: Xid },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TwoPhaseError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
