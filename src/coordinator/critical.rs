//! # Critical Sections
//!
//! A critical section covers the span where the WAL's view of a transaction
//! and the on-disk state diverge on purpose: between the WAL insert and the
//! write that brings the disk back into agreement. An I/O failure in that
//! span cannot be rolled back — the WAL record is already durable — so the
//! only consistent recovery is WAL replay after a restart.
//!
//! `critical_section` encodes that: either the body completes, or the
//! process dies.

use tracing::error;

use crate::error::Result;

/// Run `body`; any error escalates to a process-level fatal exit.
pub(crate) fn critical_section<T>(what: &str, body: impl FnOnce() -> Result<T>) -> T {
    match body() {
        Ok(value) => value,
        Err(err) => {
            error!(%err, what, "fatal error inside critical section; restart and WAL replay required");
            std::process::abort();
        }
    }
}

/// Unconditional fatal exit for states that only WAL replay can untangle.
pub(crate) fn fatal(message: &str) -> ! {
    error!(message, "fatal two-phase state; restart and WAL replay required");
    std::process::abort();
}
