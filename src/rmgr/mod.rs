//! # Resource-Manager Callbacks
//!
//! External subsystems (the lock manager is the canonical example) persist
//! recovery state inside a prepared transaction's state file and register
//! callbacks here, indexed by a stable resource-manager id:
//!
//! - `post_commit` — run after COMMIT PREPARED is durable (release locks,
//!   deliver notifications, ...)
//! - `post_abort` — run after ROLLBACK PREPARED is durable
//! - `recover` — run at startup for each re-materialized prepared
//!   transaction (re-acquire locks, ...)
//!
//! Callbacks receive the owning XID, the record's info bits and its raw
//! payload. They are stored as `Arc<dyn Fn>` so embedders can capture their
//! own state; ids are small and fixed, so the tables are plain arrays.

use std::sync::Arc;

use crate::types::Xid;

/// Stable resource-manager identifier, also stored in state-file records.
pub type RmId = u16;

/// Reserved id marking the end of a state file's record stream.
pub const RM_END_ID: RmId = 0;

/// The lock manager's id.
pub const RM_LOCK_ID: RmId = 1;

/// Highest assignable resource-manager id.
pub const RM_MAX_ID: RmId = 10;

/// Size of each callback table.
pub const RM_TABLE_SIZE: usize = RM_MAX_ID as usize + 1;

/// A two-phase callback: `(xid, info, payload)`.
pub type TwoPhaseCallback = Arc<dyn Fn(Xid, u16, &[u8]) + Send + Sync>;

/// The three parallel callback tables.
pub struct RmgrTable {
    post_commit: [Option<TwoPhaseCallback>; RM_TABLE_SIZE],
    post_abort: [Option<TwoPhaseCallback>; RM_TABLE_SIZE],
    recover: [Option<TwoPhaseCallback>; RM_TABLE_SIZE],
}

impl RmgrTable {
    pub fn new() -> Self {
        Self {
            post_commit: std::array::from_fn(|_| None),
            post_abort: std::array::from_fn(|_| None),
            recover: std::array::from_fn(|_| None),
        }
    }

    /// Register the callbacks for one resource manager. Passing `None`
    /// leaves that phase as a no-op for this id.
    ///
    /// # Panics
    ///
    /// Panics when `rmid` is the reserved end sentinel or past
    /// [`RM_MAX_ID`]; registration happens at startup, where a bad id is a
    /// programming error.
    pub fn register(
        &mut self,
        rmid: RmId,
        post_commit: Option<TwoPhaseCallback>,
        post_abort: Option<TwoPhaseCallback>,
        recover: Option<TwoPhaseCallback>,
    ) {
        assert!(rmid != RM_END_ID, "rmid 0 is reserved as the end sentinel");
        assert!(rmid <= RM_MAX_ID, "rmid {rmid} exceeds RM_MAX_ID");
        self.post_commit[rmid as usize] = post_commit;
        self.post_abort[rmid as usize] = post_abort;
        self.recover[rmid as usize] = recover;
    }

    pub fn post_commit(&self) -> &[Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        &self.post_commit
    }

    pub fn post_abort(&self) -> &[Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        &self.post_abort
    }

    pub fn recover(&self) -> &[Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        &self.recover
    }

    /// Clone one table so callbacks can run without holding any lock over
    /// the registration state.
    pub(crate) fn clone_post_commit(&self) -> [Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        self.post_commit.clone()
    }

    pub(crate) fn clone_post_abort(&self) -> [Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        self.post_abort.clone()
    }

    pub(crate) fn clone_recover(&self) -> [Option<TwoPhaseCallback>; RM_TABLE_SIZE] {
        self.recover.clone()
    }
}

impl Default for RmgrTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn registered_callback_is_stored_per_phase() {
        let mut table = RmgrTable::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_in = Arc::clone(&count);

        table.register(
            RM_LOCK_ID,
            Some(Arc::new(move |_, _, _| {
                count_in.fetch_add(1, Ordering::SeqCst);
            })),
            None,
            None,
        );

        let callback = table.post_commit()[RM_LOCK_ID as usize].as_ref().unwrap();
        callback(1, 0, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(table.post_abort()[RM_LOCK_ID as usize].is_none());
        assert!(table.recover()[RM_LOCK_ID as usize].is_none());
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn end_sentinel_id_cannot_be_registered() {
        let mut table = RmgrTable::new();
        table.register(RM_END_ID, None, None, None);
    }
}
