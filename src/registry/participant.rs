//! # Participants
//!
//! Every transaction the rest of the system must treat as in-progress has an
//! entry in the [`ParticipantRegistry`]: live backend sessions while their
//! transaction runs, and a *dummy* participant for each prepared transaction.
//! The dummy keeps the prepared XID visible to concurrent readers (and gives
//! the lock manager something to hang the transaction's locks on) after the
//! preparing backend has moved on.
//!
//! The registry accepts anything implementing [`TransactionParticipant`];
//! a [`crate::registry::PreparedRegistry`] slot offers that interface through
//! its embedded [`DummyParticipant`] rather than by pointer games.

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::config::MAX_CACHED_SUBXIDS;
use crate::types::{DbId, Xid, INVALID_XID};

/// Interface between a transaction record and the participant registry.
pub trait TransactionParticipant {
    fn xid(&self) -> Xid;
    fn database(&self) -> DbId;
    /// Cached subtransaction XIDs. May be incomplete; see
    /// [`subxacts_overflowed`](Self::subxacts_overflowed).
    fn subxact_ids(&self) -> &[Xid];
    /// True when the transaction had more subtransactions than the cache
    /// holds; readers must then consult the subtransaction parent map.
    fn subxacts_overflowed(&self) -> bool;
}

/// The participant record embedded in every prepared-transaction slot.
#[derive(Debug, Clone)]
pub struct DummyParticipant {
    pub(crate) xid: Xid,
    pub(crate) database: DbId,
    pub(crate) subxids: SmallVec<[Xid; MAX_CACHED_SUBXIDS]>,
    pub(crate) overflowed: bool,
}

impl DummyParticipant {
    pub(crate) fn new(xid: Xid, database: DbId) -> Self {
        Self {
            xid,
            database,
            subxids: SmallVec::new(),
            overflowed: false,
        }
    }

    /// Fill the subtransaction cache, capping at [`MAX_CACHED_SUBXIDS`] and
    /// setting the overflow flag when the cap truncates.
    pub(crate) fn load_subxacts(&mut self, children: &[Xid]) {
        self.subxids.clear();
        self.overflowed = children.len() > MAX_CACHED_SUBXIDS;
        let cached = children.len().min(MAX_CACHED_SUBXIDS);
        self.subxids.extend_from_slice(&children[..cached]);
    }
}

impl TransactionParticipant for DummyParticipant {
    fn xid(&self) -> Xid {
        self.xid
    }

    fn database(&self) -> DbId {
        self.database
    }

    fn subxact_ids(&self) -> &[Xid] {
        &self.subxids
    }

    fn subxacts_overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Distinguishes live backend sessions from prepared-transaction dummies.
/// Only live backends count as *active* for slot-reaping purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Backend,
    PreparedDummy,
}

#[derive(Debug, Clone)]
struct ParticipantEntry {
    xid: Xid,
    #[allow(dead_code)]
    database: DbId,
    kind: ParticipantKind,
    subxids: SmallVec<[Xid; MAX_CACHED_SUBXIDS]>,
}

/// Process-wide table of transactions that concurrent readers must consider
/// in-progress.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    entries: RwLock<Vec<ParticipantEntry>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a participant. The entry is a copy of the participant's state;
    /// later mutation of the source does not affect the registry.
    pub fn add(&self, participant: &dyn TransactionParticipant, kind: ParticipantKind) {
        let mut entries = self.entries.write();
        entries.push(ParticipantEntry {
            xid: participant.xid(),
            database: participant.database(),
            kind,
            subxids: SmallVec::from_slice(participant.subxact_ids()),
        });
    }

    /// Register a live backend transaction.
    pub fn begin_backend(&self, xid: Xid, database: DbId) {
        let mut entries = self.entries.write();
        entries.push(ParticipantEntry {
            xid,
            database,
            kind: ParticipantKind::Backend,
            subxids: SmallVec::new(),
        });
    }

    /// Deregister a live backend transaction.
    pub fn end_backend(&self, xid: Xid) {
        self.remove(xid, ParticipantKind::Backend);
    }

    /// Remove the participant with the given XID and kind. The kind matters:
    /// while a transaction is being prepared, its backend entry and its
    /// dummy briefly share an XID. Returns whether an entry was present.
    pub fn remove(&self, xid: Xid, kind: ParticipantKind) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|e| e.kind == kind && e.xid == xid) {
            Some(pos) => {
                entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether a live backend is currently running this XID. Prepared
    /// dummies do not count: a prepared transaction's original backend is
    /// gone, which is exactly what slot reaping needs to detect.
    pub fn xid_is_active(&self, xid: Xid) -> bool {
        if xid == INVALID_XID {
            return false;
        }
        let entries = self.entries.read();
        entries
            .iter()
            .any(|e| e.kind == ParticipantKind::Backend && e.xid == xid)
    }

    /// Whether any participant (backend or prepared dummy) makes this XID
    /// appear in-progress, including cached subtransaction XIDs.
    pub fn xid_is_in_progress(&self, xid: Xid) -> bool {
        if xid == INVALID_XID {
            return false;
        }
        let entries = self.entries.read();
        entries
            .iter()
            .any(|e| e.xid == xid || e.subxids.contains(&xid))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_is_active_until_removed() {
        let registry = ParticipantRegistry::new();

        registry.begin_backend(7, 1);

        assert!(registry.xid_is_active(7));
        registry.end_backend(7);
        assert!(!registry.xid_is_active(7));
    }

    #[test]
    fn prepared_dummy_is_in_progress_but_not_active() {
        let registry = ParticipantRegistry::new();
        let dummy = DummyParticipant::new(9, 1);

        registry.add(&dummy, ParticipantKind::PreparedDummy);

        assert!(registry.xid_is_in_progress(9));
        assert!(!registry.xid_is_active(9));
    }

    #[test]
    fn cached_subxids_count_as_in_progress() {
        let registry = ParticipantRegistry::new();
        let mut dummy = DummyParticipant::new(10, 1);
        dummy.load_subxacts(&[11, 12]);

        registry.add(&dummy, ParticipantKind::PreparedDummy);

        assert!(registry.xid_is_in_progress(11));
        assert!(registry.xid_is_in_progress(12));
        assert!(!registry.xid_is_in_progress(13));
    }

    #[test]
    fn invalid_xid_is_never_active_or_in_progress() {
        let registry = ParticipantRegistry::new();

        assert!(!registry.xid_is_active(INVALID_XID));
        assert!(!registry.xid_is_in_progress(INVALID_XID));
    }

    #[test]
    fn subxact_cache_overflow_sets_flag_and_caps() {
        let children: Vec<Xid> = (100..100 + MAX_CACHED_SUBXIDS as Xid + 5).collect();
        let mut dummy = DummyParticipant::new(50, 1);

        dummy.load_subxacts(&children);

        assert!(dummy.subxacts_overflowed());
        assert_eq!(dummy.subxact_ids().len(), MAX_CACHED_SUBXIDS);
        assert_eq!(dummy.subxact_ids()[0], 100);
    }
}
