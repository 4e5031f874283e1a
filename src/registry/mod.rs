//! # Prepared-Transaction Registry
//!
//! A fixed-capacity table of global transactions, one slot per transaction
//! that is prepared or attempting to become prepared. The registry is the
//! in-memory half of two-phase commit; the state files under `pg_twophase/`
//! are the durable half.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! ┌──────────┐ reserve() ┌──────────────────┐ mark_prepared() ┌─────────┐
//! │ freelist │ ────────> │ valid = false    │ ──────────────> │ valid = │
//! │          │           │ locking_xid = me │                 │ true    │
//! └──────────┘           └──────────────────┘                 └─────────┘
//!      ▲                        │                                  │
//!      │   reaped by next       │ preparing backend dies           │
//!      │   reserve() sweep  <───┘                                  │
//!      │                                                           │
//!      └────────────────────── remove() after COMMIT/ROLLBACK <────┘
//! ```
//!
//! A slot that is `valid = false` with an inactive `locking_xid` is
//! definitively dead (its preparing backend failed between reservation and
//! completion) and is reaped by the sweep at the start of every `reserve`.
//!
//! ## Locking
//!
//! One registry-wide `RwLock` protects all slot state. It is held only for
//! the short slot-maintenance operations in this module, never across I/O,
//! WAL activity, or callbacks. Activity checks against the participant
//! registry take that registry's own lock; the participant registry never
//! takes the slot lock, so the ordering is acyclic.
//!
//! ## Why a linear array
//!
//! Capacity is small (default 50) and prepare/finish are rare next to
//! ordinary transactions, so linear scans beat any clever indexing. The
//! freelist is intrusive — a `next_free` index per slot plus a `free_head` —
//! keeping allocate and free at O(1) with no separate allocation.

mod participant;

pub use participant::{
    DummyParticipant, ParticipantKind, ParticipantRegistry, TransactionParticipant,
};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::config::GID_SIZE;
use crate::error::{Result, TwoPhaseError};
use crate::types::{BackendContext, DbId, UserId, Xid, INVALID_XID};

const INVALID_SLOT: u32 = u32::MAX;

/// One registry slot: a global transaction that is prepared or preparing.
#[derive(Debug)]
struct GxactSlot {
    /// Dummy participant inserted into the participant registry once the
    /// transaction is fully prepared. Holds the XID, database and the
    /// subtransaction cache.
    participant: DummyParticipant,
    /// User that executed the transaction.
    owner: UserId,
    /// Top-level XID of the backend currently driving prepare, commit or
    /// rollback on this entry; `INVALID_XID` means unlocked.
    locking_xid: Xid,
    /// False between slot reservation and successful prepare completion.
    valid: bool,
    /// The client-chosen global identifier.
    gid: String,
    /// Intrusive freelist link.
    next_free: u32,
}

impl GxactSlot {
    fn unused() -> Self {
        Self {
            participant: DummyParticipant::new(INVALID_XID, 0),
            owner: 0,
            locking_xid: INVALID_XID,
            valid: false,
            gid: String::new(),
            next_free: INVALID_SLOT,
        }
    }
}

struct RegistryState {
    slots: Box<[GxactSlot]>,
    /// Indices of in-use slots, compacted on removal by swapping with the
    /// last element.
    used: Vec<u32>,
    free_head: u32,
}

/// Opaque handle to a registry slot, returned by `reserve` and
/// `lock_for_finish`.
#[derive(Debug, Clone, Copy)]
pub struct GxactHandle {
    slot: u32,
    /// The slot's top-level XID at hand-out time, so callers need not
    /// re-lock the registry just to learn it.
    pub xid: Xid,
}

/// A copy of one slot's externally visible state, as produced by
/// [`PreparedRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct GxactSnapshot {
    pub xid: Xid,
    pub gid: String,
    pub owner: UserId,
    pub database: DbId,
    pub valid: bool,
}

/// The shared registry of prepared transactions.
pub struct PreparedRegistry {
    state: RwLock<RegistryState>,
    participants: Arc<ParticipantRegistry>,
    /// Single-entry cache for [`dummy_participant_for`]: commit, abort and
    /// recovery ask for the same XID repeatedly.
    dummy_cache: Mutex<Option<(Xid, DummyParticipant)>>,
}

impl PreparedRegistry {
    pub fn new(capacity: usize, participants: Arc<ParticipantRegistry>) -> Self {
        // Chain every slot onto the freelist: slot i links to i + 1.
        let mut slots: Vec<GxactSlot> = (0..capacity).map(|_| GxactSlot::unused()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            slot.next_free = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                INVALID_SLOT
            };
        }
        let free_head = if capacity > 0 { 0 } else { INVALID_SLOT };

        Self {
            state: RwLock::new(RegistryState {
                slots: slots.into_boxed_slice(),
                used: Vec::with_capacity(capacity),
                free_head,
            }),
            participants,
            dummy_cache: Mutex::new(None),
        }
    }

    /// Reserve the GID for a transaction about to prepare (or being
    /// re-materialized during recovery).
    ///
    /// Sweeps out slots whose prepare died, rejects duplicate GIDs, pops a
    /// slot from the freelist and initializes it with `valid = false` and
    /// `locking_xid = xid`.
    pub fn reserve(&self, xid: Xid, database: DbId, gid: &str, owner: UserId) -> Result<GxactHandle> {
        if gid.len() >= GID_SIZE {
            return Err(TwoPhaseError::GidTooLong(gid.to_owned()));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;

        // First, reap any reservations whose preparing backend died; partly
        // so their GIDs stop counting as reserved, partly so we don't fail
        // on out-of-slots unnecessarily.
        let mut i = 0;
        while i < state.used.len() {
            let slot_idx = state.used[i] as usize;
            let slot = &state.slots[slot_idx];
            if !slot.valid && !self.participants.xid_is_active(slot.locking_xid) {
                state.used.swap_remove(i);
                state.slots[slot_idx].next_free = state.free_head;
                state.free_head = slot_idx as u32;
                // The swapped-in entry now sits at i; rescan it.
            } else {
                i += 1;
            }
        }

        // GID collision check covers every remaining entry, valid or not:
        // a not-yet-valid entry with an active locking_xid is a concurrent
        // prepare of the same GID.
        for &slot_idx in &state.used {
            if state.slots[slot_idx as usize].gid == gid {
                return Err(TwoPhaseError::DuplicateGid(gid.to_owned()));
            }
        }

        if state.free_head == INVALID_SLOT {
            return Err(TwoPhaseError::OutOfSlots {
                max: state.slots.len(),
            });
        }
        let slot_idx = state.free_head;
        state.free_head = state.slots[slot_idx as usize].next_free;

        let slot = &mut state.slots[slot_idx as usize];
        slot.participant = DummyParticipant::new(xid, database);
        slot.owner = owner;
        slot.locking_xid = xid;
        slot.valid = false;
        slot.gid.clear();
        slot.gid.push_str(gid);
        slot.next_free = INVALID_SLOT;

        debug_assert!(state.used.len() < state.slots.len());
        state.used.push(slot_idx);

        Ok(GxactHandle { slot: slot_idx, xid })
    }

    /// Copy the subtransaction XIDs into the slot's participant cache.
    /// Must run before [`mark_prepared`](Self::mark_prepared), while the
    /// slot is still invisible to finish operations.
    pub fn load_subxact_data(&self, handle: GxactHandle, children: &[Xid]) {
        let mut state = self.state.write();
        let slot = &mut state.slots[handle.slot as usize];
        debug_assert!(!slot.valid);
        slot.participant.load_subxacts(children);
    }

    /// Promote a reserved slot to fully prepared and insert its dummy
    /// participant into the participant registry, which keeps the XID
    /// in-progress for concurrent readers.
    pub fn mark_prepared(&self, handle: GxactHandle) {
        let dummy = {
            let mut state = self.state.write();
            let slot = &mut state.slots[handle.slot as usize];
            debug_assert!(!slot.valid);
            slot.valid = true;
            slot.participant.clone()
        };

        // Outside the registry lock: the participant registry has its own.
        self.participants.add(&dummy, ParticipantKind::PreparedDummy);
    }

    /// Locate a prepared transaction by GID and lock it for COMMIT PREPARED
    /// or ROLLBACK PREPARED by stamping the caller's XID into `locking_xid`.
    ///
    /// Contract for contended slots: a `valid` entry whose `locking_xid` is
    /// still active fails `Busy`; one whose `locking_xid` is inactive (the
    /// previous driver died between lock and finish) is definitively
    /// claimable and is silently re-locked by the caller.
    pub fn lock_for_finish(&self, gid: &str, backend: &BackendContext) -> Result<GxactHandle> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let found = state
            .used
            .iter()
            .map(|&idx| idx as usize)
            .find(|&idx| state.slots[idx].valid && state.slots[idx].gid == gid);

        let Some(slot_idx) = found else {
            return Err(TwoPhaseError::NoSuchGid(gid.to_owned()));
        };

        let locking_xid = state.slots[slot_idx].locking_xid;
        if locking_xid != INVALID_XID {
            if self.participants.xid_is_active(locking_xid) {
                return Err(TwoPhaseError::Busy(gid.to_owned()));
            }
            state.slots[slot_idx].locking_xid = INVALID_XID;
        }

        if backend.user != state.slots[slot_idx].owner && !backend.superuser {
            return Err(TwoPhaseError::PermissionDenied);
        }

        let slot = &mut state.slots[slot_idx];
        slot.locking_xid = backend.xid;

        Ok(GxactHandle {
            slot: slot_idx as u32,
            xid: slot.participant.xid,
        })
    }

    /// Drop the transaction's `valid` flag so the slot reads as dead if a
    /// later finish step fails; it stays locked by the finishing XID until
    /// [`remove`](Self::remove).
    pub fn clear_valid(&self, handle: GxactHandle) {
        let mut state = self.state.write();
        state.slots[handle.slot as usize].valid = false;
    }

    /// Return a slot to the freelist, compacting the used array.
    pub fn remove(&self, handle: GxactHandle) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(pos) = state.used.iter().position(|&idx| idx == handle.slot) else {
            return Err(TwoPhaseError::Internal(format!(
                "slot {} not found in prepared-transaction array",
                handle.slot
            )));
        };
        state.used.swap_remove(pos);
        state.slots[handle.slot as usize].next_free = state.free_head;
        state.free_head = handle.slot;
        drop(guard);

        let mut cache = self.dummy_cache.lock();
        if cache.as_ref().is_some_and(|(xid, _)| *xid == handle.xid) {
            *cache = None;
        }

        Ok(())
    }

    /// The GID stored in a slot. Used by the prepare path when assembling
    /// the state-file header.
    pub(crate) fn gid_of(&self, handle: GxactHandle) -> String {
        let state = self.state.read();
        state.slots[handle.slot as usize].gid.clone()
    }

    /// Copy every used entry, valid or not, so the lock is released before
    /// results are streamed anywhere. Callers wanting only fully prepared
    /// transactions filter on `valid`.
    pub fn snapshot(&self) -> Vec<GxactSnapshot> {
        let state = self.state.read();
        state
            .used
            .iter()
            .map(|&idx| {
                let slot = &state.slots[idx as usize];
                GxactSnapshot {
                    xid: slot.participant.xid,
                    gid: slot.gid.clone(),
                    owner: slot.owner,
                    database: slot.participant.database,
                    valid: slot.valid,
                }
            })
            .collect()
    }

    /// The dummy participant representing a prepared transaction, looked up
    /// by XID. Commit, abort and recovery ask for the same XID repeatedly,
    /// so the last answer is cached.
    pub fn dummy_participant_for(&self, xid: Xid) -> Result<DummyParticipant> {
        let mut cache = self.dummy_cache.lock();
        if let Some((cached_xid, participant)) = cache.as_ref() {
            if *cached_xid == xid {
                return Ok(participant.clone());
            }
        }

        let state = self.state.read();
        let found = state
            .used
            .iter()
            .map(|&idx| &state.slots[idx as usize])
            .find(|slot| slot.participant.xid == xid)
            .map(|slot| slot.participant.clone());
        drop(state);

        match found {
            Some(participant) => {
                *cache = Some((xid, participant.clone()));
                Ok(participant)
            }
            None => Err(TwoPhaseError::Internal(format!(
                "no prepared-transaction participant for xid {xid}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(xid: Xid, user: UserId) -> BackendContext {
        BackendContext {
            xid,
            database: 1,
            user,
            superuser: false,
        }
    }

    fn registry(capacity: usize) -> (PreparedRegistry, Arc<ParticipantRegistry>) {
        let participants = Arc::new(ParticipantRegistry::new());
        (
            PreparedRegistry::new(capacity, Arc::clone(&participants)),
            participants,
        )
    }

    #[test]
    fn reserve_then_mark_prepared_is_visible_in_snapshot() {
        let (registry, _) = registry(4);

        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].xid, 10);
        assert_eq!(snap[0].gid, "g1");
        assert!(snap[0].valid);
    }

    #[test]
    fn duplicate_gid_is_rejected_while_reserver_is_active() {
        let (registry, participants) = registry(4);
        participants.begin_backend(10, 1);

        registry.reserve(10, 1, "g1", 100).unwrap();
        let err = registry.reserve(11, 1, "g1", 100).unwrap_err();

        assert!(matches!(err, TwoPhaseError::DuplicateGid(_)));
    }

    #[test]
    fn duplicate_gid_is_rejected_after_prepare_completes() {
        let (registry, _) = registry(4);

        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);
        let err = registry.reserve(11, 1, "g1", 100).unwrap_err();

        assert!(matches!(err, TwoPhaseError::DuplicateGid(_)));
    }

    #[test]
    fn dead_reservation_is_reaped_and_gid_becomes_available() {
        let (registry, participants) = registry(4);
        participants.begin_backend(10, 1);
        registry.reserve(10, 1, "g1", 100).unwrap();

        // The preparing backend dies before mark_prepared.
        participants.end_backend(10);

        let handle = registry.reserve(11, 1, "g1", 100).unwrap();
        assert_eq!(handle.xid, 11);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn gid_at_limit_is_rejected() {
        let (registry, _) = registry(4);
        let gid = "x".repeat(GID_SIZE);

        let err = registry.reserve(10, 1, &gid, 100).unwrap_err();

        assert!(matches!(err, TwoPhaseError::GidTooLong(_)));
    }

    #[test]
    fn gid_one_under_limit_is_accepted() {
        let (registry, _) = registry(4);
        let gid = "x".repeat(GID_SIZE - 1);

        registry.reserve(10, 1, &gid, 100).unwrap();
    }

    #[test]
    fn out_of_slots_reports_capacity() {
        let (registry, _) = registry(2);
        let h1 = registry.reserve(10, 1, "g1", 100).unwrap();
        let h2 = registry.reserve(11, 1, "g2", 100).unwrap();
        registry.mark_prepared(h1);
        registry.mark_prepared(h2);

        let err = registry.reserve(12, 1, "g3", 100).unwrap_err();

        assert!(matches!(err, TwoPhaseError::OutOfSlots { max: 2 }));
    }

    #[test]
    fn lock_for_finish_unknown_gid_fails() {
        let (registry, _) = registry(4);

        let err = registry
            .lock_for_finish("missing", &backend(20, 100))
            .unwrap_err();

        assert!(matches!(err, TwoPhaseError::NoSuchGid(_)));
    }

    #[test]
    fn lock_for_finish_ignores_not_yet_valid_entries() {
        let (registry, participants) = registry(4);
        participants.begin_backend(10, 1);
        registry.reserve(10, 1, "g1", 100).unwrap();

        let err = registry
            .lock_for_finish("g1", &backend(20, 100))
            .unwrap_err();

        assert!(matches!(err, TwoPhaseError::NoSuchGid(_)));
    }

    #[test]
    fn lock_for_finish_busy_while_driver_active() {
        let (registry, participants) = registry(4);
        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);

        participants.begin_backend(20, 1);
        registry.lock_for_finish("g1", &backend(20, 100)).unwrap();

        let err = registry
            .lock_for_finish("g1", &backend(21, 100))
            .unwrap_err();
        assert!(matches!(err, TwoPhaseError::Busy(_)));
    }

    #[test]
    fn lock_for_finish_steals_stale_lock_of_dead_driver() {
        let (registry, participants) = registry(4);
        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);

        participants.begin_backend(20, 1);
        registry.lock_for_finish("g1", &backend(20, 100)).unwrap();
        participants.end_backend(20);

        let handle = registry.lock_for_finish("g1", &backend(21, 100)).unwrap();
        assert_eq!(handle.xid, 10);
    }

    #[test]
    fn lock_for_finish_requires_owner_or_superuser() {
        let (registry, _) = registry(4);
        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);

        let err = registry
            .lock_for_finish("g1", &backend(20, 999))
            .unwrap_err();
        assert!(matches!(err, TwoPhaseError::PermissionDenied));

        let superuser = BackendContext {
            xid: 20,
            database: 1,
            user: 999,
            superuser: true,
        };
        registry.lock_for_finish("g1", &superuser).unwrap();
    }

    #[test]
    fn remove_returns_slot_to_freelist() {
        let (registry, _) = registry(1);
        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.mark_prepared(handle);

        registry.remove(handle).unwrap();

        assert!(registry.is_empty());
        registry.reserve(11, 1, "g2", 100).unwrap();
    }

    #[test]
    fn freelist_survives_interleaved_reserve_and_remove() {
        let (registry, _) = registry(3);

        let mut handles = Vec::new();
        for round in 0..5u32 {
            for k in 0..3u32 {
                let xid = round * 10 + k + 1;
                let gid = format!("g{xid}");
                let h = registry.reserve(xid, 1, &gid, 100).unwrap();
                registry.mark_prepared(h);
                handles.push(h);
            }
            assert!(matches!(
                registry.reserve(999, 1, "overflow", 100).unwrap_err(),
                TwoPhaseError::OutOfSlots { .. }
            ));
            // Remove in a different order than insertion.
            registry.remove(handles.pop().unwrap()).unwrap();
            registry.remove(handles.remove(0)).unwrap();
            registry.remove(handles.pop().unwrap()).unwrap();
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn snapshot_includes_invalid_entries() {
        let (registry, participants) = registry(4);
        participants.begin_backend(10, 1);
        registry.reserve(10, 1, "g1", 100).unwrap();

        let snap = registry.snapshot();

        assert_eq!(snap.len(), 1);
        assert!(!snap[0].valid);
    }

    #[test]
    fn dummy_participant_lookup_is_cached() {
        let (registry, _) = registry(4);
        let handle = registry.reserve(10, 1, "g1", 100).unwrap();
        registry.load_subxact_data(handle, &[11, 12]);
        registry.mark_prepared(handle);

        let first = registry.dummy_participant_for(10).unwrap();
        let second = registry.dummy_participant_for(10).unwrap();

        assert_eq!(first.subxact_ids(), &[11, 12]);
        assert_eq!(second.subxact_ids(), &[11, 12]);
        assert!(registry.dummy_participant_for(99).is_err());
    }
}
