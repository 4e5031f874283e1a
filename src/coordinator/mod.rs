//! # Two-Phase Commit Coordinator
//!
//! The top-level API tying the subsystem together: the prepare path with its
//! durable handoff, COMMIT PREPARED / ROLLBACK PREPARED, and the startup
//! recovery scans. One [`TwoPhaseCoordinator`] owns the data directory and
//! every collaborator — registry, participant table, WAL, commit log,
//! subtransaction map, resource-manager callbacks.
//!
//! ## The Durable Handoff
//!
//! PREPARE must leave the system in one of exactly two crash states: a WAL
//! PREPARE record paired with a valid state file, or neither. The ordering
//! that guarantees it:
//!
//! ```text
//! 1. create state file (O_CREAT|O_EXCL), stream contents, CRC as we go
//! 2. write a deliberately inverted CRC, fsync          ── out-of-space and
//!                                                         most I/O errors
//!                                                         surface here
//! 3. seek back over the CRC slot
//! ┌──────────────── critical section ────────────────┐
//! │ 4. block checkpoint start (shared lock)           │
//! │ 5. WAL-insert the PREPARE record, WAL-flush       │
//! │ 6. overwrite with the correct CRC, fsync, close   │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! A crash before 5 leaves a bogus-CRC file and no WAL record: the startup
//! scan discards the file and the transaction never prepared. A crash
//! between 5 and 6 leaves a WAL record and an invalid file: replay
//! recreates the file from the record's payload. A crash after 6 leaves
//! both valid. Holding the checkpoint-start lock keeps a checkpoint from
//! completing between 5 and 6, which would let replay begin after the
//! PREPARE record and miss it.
//!
//! ## Finish Ordering
//!
//! COMMIT PREPARED and ROLLBACK PREPARED run strictly in this order: WAL
//! record, commit-log update (parent before children), dummy-participant
//! removal, post-commit/post-abort callbacks, physical file drops, state
//! file removal, slot release. Each step only destroys information the
//! steps before it have made redundant.
//!
//! ## Startup
//!
//! [`startup`](TwoPhaseCoordinator::startup) runs WAL replay, then the
//! prescan pass (discard future and corrupt files, advance the next-XID
//! watermark past subtransaction XIDs), then the recovery pass
//! (re-materialize each surviving file into the registry and hand each
//! resource manager its records back).

mod critical;

use critical::{critical_section, fatal};

use parking_lot::RwLock;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use zerocopy::IntoBytes;

use crate::clog::CommitLog;
use crate::config::TwoPhaseConfig;
use crate::error::{Result, TwoPhaseError};
use crate::registry::{GxactHandle, ParticipantKind, ParticipantRegistry, PreparedRegistry};
use crate::rmgr::{RmId, RmgrTable, TwoPhaseCallback};
use crate::statefile::{self, StateFileBuilder, StateFileHeader, CRC_SIZE};
use crate::subtrans::SubtransMap;
use crate::types::{BackendContext, DbId, RelFileId, UserId, Xid};
use crate::wal::{
    decode_finish_payload, RecordKind, Wal, XlFinishPrepared, WAL_FLAG_NO_TRAN,
};

/// Everything a transaction must persist besides resource-manager records:
/// its committed subtransactions and the physical files whose fate depends
/// on the outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareData<'a> {
    pub children: &'a [Xid],
    pub commit_drops: &'a [RelFileId],
    pub abort_drops: &'a [RelFileId],
}

/// One resource-manager record to be carried in the state file.
#[derive(Debug, Clone, Copy)]
pub struct RmgrStateRecord<'a> {
    pub rmid: RmId,
    pub info: u16,
    pub payload: &'a [u8],
}

/// An in-flight prepare: the reserved slot plus the accumulating state-file
/// chain. Dropped without [`TwoPhaseCoordinator::end_prepare`], the
/// reservation is reaped once its backend stops being active.
pub struct Prepare {
    gxact: GxactHandle,
    builder: StateFileBuilder,
}

impl Prepare {
    /// Append one resource-manager record to the state file under
    /// construction.
    pub fn register_record(&mut self, rmid: RmId, info: u16, payload: &[u8]) {
        self.builder.register_record(rmid, info, payload);
    }

    pub fn gxact(&self) -> GxactHandle {
        self.gxact
    }
}

/// One row of the prepared-transactions view.
#[derive(Debug, Clone)]
pub struct PreparedXact {
    pub xid: Xid,
    pub gid: String,
    pub owner: UserId,
    pub database: DbId,
}

/// Commit statistics, mirrored into the server's stats collector.
#[derive(Debug, Default)]
pub struct XactStats {
    commits: AtomicU64,
}

impl XactStats {
    pub(crate) fn count_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

/// What [`TwoPhaseCoordinator::startup`] found and did.
#[derive(Debug, Clone, Copy)]
pub struct StartupSummary {
    /// WAL records replayed.
    pub wal_records: u32,
    /// Oldest XID among surviving prepared transactions, or the next-XID
    /// watermark when there are none. Seeds commit-log and subtransaction
    /// truncation points.
    pub oldest_prepared_xid: Xid,
    /// Prepared transactions re-materialized into the registry.
    pub recovered: u32,
}

pub struct TwoPhaseCoordinator {
    data_dir: PathBuf,
    registry: PreparedRegistry,
    participants: Arc<ParticipantRegistry>,
    wal: Wal,
    clog: CommitLog,
    subtrans: SubtransMap,
    rmgrs: RwLock<RmgrTable>,
    next_xid: AtomicU32,
    stats: XactStats,
}

impl TwoPhaseCoordinator {
    /// Open (or create) the coordinator state under `data_dir`. Call
    /// [`startup`](Self::startup) afterwards to recover any prepared
    /// transactions from a previous run.
    pub fn open(data_dir: impl Into<PathBuf>, config: TwoPhaseConfig) -> Result<Self> {
        let data_dir = data_dir.into();

        let twophase_dir = statefile::twophase_dir(&data_dir);
        fs::create_dir_all(&twophase_dir).map_err(|err| {
            TwoPhaseError::io(
                format!("could not create directory {}", twophase_dir.display()),
                err,
            )
        })?;

        let wal = Wal::open(&data_dir)?;
        let participants = Arc::new(ParticipantRegistry::new());

        Ok(Self {
            data_dir,
            registry: PreparedRegistry::new(config.max_prepared_xacts, Arc::clone(&participants)),
            participants,
            wal,
            clog: CommitLog::new(),
            subtrans: SubtransMap::new(),
            rmgrs: RwLock::new(RmgrTable::new()),
            next_xid: AtomicU32::new(1),
            stats: XactStats::default(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn registry(&self) -> &PreparedRegistry {
        &self.registry
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    pub fn clog(&self) -> &CommitLog {
        &self.clog
    }

    pub fn subtrans(&self) -> &SubtransMap {
        &self.subtrans
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn stats(&self) -> &XactStats {
        &self.stats
    }

    /// Register a resource manager's two-phase callbacks. Expected during
    /// startup, before any recovery or finish can dispatch to them.
    pub fn register_rmgr(
        &self,
        rmid: RmId,
        post_commit: Option<TwoPhaseCallback>,
        post_abort: Option<TwoPhaseCallback>,
        recover: Option<TwoPhaseCallback>,
    ) {
        self.rmgrs
            .write()
            .register(rmid, post_commit, post_abort, recover);
    }

    pub fn next_xid(&self) -> Xid {
        self.next_xid.load(Ordering::SeqCst)
    }

    /// Seed the next-XID watermark. The embedding server calls this after
    /// its own redo has established the highest XID with WAL evidence.
    pub fn set_next_xid(&self, xid: Xid) {
        self.next_xid.store(xid, Ordering::SeqCst);
    }

    /// Hand out the next XID.
    pub fn assign_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    fn advance_next_xid_past(&self, xid: Xid) {
        self.next_xid
            .fetch_max(xid.saturating_add(1), Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // PREPARE path
    // ------------------------------------------------------------------

    /// Reserve a registry slot and the GID for the backend's current
    /// transaction.
    pub fn reserve(&self, backend: &BackendContext, gid: &str) -> Result<GxactHandle> {
        self.registry
            .reserve(backend.xid, backend.database, gid, backend.user)
    }

    /// Begin assembling the state file: header, subtransaction XIDs and the
    /// two drop lists. The children are also cached in the slot's dummy
    /// participant.
    pub fn start_prepare(
        &self,
        gxact: GxactHandle,
        backend: &BackendContext,
        data: &PrepareData<'_>,
    ) -> Prepare {
        debug_assert_eq!(gxact.xid, backend.xid);

        let gid = self.registry.gid_of(gxact);
        let header = StateFileHeader {
            magic: crate::config::STATE_FILE_MAGIC,
            total_len: 0,
            xid: backend.xid,
            database: backend.database,
            owner: backend.user,
            nsubxacts: data.children.len() as u32,
            ncommitrels: data.commit_drops.len() as u32,
            nabortrels: data.abort_drops.len() as u32,
            gid: StateFileHeader::encode_gid(&gid),
        };

        let mut builder = StateFileBuilder::new();
        builder.start(&header, data.children, data.commit_drops, data.abort_drops);
        self.registry.load_subxact_data(gxact, data.children);

        Prepare { gxact, builder }
    }

    /// Make the prepare durable: state file and WAL record, ordered so that
    /// a crash anywhere leaves a recoverable state. See the module notes
    /// for the full ordering argument.
    pub fn end_prepare(&self, mut prepare: Prepare) -> Result<()> {
        let xid = prepare.gxact.xid;
        prepare.builder.finish();

        let path = statefile::state_file_path(&self.data_dir, xid);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(|err| {
            TwoPhaseError::io(
                format!("could not create two-phase state file {}", path.display()),
                err,
            )
        })?;

        let mut digest = statefile::CRC32.digest();
        for segment in prepare.builder.segments() {
            digest.update(segment);
            file.write_all(segment)
                .map_err(|err| TwoPhaseError::io("could not write two-phase state file", err))?;
        }
        let crc = digest.finalize();

        // An inverted, therefore invalid, CRC goes to disk first. The file
        // is then full-length and fsynced: out-of-space and most I/O
        // failures surface here, where failing is still an ordinary error.
        let bogus_crc = !crc;
        file.write_all(&bogus_crc.to_ne_bytes())
            .map_err(|err| TwoPhaseError::io("could not write two-phase state file", err))?;
        file.sync_data()
            .map_err(|err| TwoPhaseError::io("could not fsync two-phase state file", err))?;
        file.seek(SeekFrom::Current(-(CRC_SIZE as i64)))
            .map_err(|err| TwoPhaseError::io("could not seek two-phase state file", err))?;

        let segments: Vec<&[u8]> = prepare.builder.segments().collect();

        // Between the WAL insert and the CRC rewrite the transaction is
        // prepared according to WAL but not according to disk; only WAL
        // replay can repair that, so failures escalate.
        critical_section("completing PREPARE", || {
            let _checkpoint_guard = self.wal.checkpoint_start_shared();

            let lsn = self.wal.append(RecordKind::Prepare, 0, xid, &segments)?;
            self.wal.flush(lsn)?;

            file.write_all(&crc.to_ne_bytes())
                .map_err(|err| TwoPhaseError::io("could not finalize two-phase state file", err))?;
            file.sync_data()
                .map_err(|err| TwoPhaseError::io("could not fsync two-phase state file", err))?;
            Ok(())
        });

        Ok(())
    }

    /// Promote the slot to fully prepared and make its dummy participant
    /// visible. After this returns, the transaction survives any crash.
    pub fn mark_prepared(&self, gxact: GxactHandle) {
        self.registry.mark_prepared(gxact);
    }

    /// The full PREPARE TRANSACTION path: reserve, assemble, persist,
    /// publish.
    pub fn prepare_transaction(
        &self,
        backend: &BackendContext,
        gid: &str,
        data: &PrepareData<'_>,
        records: &[RmgrStateRecord<'_>],
    ) -> Result<()> {
        let gxact = self.reserve(backend, gid)?;
        let mut prepare = self.start_prepare(gxact, backend, data);
        for record in records {
            prepare.register_record(record.rmid, record.info, record.payload);
        }
        self.end_prepare(prepare)?;
        self.mark_prepared(gxact);
        Ok(())
    }

    // ------------------------------------------------------------------
    // FINISH path
    // ------------------------------------------------------------------

    /// COMMIT PREPARED (`is_commit = true`) or ROLLBACK PREPARED.
    pub fn finish_prepared(
        &self,
        gid: &str,
        is_commit: bool,
        backend: &BackendContext,
    ) -> Result<()> {
        // Locking the gxact ensures no two backends finish the same GID at
        // once.
        let gxact = self.registry.lock_for_finish(gid, backend)?;
        let xid = gxact.xid;

        let Some(buf) = statefile::read_state_file(&self.data_dir, xid) else {
            return Err(TwoPhaseError::Corrupt { xid });
        };
        let parsed = statefile::parse_state_file(&buf)?;
        debug_assert_eq!(parsed.header.xid, xid);

        let children = parsed.children.as_slice();
        let rels = if is_commit {
            parsed.commit_drops.as_slice()
        } else {
            parsed.abort_drops.as_slice()
        };

        // Catch a crash that happened partway through a previous commit of
        // this same transaction.
        if !is_commit && self.clog.did_commit(xid) {
            fatal(&format!(
                "cannot abort transaction {xid}, it was already committed"
            ));
        }

        let xl = XlFinishPrepared {
            nrels: rels.len() as u32,
            nsubxacts: children.len() as u32,
        };
        let kind = if is_commit {
            RecordKind::CommitPrepared
        } else {
            RecordKind::AbortPrepared
        };

        critical_section("finishing prepared transaction", || {
            let _checkpoint_guard = self.wal.checkpoint_start_shared();

            let lsn = self.wal.append(
                kind,
                WAL_FLAG_NO_TRAN,
                xid,
                &[xl.as_bytes(), rels.as_bytes(), children.as_bytes()],
            )?;
            self.wal.flush(lsn)?;

            if is_commit {
                // Parent first: no reader may see a committed child under a
                // still-in-progress parent.
                self.clog.set_committed(xid);
                self.clog.commit_tree(children);
            } else {
                self.clog.set_aborted(xid);
                self.clog.abort_tree(children);
            }
            Ok(())
        });

        // The XID stops appearing in-progress.
        self.participants.remove(xid, ParticipantKind::PreparedDummy);

        // If a callback below fails, the slot must read as dead rather than
        // prepared; it stays locked by our XID until removed.
        self.registry.clear_valid(gxact);

        let callbacks = {
            let rmgrs = self.rmgrs.read();
            if is_commit {
                rmgrs.clone_post_commit()
            } else {
                rmgrs.clone_post_abort()
            }
        };
        statefile::process_records(&buf, parsed.records_offset, xid, &callbacks);

        for rel in rels {
            let path = rel.path(&self.data_dir);
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "could not remove relation file");
            }
        }

        self.stats.count_commit();

        statefile::remove_state_file(&self.data_dir, xid, true);
        self.registry.remove(gxact)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup recovery
    // ------------------------------------------------------------------

    /// Replay the WAL from the top: PREPARE records re-materialize their
    /// state files; commit/abort-prepared records settle the commit log and
    /// clean up. Returns the number of records applied.
    pub fn replay_wal(&self) -> Result<u32> {
        let mut reader = self.wal.reader()?;
        let mut applied = 0u32;

        while let Some(record) = reader.next_record() {
            match record.kind {
                RecordKind::Prepare => {
                    self.advance_next_xid_past(record.xid);
                    statefile::recreate_state_file(&self.data_dir, record.xid, &record.payload)?;
                }
                RecordKind::CommitPrepared => {
                    let (rels, children) = decode_finish_payload(&record.payload)?;
                    self.advance_next_xid_past(record.xid);
                    self.clog.set_committed(record.xid);
                    self.clog.commit_tree(&children);
                    for &child in &children {
                        self.advance_next_xid_past(child);
                    }
                    self.redo_drop_rels(&rels);
                    statefile::remove_state_file(&self.data_dir, record.xid, false);
                }
                RecordKind::AbortPrepared => {
                    let (rels, children) = decode_finish_payload(&record.payload)?;
                    self.advance_next_xid_past(record.xid);
                    self.clog.set_aborted(record.xid);
                    self.clog.abort_tree(&children);
                    for &child in &children {
                        self.advance_next_xid_past(child);
                    }
                    self.redo_drop_rels(&rels);
                    statefile::remove_state_file(&self.data_dir, record.xid, false);
                }
            }
            applied += 1;
        }

        Ok(applied)
    }

    fn redo_drop_rels(&self, rels: &[RelFileId]) {
        for rel in rels {
            let path = rel.path(&self.data_dir);
            match fs::remove_file(&path) {
                Ok(()) => {}
                // The drop usually already happened before the crash.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), %err, "could not remove relation file during replay");
                }
            }
        }
    }

    /// First startup pass over `pg_twophase/`: discard files from a
    /// discarded timeline or that fail validation, and advance the next-XID
    /// watermark past every subtransaction XID (subtransaction commits are
    /// not WAL-logged, so files are the only evidence).
    ///
    /// Returns the oldest XID among surviving files, or the watermark when
    /// none survive.
    pub fn prescan(&self) -> Result<Xid> {
        let orig_next_xid = self.next_xid();
        let mut oldest = orig_next_xid;

        for (name, xid) in self.scan_state_files()? {
            if xid >= orig_next_xid {
                warn!(file = %name, "removing future two-phase state file");
                statefile::remove_state_file(&self.data_dir, xid, true);
                continue;
            }

            let Some(buf) = statefile::read_state_file(&self.data_dir, xid) else {
                warn!(file = %name, "removing corrupt two-phase state file");
                statefile::remove_state_file(&self.data_dir, xid, true);
                continue;
            };
            let parsed = match statefile::parse_state_file(&buf) {
                Ok(parsed) if parsed.header.xid == xid => parsed,
                _ => {
                    warn!(file = %name, "removing corrupt two-phase state file");
                    statefile::remove_state_file(&self.data_dir, xid, true);
                    continue;
                }
            };

            if xid < oldest {
                oldest = xid;
            }

            for &subxid in &parsed.children {
                debug_assert!(subxid > xid);
                self.advance_next_xid_past(subxid);
            }
        }

        Ok(oldest)
    }

    /// Second startup pass: re-materialize each surviving state file into
    /// the registry and give every resource manager its records back.
    /// Returns the number of transactions recovered.
    pub fn recover(&self) -> Result<u32> {
        let mut recovered = 0u32;

        for (name, xid) in self.scan_state_files()? {
            // Finished before the crash, but the file outlived the
            // transaction.
            if self.clog.did_commit(xid) || self.clog.did_abort(xid) {
                warn!(file = %name, "removing stale two-phase state file");
                statefile::remove_state_file(&self.data_dir, xid, true);
                continue;
            }

            let Some(buf) = statefile::read_state_file(&self.data_dir, xid) else {
                warn!(file = %name, "removing corrupt two-phase state file");
                statefile::remove_state_file(&self.data_dir, xid, true);
                continue;
            };
            let parsed = match statefile::parse_state_file(&buf) {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(file = %name, "removing corrupt two-phase state file");
                    statefile::remove_state_file(&self.data_dir, xid, true);
                    continue;
                }
            };
            debug_assert_eq!(parsed.header.xid, xid);

            info!(xid, "recovering prepared transaction");

            // The parent map is not preserved across restarts.
            for &child in &parsed.children {
                self.subtrans.set_parent(child, xid);
            }

            let gid = parsed.header.gid_str();
            let gxact = self.registry.reserve(
                parsed.header.xid,
                parsed.header.database,
                &gid,
                parsed.header.owner,
            )?;
            self.registry.load_subxact_data(gxact, &parsed.children);
            self.registry.mark_prepared(gxact);

            let callbacks = self.rmgrs.read().clone_recover();
            statefile::process_records(&buf, parsed.records_offset, xid, &callbacks);

            recovered += 1;
        }

        Ok(recovered)
    }

    /// The crash-restart entry point: WAL replay, then both directory
    /// passes.
    pub fn startup(&self) -> Result<StartupSummary> {
        let wal_records = self.replay_wal()?;
        let oldest_prepared_xid = self.prescan()?;
        let recovered = self.recover()?;
        Ok(StartupSummary {
            wal_records,
            oldest_prepared_xid,
            recovered,
        })
    }

    fn scan_state_files(&self) -> Result<Vec<(String, Xid)>> {
        let dir = statefile::twophase_dir(&self.data_dir);
        let entries = fs::read_dir(&dir).map_err(|err| {
            TwoPhaseError::io(format!("could not open directory {}", dir.display()), err)
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                TwoPhaseError::io(format!("could not read directory {}", dir.display()), err)
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !statefile::is_state_file_name(&name) {
                continue;
            }
            let Ok(xid) = Xid::from_str_radix(&name, 16) else {
                continue;
            };
            files.push((name, xid));
        }
        // Deterministic scan order; the original inherited readdir order.
        files.sort_by_key(|(_, xid)| *xid);
        Ok(files)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// One row per fully prepared transaction, for the server's
    /// prepared-transactions view.
    pub fn prepared_xacts(&self) -> Vec<PreparedXact> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|snap| snap.valid)
            .map(|snap| PreparedXact {
                xid: snap.xid,
                gid: snap.gid,
                owner: snap.owner,
                database: snap.database,
            })
            .collect()
    }
}
