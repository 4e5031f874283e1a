//! # gxact - Durable Two-Phase Commit
//!
//! `gxact` is the two-phase commit coordinator subsystem of an embedded
//! relational database server: the resource-manager side of X/Open-style
//! 2PC. Once `PREPARE TRANSACTION <gid>` returns, the transaction's fate is
//! durable — it survives crashes and restarts, and any later session may
//! finish it with `COMMIT PREPARED` or `ROLLBACK PREPARED`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gxact::{BackendContext, PrepareData, TwoPhaseConfig, TwoPhaseCoordinator};
//!
//! let coordinator = TwoPhaseCoordinator::open("./data", TwoPhaseConfig::default())?;
//! coordinator.startup()?;
//!
//! let backend = BackendContext {
//!     xid: coordinator.assign_xid(),
//!     database: 1,
//!     user: 10,
//!     superuser: false,
//! };
//! coordinator.prepare_transaction(&backend, "order-42", &PrepareData::default(), &[])?;
//!
//! // ... possibly after a crash and restart ...
//! coordinator.finish_prepared("order-42", true, &backend)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        TwoPhaseCoordinator (prepare /        │
//! │         finish / startup recovery)           │
//! ├──────────────────────┬───────────────────────┤
//! │  PreparedRegistry    │  ParticipantRegistry  │
//! │  (gxact slots,       │  (live + dummy        │
//! │   freelist, GIDs)    │   transactions)       │
//! ├──────────────────────┴───────────────────────┤
//! │  StateFileBuilder / state-file reader        │
//! ├──────────────────────────────────────────────┤
//! │  WAL  │  CommitLog  │ SubtransMap │ RmgrTable│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data_dir/
//! ├── pg_twophase/
//! │   ├── 0000001C         # state file, named by XID in uppercase hex
//! │   └── 0000002F
//! ├── wal/
//! │   └── wal.000001       # write-ahead log
//! └── base/<db>/<rel>      # physical relation files named in drop lists
//! ```
//!
//! ## Durability Contract
//!
//! Crash recovery observes exactly one of two states per PREPARE: a WAL
//! record paired with a valid state file, or neither. The ordering that
//! guarantees this — bogus CRC, WAL flush, CRC finalize, all under the
//! checkpoint-start lock — lives in [`coordinator`].
//!
//! ## Module Overview
//!
//! - [`coordinator`]: prepare/finish orchestration and startup recovery
//! - [`registry`]: the shared table of prepared transactions
//! - [`statefile`]: on-disk state-file format, builder and reader
//! - [`wal`]: write-ahead log records and replay scanning
//! - [`clog`]: per-XID commit status
//! - [`subtrans`]: subtransaction parent map
//! - [`rmgr`]: resource-manager callback registration
//! - [`config`]: tunables and format constants

pub mod clog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod rmgr;
pub mod statefile;
pub mod subtrans;
pub mod types;
pub mod wal;

pub use config::TwoPhaseConfig;
pub use coordinator::{
    Prepare, PrepareData, PreparedXact, RmgrStateRecord, StartupSummary, TwoPhaseCoordinator,
};
pub use error::{Result, TwoPhaseError};
pub use registry::{
    DummyParticipant, GxactHandle, ParticipantKind, ParticipantRegistry, PreparedRegistry,
    TransactionParticipant,
};
pub use rmgr::{RmId, TwoPhaseCallback, RM_END_ID, RM_LOCK_ID, RM_MAX_ID};
pub use types::{BackendContext, DbId, Lsn, RelFileId, UserId, Xid, INVALID_XID};
