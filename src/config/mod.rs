//! # Configuration Module
//!
//! This module centralizes the tunables and on-disk format constants for the
//! two-phase commit subsystem. Constants with interdependencies live together
//! in [`constants`] and are guarded by compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;

/// Runtime configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct TwoPhaseConfig {
    /// Capacity of the prepared-transaction registry. Determines how many
    /// transactions may sit in prepared state simultaneously.
    pub max_prepared_xacts: usize,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            max_prepared_xacts: DEFAULT_MAX_PREPARED_XACTS,
        }
    }
}
