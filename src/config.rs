//! Engine configuration
//!
//! Balances write durability against ingest throughput and fixes the
//! training seed so codebooks are reproducible.

use serde::{Deserialize, Serialize};

/// Durability level for committed write batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// fsync the WAL on every commit. Crash after commit loses nothing.
    Synchronous,

    /// Leave flushing to the OS. Crash may lose recent commits; the
    /// index stays openable because frames are checksummed and a torn
    /// tail is skipped on replay.
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Synchronous
    }
}

/// Index-wide configuration, fixed at create time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// WAL durability for writer commits
    pub durability: DurabilityLevel,

    /// Seed for k-means++ initialization (coarse and PQ training).
    /// The same sample and seed always produce the same codebook.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityLevel::default(),
            seed: 0x5eed_1a7e,
        }
    }
}

impl IndexConfig {
    /// Config for throwaway indexes in tests and experiments
    pub fn no_sync() -> Self {
        Self {
            durability: DurabilityLevel::NoSync,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_synchronous() {
        assert_eq!(
            IndexConfig::default().durability,
            DurabilityLevel::Synchronous
        );
    }
}
