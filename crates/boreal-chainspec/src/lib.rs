//! Chain configuration for the Boreal consensus core: the epoch schedule
//! that gates staking and cross-link behaviour, committee membership, VDF
//! parameters, and the protocol constants shared across crates.

use alloy_primitives::Address;
use boreal_primitives::{BlsPublicKey, ShardId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Target interval between committed blocks.
pub const BLOCK_TIME: Duration = Duration::from_secs(8);

/// Idle backoff used by polling loops.
pub const SLEEP_PERIOD: Duration = Duration::from_millis(20);

/// Maximum cross-shard receipts included in one proposed block.
pub const INCOMING_RECEIPTS_LIMIT: usize = 6000;

/// Broadcast attempts before giving up on a topic publish.
pub const NUM_TRY_BROADCAST: usize = 3;

/// Length of the random sync identity.
pub const SYNC_ID_LENGTH: usize = 20;

/// Upper bound on a serialized cross-shard message.
pub const MAX_CROSS_TX_SIZE: usize = 4096;

/// Retries for committee-level operations.
pub const RESILIENCY: usize = 3;

/// Default parallelism for committee-level operations.
pub const CONCURRENCY: usize = 3;

/// One committee member: reward address, consensus key, and the effective
/// stake that weights its vote once the staking epoch is active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: Address,
    pub bls_public_key: BlsPublicKey,
    /// Effective stake in minimum denomination. `None` for pre-staking
    /// (externally unweighted) members, which vote with weight 1.
    pub effective_stake: Option<u64>,
}

/// Epoch schedule and consensus parameters for one network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Number of shards, beacon included.
    pub shard_count: u32,
    /// Blocks per epoch.
    pub epoch_length: u64,
    /// First epoch in which staking transactions are accepted into beacon
    /// blocks.
    pub prestaking_epoch: u64,
    /// First epoch with stake-weighted voting, BLS-derived coinbases and
    /// the view-id commit-payload suffix.
    pub staking_epoch: u64,
    /// First epoch in which the beacon shard records cross-links.
    pub cross_link_epoch: u64,
    /// VDF difficulty parameter handed to the VDF backend.
    pub vdf_difficulty: u64,
    /// Number of leading epoch VRFs folded into the VDF seed.
    pub vdf_seed_size: usize,
}

impl ChainSpec {
    /// A small two-shard development network with every era active from
    /// genesis.
    pub fn dev() -> Self {
        Self {
            shard_count: 2,
            epoch_length: 32,
            prestaking_epoch: 0,
            staking_epoch: 0,
            cross_link_epoch: 0,
            vdf_difficulty: 10_000,
            vdf_seed_size: 8,
        }
    }

    /// Mainnet-shaped schedule: staking and cross-links activate after
    /// genesis epochs.
    pub fn mainnet() -> Self {
        Self {
            shard_count: 4,
            epoch_length: 16_384,
            prestaking_epoch: 185,
            staking_epoch: 186,
            cross_link_epoch: 186,
            vdf_difficulty: 50_000,
            vdf_seed_size: 8,
        }
    }

    pub fn is_prestaking(&self, epoch: u64) -> bool {
        epoch >= self.prestaking_epoch
    }

    pub fn is_staking(&self, epoch: u64) -> bool {
        epoch >= self.staking_epoch
    }

    pub fn is_cross_link(&self, epoch: u64) -> bool {
        epoch >= self.cross_link_epoch
    }

    /// The epoch a block number belongs to.
    pub fn epoch_of_block(&self, number: u64) -> u64 {
        number / self.epoch_length
    }

    /// True when `number` is the last block of its epoch, the block that
    /// carries the next-epoch shard state on the beacon chain.
    pub fn is_epoch_last_block(&self, number: u64) -> bool {
        (number + 1) % self.epoch_length == 0
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shard_count == 0 {
            return Err("shard_count must be at least 1".to_string());
        }
        if self.epoch_length == 0 {
            return Err("epoch_length must be non-zero".to_string());
        }
        if self.prestaking_epoch > self.staking_epoch {
            return Err(format!(
                "prestaking_epoch ({}) must not come after staking_epoch ({})",
                self.prestaking_epoch, self.staking_epoch
            ));
        }
        if self.vdf_seed_size == 0 || self.vdf_seed_size as u64 > self.epoch_length {
            return Err(format!(
                "vdf_seed_size ({}) must be in 1..=epoch_length ({})",
                self.vdf_seed_size, self.epoch_length
            ));
        }
        Ok(())
    }

    pub fn is_beacon(&self, shard_id: ShardId) -> bool {
        shard_id == boreal_primitives::BEACON_SHARD_ID
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::dev()
    }
}
