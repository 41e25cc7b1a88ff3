//! Capability traits for the external collaborators of the consensus
//! core. The chain store, mempool and VDF are owned elsewhere; consensus
//! sees only these narrow surfaces, so the node can wire real backends
//! while tests wire in-memory ones.

use alloy_primitives::{Address, B256};
use boreal_primitives::{
    Block, BlockNumber, CrossLink, CxReceiptsProof, Header, ShardId, SlashRecord,
    StakingTransaction, Transaction,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// The shard state needed to check a proof is not available yet; the
    /// caller should retry the item later rather than drop it.
    #[error("shard state for epoch {epoch} not available")]
    MissingShardState { epoch: u64 },

    #[error("no block at number {number}")]
    NotFound { number: BlockNumber },

    #[error("invalid receipt proof: {0}")]
    InvalidProof(String),

    #[error("invalid cross-link: {0}")]
    InvalidCrossLink(String),

    #[error("block validation failed: {0}")]
    InvalidBlock(String),

    /// Storage-level failure: fatal, propagated to the supervisor.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

/// Result of executing the selected transactions against a pending state.
#[derive(Clone, Debug)]
pub struct ProposalExecution {
    pub state_root: B256,
    pub tx_root: B256,
    pub receipt_root: B256,
    pub gas_used: u64,
    /// Transactions that survived execution, in inclusion order. Dropped
    /// transactions stay in the mempool.
    pub applied: Vec<Transaction>,
    pub applied_staking: Vec<StakingTransaction>,
}

/// Read access to the local chain.
pub trait ChainReader: Send + Sync {
    fn current_header(&self) -> Header;

    fn header_by_number(&self, number: BlockNumber) -> Option<Header>;

    fn block_by_number(&self, number: BlockNumber) -> Option<Block>;

    /// The aggregate commit signature and bitmap recorded for a block.
    fn read_commit_sig(&self, number: BlockNumber) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Block numbers of this epoch that carried a VRF, in chain order.
    fn epoch_vrf_block_nums(&self, epoch: u64) -> Vec<BlockNumber>;

    /// The 32-byte VRF output recorded at `number`.
    fn vrf_by_number(&self, number: BlockNumber) -> Option<B256>;

    /// True when the receipts of this proof were already replayed here.
    fn is_receipt_spent(&self, proof: &CxReceiptsProof) -> bool;

    /// Validates a receipt proof against the source shard's recorded
    /// state. `MissingShardState` means retry later; anything else means
    /// drop.
    fn validate_cx_receipts_proof(&self, proof: &CxReceiptsProof) -> Result<(), ChainError>;

    /// A cross-link already committed on the beacon chain, if any.
    fn read_cross_link(&self, shard_id: ShardId, number: BlockNumber) -> Option<CrossLink>;

    /// Verifies a pending cross-link's aggregate signature against the
    /// source shard committee.
    fn verify_cross_link(&self, link: &CrossLink) -> Result<(), ChainError>;

    /// Canonical encoding of the committee assignment for `epoch`.
    fn next_shard_state(&self, epoch: u64) -> Result<Vec<u8>, ChainError>;

    /// Executes the ordered selection against a pending state on top of
    /// `base`, returning roots and the surviving transactions.
    fn execute_for_proposal(
        &self,
        base: &Header,
        beneficiary: Address,
        txs: Vec<Transaction>,
        staking_txs: Vec<StakingTransaction>,
    ) -> Result<ProposalExecution, ChainError>;

    /// Full body validation of a candidate block (the verify loop).
    fn validate_block(&self, block: &Block) -> Result<(), ChainError>;
}

/// Write access to the local chain and its pending queues.
pub trait ChainStore: Send + Sync {
    /// Appends a committed block; the new head must be this block.
    fn insert_block(&self, block: Block) -> Result<(), ChainError>;

    fn write_commit_sig(&self, number: BlockNumber, signature: Vec<u8>, bitmap: Vec<u8>);

    fn read_pending_cross_links(&self) -> Vec<CrossLink>;

    /// Adds a cross-link to the pending set; (shard, number) pairs already
    /// present are kept, not replaced.
    fn add_pending_cross_link(&self, link: CrossLink);

    fn delete_pending_cross_links(&self, links: &[CrossLink]);

    /// Verified slash records waiting for beacon inclusion.
    fn pending_slashes(&self) -> Vec<SlashRecord>;

    /// Drains the pending slash queue for inclusion in a proposal.
    fn take_pending_slashes(&self) -> Vec<SlashRecord>;

    fn add_pending_slash(&self, record: SlashRecord);
}

/// The mempool surface the proposer drains.
pub trait TxPool: Send + Sync {
    /// Pending plain transactions grouped by sender, nonce-ordered within
    /// each sender, plus pending staking transactions.
    fn pending(&self) -> (BTreeMap<Address, Vec<Transaction>>, Vec<StakingTransaction>);

    /// Cross-shard receipt proofs awaiting inclusion.
    fn pending_receipts(&self) -> Vec<CxReceiptsProof>;

    /// Puts proofs back for a later block (missing shard state, or over
    /// the per-block receipt budget).
    fn requeue_receipts(&self, proofs: Vec<CxReceiptsProof>);

    /// Router-facing intake of gossiped transactions.
    fn add_transactions(&self, txs: Vec<Transaction>);

    fn add_staking_transactions(&self, txs: Vec<StakingTransaction>);

    /// Router-facing intake of receipt proofs destined for this shard.
    fn add_pending_receipts(&self, proofs: Vec<CxReceiptsProof>);
}

/// Verifiable-delay-function backend. Execution is long-running and is
/// always dispatched to a blocking task.
pub trait VdfBackend: Send + Sync {
    /// Runs the VDF to completion, returning the 516-byte output.
    fn execute(&self, difficulty: u64, seed: [u8; 32]) -> Vec<u8>;

    /// Checks a claimed output for the given seed.
    fn verify(&self, difficulty: u64, seed: [u8; 32], output: &[u8]) -> bool;
}
