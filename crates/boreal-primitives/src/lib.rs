//! Core types shared across the Boreal node: BLS key material, blocks and
//! headers, the FBFT message union, cross-shard artifacts, and the wire
//! envelope.
//!
//! Everything here is plain data. Consensus rules live in
//! `boreal-consensus`; transport lives in `boreal-network`.

pub mod bls;
mod block;
pub mod crosslink;
mod message;
mod receipt;
mod slashing;
pub mod wire;

pub use bls::{AggregateSignature, BlsError, BlsPublicKey, BlsSecretKey, BlsSignature};
pub use block::{Block, Header, StakingTransaction, Transaction, VDF_OUTPUT_SIZE, VRF_SIZE};
pub use crosslink::CrossLink;
pub use message::{
    Announce, Commit, Committed, ConsensusMessage, MessageKind, NewView, Prepare, Prepared,
    PreparedProof, ViewChange, NIL_VOTE,
};
pub use receipt::{CxMerkleProof, CxReceipt, CxReceiptsProof};
pub use slashing::{SignedHeader, SlashRecord};

/// Shard identifier. Shard 0 is the beacon shard.
pub type ShardId = u32;

/// The beacon shard coordinates cross-shard state: committee membership,
/// cross-links and slashing.
pub const BEACON_SHARD_ID: ShardId = 0;

/// View identifier: monotonic counter naming a leader term.
pub type ViewId = u64;

/// Block number within a shard chain.
pub type BlockNumber = u64;
