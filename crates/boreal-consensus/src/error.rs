use alloy_primitives::B256;
use boreal_primitives::{BlockNumber, BlsError, BlsPublicKey, ShardId, ViewId};
use thiserror::Error;

/// Errors raised by the FBFT core. Handlers return these inward; the
/// consensus loop logs and continues, it never dies on a single message.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A ballot arrived from a key that is not in the committee roster.
    #[error("voter {voter:?} is not a committee member")]
    UnknownVoter { voter: BlsPublicKey },

    /// A ballot or proposal signature failed BLS verification.
    #[error("invalid signature from {sender:?} at block {block_num} view {view_id}")]
    InvalidSignature {
        sender: BlsPublicKey,
        block_num: BlockNumber,
        view_id: ViewId,
    },

    /// An aggregate signature did not verify under its bitmap mask.
    #[error("invalid aggregate signature at block {block_num} view {view_id}: {reason}")]
    InvalidAggregate {
        block_num: BlockNumber,
        view_id: ViewId,
        reason: String,
    },

    /// An aggregate's signers do not carry two-thirds of committee weight.
    #[error("insufficient quorum weight: have {have}, total {total}")]
    InsufficientWeight { have: u128, total: u128 },

    /// A bitmap names more bits than the committee has members.
    #[error("bitmap width {bits} exceeds committee size {committee}")]
    BitmapOutOfRange { bits: usize, committee: usize },

    /// The message names a different consensus slot than the current one.
    #[error("slot mismatch: ours (block {our_num}, view {our_view}), message (block {msg_num}, view {msg_view})")]
    SlotMismatch {
        our_num: BlockNumber,
        our_view: ViewId,
        msg_num: BlockNumber,
        msg_view: ViewId,
    },

    /// The message belongs to another shard.
    #[error("shard mismatch: ours {ours}, message {theirs}")]
    ShardMismatch { ours: ShardId, theirs: ShardId },

    /// The sender is not the leader this slot expects.
    #[error("message from {actual:?} but leader for view {view_id} is {expected:?}")]
    NotFromLeader {
        view_id: ViewId,
        expected: BlsPublicKey,
        actual: BlsPublicKey,
    },

    /// A block referenced by hash is not in the FBFT log.
    #[error("no block with hash {hash} in the FBFT log")]
    MissingBlock { hash: B256 },

    /// The block does not extend the current head.
    #[error("parent hash mismatch: head is {head}, block claims {claimed}")]
    ParentMismatch { head: B256, claimed: B256 },

    /// Header-level validation failed (number, timestamp, epoch, VRF).
    #[error("invalid header at block {block_num}: {reason}")]
    InvalidHeader { block_num: BlockNumber, reason: String },

    /// More than one COMMITTED message is logged for one block number.
    #[error("{count} committed messages logged for block {block_num}, expected one")]
    AmbiguousCommit { block_num: BlockNumber, count: usize },

    /// Recovering the previous block's commit signature failed.
    #[error("cannot recover commit signature for block {block_num}")]
    MissingCommitSig { block_num: BlockNumber },

    /// A slash record failed verification.
    #[error("slash record rejected: {reason}")]
    SlashVerify { reason: String },

    /// The committee roster is empty; consensus cannot start.
    #[error("committee is empty")]
    EmptyCommittee,

    /// This node's key is not part of the committee.
    #[error("own key {key:?} is not in the committee")]
    KeyNotInCommittee { key: BlsPublicKey },

    /// Block assembly failed.
    #[error("block proposal failed: {reason}")]
    Proposal { reason: String },

    /// An external chain operation failed.
    #[error("chain error: {0}")]
    Chain(#[from] crate::traits::ChainError),

    /// BLS primitive failure.
    #[error("bls error: {0}")]
    Bls(#[from] BlsError),

    /// Canonical encoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
