//! FBFT consensus core for a Boreal shard: the in-memory message log,
//! the stake-weighted quorum decider, the leader/validator/view-change
//! state machine, the block proposer, VRF/VDF plumbing, and double-sign
//! slash handling.
//!
//! The engine does no I/O. The node layer feeds it [`ConsensusEvent`]s
//! and executes its [`EngineOutput`]s against the network and the chain
//! store; external collaborators are reached through the capability
//! traits in [`traits`].

pub mod engine;
pub mod error;
pub mod fbft_log;
pub mod proposer;
pub mod quorum;
pub mod signature;
pub mod slash;
pub mod timer;
pub mod traits;
pub mod view;
pub mod vrf;

pub use engine::{ConsensusEvent, EngineOutput, FbftEngine};
pub use error::{ConsensusError, ConsensusResult};
pub use fbft_log::FbftLog;
pub use proposer::{BlockProposer, ProposalInputs};
pub use quorum::{Ballot, CommitteeMember, QuorumDecider, SubmitOutcome, VotePhase};
pub use signature::construct_commit_payload;
pub use timer::{ConsensusTimer, VIEW_CHANGE_GRACE};
pub use view::{leader_index_for_view, FbftPhase, Mode, View};
