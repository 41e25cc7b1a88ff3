//! The FBFT state machine for one shard.
//!
//! The engine is event-driven and does no I/O: `process_event` consumes
//! [`ConsensusEvent`]s and pushes [`EngineOutput`]s on an unbounded
//! channel. The node layer owns the sockets, the timers and the chain
//! store, and drives the engine from its consensus loop, so all state
//! mutation is serialized on that single task.
//!
//! Happy path at the leader:
//! ANNOUNCE out → PREPARE in → quorum → PREPARED out + self COMMIT →
//! COMMIT in → quorum → finalize at `next_block_due` → COMMITTED out.
//!
//! Happy path at a validator:
//! ANNOUNCE in → verify round-trip → PREPARE out → PREPARED in →
//! COMMIT out → COMMITTED in → block committed, state advances.

mod leader;
mod validator;
mod view_change;

use alloy_primitives::{Address, B256};
use boreal_chainspec::ChainSpec;
use boreal_primitives::{
    Block, BlockNumber, BlsPublicKey, BlsSecretKey, ConsensusMessage, MessageKind, ShardId,
    SignedHeader, SlashRecord, ViewId,
};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ConsensusError, ConsensusResult};
use crate::fbft_log::FbftLog;
use crate::quorum::{Ballot, CommitteeMember, QuorumDecider, SubmitOutcome, VotePhase};
use crate::traits::ChainReader;
use crate::view::{leader_index_for_view, FbftPhase, Mode, View};

/// Events fed into the engine by the node's consensus loop.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A consensus message delivered by the router.
    Message(ConsensusMessage),
    /// The proposer finished assembling a block (leader only).
    ProposedBlock(Block),
    /// The verify loop finished checking an announced block's body.
    BlockVerified { block_hash: B256, valid: bool },
    /// The view-change deadline passed without a commit.
    ViewTimeout,
    /// `next_block_due` arrived after finalization was scheduled.
    FinalizeDue,
}

/// Actions the engine requests from the node layer.
#[derive(Debug)]
pub enum EngineOutput {
    /// Publish to the shard's consensus topic.
    Broadcast(ConsensusMessage),
    /// Run full body validation; answer with `BlockVerified`.
    VerifyBlock(Block),
    /// Append a committed block to the chain store and run
    /// post-consensus processing.
    CommitBlock(Block),
    /// Arm the finalize timer for `next_block_due`; answer with
    /// `FinalizeDue` when it fires.
    ScheduleFinalize,
    /// The leader loop should assemble the next block.
    ProposalNewBlock,
    /// Double-sign evidence with both headers resolved.
    SlashCandidate(SlashRecord),
    /// A view change settled; the node should reset its view timer.
    ViewChanged { view_id: ViewId, leader: BlsPublicKey },
}

#[derive(Clone, Copy, Debug)]
struct PendingAnnounce {
    block_num: BlockNumber,
    view_id: ViewId,
    block_hash: B256,
}

pub struct FbftEngine<C> {
    spec: ChainSpec,
    shard_id: ShardId,
    secret_key: BlsSecretKey,
    public_key: BlsPublicKey,
    /// Beneficiary written into slash candidates this node witnesses.
    coinbase: Address,
    chain: Arc<C>,

    pub(crate) decider: QuorumDecider,
    /// The FBFT message log. Public so the node can seed observed blocks
    /// and inspect rounds, the way the original node drives its log.
    pub log: FbftLog,

    view: View,
    phase: FbftPhase,
    leader: BlsPublicKey,
    block_num: BlockNumber,
    block_hash: B256,

    /// Announce awaiting the verify loop before we cast our PREPARE.
    pending_verification: Option<PendingAnnounce>,
    /// One ScheduleFinalize per slot.
    finalize_scheduled: bool,
    /// Highest view this node has tried to move to; keeps repeated
    /// timeouts from re-announcing the same failed view.
    attempted_view: ViewId,
    /// Strongest m1 payload collected while acting as next leader.
    pending_prepared: Option<boreal_primitives::PreparedProof>,
    /// Head as this engine last advanced it; the chain store may trail by
    /// an in-flight insert.
    last_committed: Option<(BlockNumber, B256)>,

    output_tx: mpsc::UnboundedSender<EngineOutput>,
}

impl<C: ChainReader> FbftEngine<C> {
    /// Builds the engine for the current committee. Fails fast on an
    /// empty roster; a node whose key is absent from the roster starts in
    /// `Listening` mode and never votes.
    pub fn new(
        spec: ChainSpec,
        shard_id: ShardId,
        secret_key: BlsSecretKey,
        coinbase: Address,
        committee: Vec<CommitteeMember>,
        chain: Arc<C>,
        output_tx: mpsc::UnboundedSender<EngineOutput>,
    ) -> ConsensusResult<Self> {
        let head = chain.current_header();
        let block_num = head.number + 1;
        let stake_weighted = spec.is_staking(spec.epoch_of_block(block_num));
        let decider = QuorumDecider::new(committee, stake_weighted)?;

        let public_key = secret_key.public_key();
        let mode = if decider.is_member(&public_key) { Mode::Normal } else { Mode::Listening };

        let view_id = head.view_id;
        let leader_idx = leader_index_for_view(view_id, decider.committee_size());
        let leader = decider
            .member(leader_idx)
            .expect("leader index is modulo committee size")
            .public_key
            .clone();

        let mut view = View::new(mode);
        view.set_view_id(view_id);

        Ok(Self {
            spec,
            shard_id,
            secret_key,
            public_key,
            coinbase,
            chain,
            decider,
            log: FbftLog::new(),
            view,
            phase: FbftPhase::Announce,
            leader,
            block_num,
            block_hash: B256::ZERO,
            pending_verification: None,
            finalize_scheduled: false,
            attempted_view: view_id,
            pending_prepared: None,
            last_committed: None,
            output_tx,
        })
    }

    // ── Accessors ──

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn block_num(&self) -> BlockNumber {
        self.block_num
    }

    pub fn view_id(&self) -> ViewId {
        self.view.view_id()
    }

    pub fn mode(&self) -> Mode {
        self.view.mode()
    }

    pub fn phase(&self) -> FbftPhase {
        self.phase
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.public_key && self.view.mode() == Mode::Normal
    }

    pub fn leader_key(&self) -> &BlsPublicKey {
        &self.leader
    }

    pub fn public_key(&self) -> &BlsPublicKey {
        &self.public_key
    }

    pub fn committee(&self) -> &[CommitteeMember] {
        self.decider.members()
    }

    pub fn quorum_decider(&self) -> &QuorumDecider {
        &self.decider
    }

    /// True at the epoch this slot belongs to.
    pub(crate) fn staking_active(&self) -> bool {
        self.spec.is_staking(self.spec.epoch_of_block(self.block_num))
    }

    pub(crate) fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    // ── Event dispatch ──

    pub fn process_event(&mut self, event: ConsensusEvent) -> ConsensusResult<()> {
        match event {
            ConsensusEvent::Message(msg) => self.handle_message(msg),
            ConsensusEvent::ProposedBlock(block) => self.announce(block),
            ConsensusEvent::BlockVerified { block_hash, valid } => {
                self.on_block_verified(block_hash, valid)
            }
            ConsensusEvent::ViewTimeout => self.start_view_change(),
            ConsensusEvent::FinalizeDue => self.finalize_commits(),
        }
    }

    fn handle_message(&mut self, msg: ConsensusMessage) -> ConsensusResult<()> {
        if msg.shard_id() != self.shard_id {
            return Err(ConsensusError::ShardMismatch {
                ours: self.shard_id,
                theirs: msg.shard_id(),
            });
        }

        // A view-changing node still logs ANNOUNCE/PREPARED/COMMITTED so
        // it can catch up silently, but the leader-bound ballot types are
        // dropped to keep a deposed leader from making progress.
        if self.view.mode() == Mode::ViewChanging
            && matches!(msg.kind(), MessageKind::Prepare | MessageKind::Commit)
        {
            tracing::debug!(kind = ?msg.kind(), "dropping ballot while view changing");
            return Ok(());
        }

        metrics::counter!("boreal_consensus_messages").increment(1);

        match msg {
            ConsensusMessage::Announce(m) => self.on_announce(m),
            ConsensusMessage::Prepare(m) => self.on_prepare(m),
            ConsensusMessage::Prepared(m) => self.on_prepared(m),
            ConsensusMessage::Commit(m) => self.on_commit(m),
            ConsensusMessage::Committed(m) => self.on_committed(m),
            ConsensusMessage::ViewChange(m) => self.on_view_change(m),
            ConsensusMessage::NewView(m) => self.on_new_view(m),
        }
    }

    // ── Shared helpers ──

    pub(crate) fn emit(&self, output: EngineOutput) {
        if self.output_tx.send(output).is_err() {
            tracing::error!("engine output channel closed");
        }
    }

    /// The hash new blocks must extend: the engine's own last commit when
    /// it is ahead of the store, else the store's head.
    pub(crate) fn head_hash(&self) -> B256 {
        let head = self.chain.current_header();
        match self.last_committed {
            Some((num, hash)) if num >= head.number => hash,
            _ => head.hash(),
        }
    }

    pub(crate) fn chain(&self) -> &C {
        &self.chain
    }

    /// True when the message names our current (block number, view).
    pub(crate) fn is_current_slot(&self, block_num: BlockNumber, view_id: ViewId) -> bool {
        block_num == self.block_num && view_id == self.view.view_id()
    }

    /// Clears per-slot state after a commit or an adopted view change.
    pub(crate) fn reset_slot(&mut self) {
        self.block_hash = B256::ZERO;
        self.phase = FbftPhase::Announce;
        self.pending_verification = None;
        self.finalize_scheduled = false;
        self.pending_prepared = None;
        self.decider.reset();
    }

    pub(crate) fn set_phase(&mut self, phase: FbftPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "fbft phase switch");
            self.phase = phase;
        }
    }

    /// Recovers the aggregate commit signature and bitmap for `number`
    /// from the chain store, falling back to the logged COMMITTED message
    /// for the round that has not been persisted yet.
    pub fn block_commit_sig(&self, number: BlockNumber) -> ConsensusResult<(Vec<u8>, Vec<u8>)> {
        if self.block_num <= 1 {
            return Ok((Vec::new(), Vec::new()));
        }
        if let Some(sig) = self.chain.read_commit_sig(number) {
            return Ok(sig);
        }

        let committed = self.log.messages_by_type_seq(MessageKind::Committed, number);
        match committed.as_slice() {
            [ConsensusMessage::Committed(m)] => {
                let mut bitmap = vec![0u8; (self.decider.committee_size() + 7) / 8];
                for idx in m.bitmap.iter_ones() {
                    bitmap[idx / 8] |= 0x80 >> (idx % 8);
                }
                Ok((m.aggregate_signature.to_bytes().to_vec(), bitmap))
            }
            [] => Err(ConsensusError::MissingCommitSig { block_num: number }),
            many => Err(ConsensusError::AmbiguousCommit { block_num: number, count: many.len() }),
        }
    }

    /// Resolves a conflicting ballot pair into a slash candidate. Both
    /// headers must be present in the FBFT log; evidence naming a block
    /// this node never saw cannot be turned into a verifiable record.
    pub(crate) fn report_double_sign(&mut self, existing: Option<Ballot>, offending: Ballot) {
        let Some(existing) = existing else {
            // Already reported for this conflicting pair.
            return;
        };

        let signed = self.log.block_by_hash(&existing.block_hash).map(|b| b.header.clone());
        let double_signed =
            self.log.block_by_hash(&offending.block_hash).map(|b| b.header.clone());

        match (signed, double_signed) {
            (Some(signed), Some(double_signed)) => {
                tracing::warn!(
                    offender = ?offending.voter,
                    block_num = offending.block_num,
                    view_id = offending.view_id,
                    "double sign detected, emitting slash candidate"
                );
                metrics::counter!("boreal_double_signs_detected").increment(1);
                self.emit(EngineOutput::SlashCandidate(SlashRecord {
                    offender: offending.voter,
                    signed: SignedHeader { header: signed, signature: existing.signature },
                    double_signed: SignedHeader {
                        header: double_signed,
                        signature: offending.signature,
                    },
                    beneficiary: self.coinbase,
                }));
            }
            _ => {
                tracing::warn!(
                    offender = ?offending.voter,
                    "conflicting ballots observed but a header is unknown, dropping evidence"
                );
            }
        }
    }

    /// Ballot intake shared by the leader's PREPARE and COMMIT handlers.
    ///
    /// A ballot for our block hash is tallied. A ballot for a *different*
    /// hash only matters when the voter already has a tallied ballot, in
    /// which case the decider surfaces the conflicting pair; a lone
    /// wrong-hash ballot is logged upstream and otherwise ignored.
    pub(crate) fn ingest_ballot(
        &mut self,
        phase: VotePhase,
        ballot: Ballot,
    ) -> ConsensusResult<bool> {
        let matches_ours = ballot.block_hash == self.block_hash;
        let has_prior = self.decider.read_ballot(phase, &ballot.voter).is_some();
        if !matches_ours && !has_prior {
            tracing::debug!(voter = ?ballot.voter, "ballot for foreign hash without prior vote");
            return Ok(false);
        }

        match self.decider.submit_vote(phase, ballot)? {
            SubmitOutcome::Counted => Ok(true),
            SubmitOutcome::AlreadyCounted => Ok(false),
            SubmitOutcome::Conflict { existing, offending } => {
                self.report_double_sign(existing, offending);
                Ok(false)
            }
        }
    }
}
