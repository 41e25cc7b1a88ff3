//! Leader-side FBFT: announce the proposed block, tally PREPARE and
//! COMMIT ballots, and finalize once the commit quorum holds and the
//! block cadence allows.

use alloy_primitives::B256;
use boreal_primitives::{
    Announce, Block, Commit, Committed, ConsensusMessage, Prepare, Prepared,
};

use crate::error::{ConsensusError, ConsensusResult};
use crate::quorum::{Ballot, VotePhase};
use crate::signature::construct_commit_payload;
use crate::traits::ChainReader;
use crate::view::FbftPhase;

use super::{EngineOutput, FbftEngine};

impl<C: ChainReader> FbftEngine<C> {
    /// Takes the proposer's block, broadcasts ANNOUNCE, and casts the
    /// leader's own PREPARE ballot.
    pub(super) fn announce(&mut self, block: Block) -> ConsensusResult<()> {
        if !self.is_leader() {
            tracing::debug!("ignoring proposed block, not the leader");
            return Ok(());
        }
        if block.number() != self.block_num {
            return Err(ConsensusError::Proposal {
                reason: format!(
                    "proposed block {} but consensus is at {}",
                    block.number(),
                    self.block_num
                ),
            });
        }

        let block_hash = block.hash();
        self.block_hash = block_hash;

        let announce = Announce {
            shard_id: self.shard_id(),
            view_id: self.view_id(),
            block_num: self.block_num,
            block_hash,
            leader: self.public_key().clone(),
            block: block.encode(),
            signature: self.secret_key.sign_hash(&block_hash),
        };

        self.log.add_message(ConsensusMessage::Announce(announce.clone()));
        self.log.add_block(block);

        // The broadcast does not loop back, so the leader's PREPARE goes
        // straight into the tally.
        let self_ballot = Ballot {
            voter: self.public_key().clone(),
            signature: self.secret_key.sign_hash(&block_hash),
            block_hash,
            block_num: self.block_num,
            view_id: self.view_id(),
        };
        self.decider.submit_vote(VotePhase::Prepare, self_ballot)?;

        tracing::info!(
            block_num = self.block_num,
            view_id = self.view_id(),
            %block_hash,
            "announcing block"
        );
        self.emit(EngineOutput::Broadcast(ConsensusMessage::Announce(announce)));
        self.set_phase(FbftPhase::Prepare);

        // A single-member committee has quorum immediately.
        self.try_reach_prepared()
    }

    /// Handles a validator's PREPARE ballot.
    pub(super) fn on_prepare(&mut self, msg: Prepare) -> ConsensusResult<()> {
        if !self.is_leader() {
            return Ok(());
        }
        if !self.is_current_slot(msg.block_num, msg.view_id) {
            tracing::debug!(
                msg_num = msg.block_num,
                msg_view = msg.view_id,
                "prepare for a different slot"
            );
            return Ok(());
        }
        if self.decider.is_quorum_achieved(VotePhase::Prepare)
            && msg.block_hash == self.block_hash
        {
            tracing::debug!(voter = ?msg.voter, "prepare after quorum, ignoring");
            return Ok(());
        }

        // The ballot authenticates over the hash its sender claims; a
        // vote for a foreign hash is exactly what double-sign evidence
        // is made of, so it must verify before it can condemn.
        msg.voter.verify_hash(&msg.block_hash, &msg.signature).map_err(|_| {
            ConsensusError::InvalidSignature {
                sender: msg.voter.clone(),
                block_num: msg.block_num,
                view_id: msg.view_id,
            }
        })?;

        self.log.add_message(ConsensusMessage::Prepare(msg.clone()));

        let counted = self.ingest_ballot(
            VotePhase::Prepare,
            Ballot {
                voter: msg.voter,
                signature: msg.signature,
                block_hash: msg.block_hash,
                block_num: msg.block_num,
                view_id: msg.view_id,
            },
        )?;

        if counted {
            tracing::debug!(
                signers = self.decider.signers_count(VotePhase::Prepare),
                committee = self.decider.committee_size(),
                "prepare ballot tallied"
            );
            self.try_reach_prepared()?;
        }
        Ok(())
    }

    /// On prepare quorum: broadcast PREPARED with the aggregate, then
    /// self-vote COMMIT.
    fn try_reach_prepared(&mut self) -> ConsensusResult<()> {
        if self.phase() != FbftPhase::Prepare
            || !self.decider.is_quorum_achieved(VotePhase::Prepare)
        {
            return Ok(());
        }

        let (aggregate_signature, bitmap) = self.decider.aggregate(VotePhase::Prepare)?;
        let block = self
            .log
            .block_by_hash(&self.block_hash)
            .ok_or(ConsensusError::MissingBlock { hash: self.block_hash })?;

        let prepared = Prepared {
            shard_id: self.shard_id(),
            view_id: self.view_id(),
            block_num: self.block_num,
            block_hash: self.block_hash,
            leader: self.public_key().clone(),
            aggregate_signature,
            bitmap,
            block: block.encode(),
        };

        tracing::info!(
            block_num = self.block_num,
            signers = self.decider.signers_count(VotePhase::Prepare),
            "prepare quorum reached, broadcasting prepared"
        );

        self.log.add_message(ConsensusMessage::Prepared(prepared.clone()));
        self.emit(EngineOutput::Broadcast(ConsensusMessage::Prepared(prepared)));

        // Leader's own COMMIT ballot.
        let payload = construct_commit_payload(
            self.staking_active(),
            self.block_num,
            &self.block_hash,
            self.view_id(),
        );
        let self_ballot = Ballot {
            voter: self.public_key().clone(),
            signature: self.secret_key.sign(&payload),
            block_hash: self.block_hash,
            block_num: self.block_num,
            view_id: self.view_id(),
        };
        self.decider.submit_vote(VotePhase::Commit, self_ballot)?;
        self.set_phase(FbftPhase::Commit);

        self.try_schedule_finalize();
        Ok(())
    }

    /// Handles a validator's COMMIT ballot.
    pub(super) fn on_commit(&mut self, msg: Commit) -> ConsensusResult<()> {
        if !self.is_leader() {
            return Ok(());
        }
        if !self.is_current_slot(msg.block_num, msg.view_id) {
            tracing::debug!(
                msg_num = msg.block_num,
                msg_view = msg.view_id,
                "commit for a different slot"
            );
            return Ok(());
        }

        let payload = construct_commit_payload(
            self.staking_active(),
            msg.block_num,
            &msg.block_hash,
            msg.view_id,
        );
        msg.voter.verify(&payload, &msg.signature).map_err(|_| {
            ConsensusError::InvalidSignature {
                sender: msg.voter.clone(),
                block_num: msg.block_num,
                view_id: msg.view_id,
            }
        })?;

        self.log.add_message(ConsensusMessage::Commit(msg.clone()));

        let counted = self.ingest_ballot(
            VotePhase::Commit,
            Ballot {
                voter: msg.voter,
                signature: msg.signature,
                block_hash: msg.block_hash,
                block_num: msg.block_num,
                view_id: msg.view_id,
            },
        )?;

        if counted {
            tracing::debug!(
                signers = self.decider.signers_count(VotePhase::Commit),
                committee = self.decider.committee_size(),
                all = self.decider.is_all_sigs_collected(),
                "commit ballot tallied"
            );
            self.try_schedule_finalize();
        }
        Ok(())
    }

    /// Schedules finalization once the commit quorum holds. The node
    /// fires `FinalizeDue` at `next_block_due`, so the cadence stays
    /// near one block per block time even when the committee is fast;
    /// ballots arriving in the meantime still widen the bitmap.
    fn try_schedule_finalize(&mut self) {
        if self.finalize_scheduled || !self.decider.is_quorum_achieved(VotePhase::Commit) {
            return;
        }
        self.finalize_scheduled = true;
        tracing::info!(
            block_num = self.block_num,
            signers = self.decider.signers_count(VotePhase::Commit),
            "commit quorum reached, scheduling finalization"
        );
        self.emit(EngineOutput::ScheduleFinalize);
    }

    /// Builds and broadcasts COMMITTED, commits the block locally, and
    /// asks for the next proposal.
    pub(super) fn finalize_commits(&mut self) -> ConsensusResult<()> {
        if !self.is_leader() || !self.finalize_scheduled {
            return Ok(());
        }
        if !self.decider.is_quorum_achieved(VotePhase::Commit) {
            tracing::warn!(block_num = self.block_num, "finalize due without commit quorum");
            return Ok(());
        }

        let (aggregate_signature, bitmap) = self.decider.aggregate(VotePhase::Commit)?;
        let committed = Committed {
            shard_id: self.shard_id(),
            view_id: self.view_id(),
            block_num: self.block_num,
            block_hash: self.block_hash,
            leader: self.public_key().clone(),
            aggregate_signature,
            bitmap,
        };

        if self.log.block_by_hash(&self.block_hash).is_none() {
            return Err(ConsensusError::MissingBlock { hash: self.block_hash });
        }

        tracing::info!(
            block_num = self.block_num,
            view_id = self.view_id(),
            signers = self.decider.signers_count(VotePhase::Commit),
            "finalizing block"
        );
        metrics::counter!("boreal_blocks_finalized").increment(1);

        self.log.add_message(ConsensusMessage::Committed(committed.clone()));
        self.emit(EngineOutput::Broadcast(ConsensusMessage::Committed(committed)));

        self.try_catchup()?;
        self.emit(EngineOutput::ProposalNewBlock);
        Ok(())
    }

    /// Sanity used by tests: the hash currently under consensus.
    pub fn current_block_hash(&self) -> B256 {
        self.block_hash
    }
}
