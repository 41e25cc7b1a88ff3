//! View change: depose a failed leader and hand the shard to the next
//! one in rotation. A deposing validator carries either the strongest
//! PREPARED it saw (m1) or a NIL marker (m2), plus a signature over the
//! new view id (m3); the designated next leader aggregates 2f+1 of those
//! into NEWVIEW.

use alloy_primitives::B256;
use boreal_primitives::{
    AggregateSignature, ConsensusMessage, MessageKind, NewView, Prepared, PreparedProof,
    ViewChange, NIL_VOTE,
};

use crate::error::{ConsensusError, ConsensusResult};
use crate::quorum::{Ballot, SubmitOutcome, VotePhase};
use crate::signature::construct_commit_payload;
use crate::traits::ChainReader;
use crate::view::{leader_index_for_view, FbftPhase, Mode};

use super::{EngineOutput, FbftEngine};

fn prepared_payload(proof: &PreparedProof) -> Vec<u8> {
    bincode::serialize(proof).expect("prepared proof serialization is infallible")
}

impl<C: ChainReader> FbftEngine<C> {
    /// The view deadline passed without a commit: move to the next view.
    pub(super) fn start_view_change(&mut self) -> ConsensusResult<()> {
        if self.mode() == Mode::Listening {
            return Ok(());
        }
        if self.decider.committee_size() <= 1 {
            // Nobody to hand over to.
            return Ok(());
        }

        let next_view = self.attempted_view.max(self.view_id()) + 1;
        self.attempted_view = next_view;
        self.view.set_mode(Mode::ViewChanging);

        let next_leader_idx = leader_index_for_view(next_view, self.decider.committee_size());
        let next_leader = self
            .decider
            .member(next_leader_idx)
            .expect("rotation index is in range")
            .public_key
            .clone();

        // m1: the strongest PREPARED we saw for the stuck block, if any.
        let prepared = if self.block_hash != B256::ZERO {
            let candidates = self.log.messages_by_type_seq_hash(
                MessageKind::Prepared,
                self.block_num,
                &self.block_hash,
            );
            self.log.find_by_max_view_id(&candidates).and_then(|m| match m {
                ConsensusMessage::Prepared(p) => Some(PreparedProof {
                    view_id: p.view_id,
                    block_hash: p.block_hash,
                    aggregate_signature: p.aggregate_signature.clone(),
                    bitmap: p.bitmap.clone(),
                }),
                _ => None,
            })
        } else {
            None
        };

        let signature = match &prepared {
            Some(proof) => self.secret_key.sign(&prepared_payload(proof)),
            None => self.secret_key.sign(&NIL_VOTE),
        };
        let view_id_signature = self.secret_key.sign(&next_view.to_le_bytes());

        let msg = ViewChange {
            shard_id: self.shard_id(),
            view_id: next_view,
            block_num: self.block_num,
            sender: self.public_key().clone(),
            next_leader: next_leader.clone(),
            prepared,
            signature,
            view_id_signature,
        };

        tracing::warn!(
            block_num = self.block_num,
            next_view,
            next_leader = ?next_leader,
            m1 = msg.prepared.is_some(),
            "view timed out, requesting view change"
        );
        metrics::counter!("boreal_view_changes_started").increment(1);

        self.log.add_message(ConsensusMessage::ViewChange(msg.clone()));
        self.emit(EngineOutput::Broadcast(ConsensusMessage::ViewChange(msg.clone())));

        // The next leader counts its own view-change vote.
        if next_leader == *self.public_key() {
            self.on_view_change(msg)?;
        }
        Ok(())
    }

    /// Collects view-change votes when this node is the designated next
    /// leader; at 2f+1 it emits NEWVIEW and takes over the view.
    pub(super) fn on_view_change(&mut self, msg: ViewChange) -> ConsensusResult<()> {
        if msg.view_id <= self.view_id() {
            tracing::debug!(msg_view = msg.view_id, "stale view change");
            return Ok(());
        }
        if msg.block_num != self.block_num {
            tracing::debug!(msg_num = msg.block_num, "view change for a different block");
            return Ok(());
        }

        let my_idx = leader_index_for_view(msg.view_id, self.decider.committee_size());
        let designated = &self.decider.member(my_idx).expect("in range").public_key;
        if *designated != *self.public_key() {
            // Not the collector for this view; keep the message for the
            // record and move on.
            self.log.add_message(ConsensusMessage::ViewChange(msg));
            return Ok(());
        }
        if !self.decider.is_member(&msg.sender) {
            return Err(ConsensusError::UnknownVoter { voter: msg.sender });
        }

        // m3: the sender's signature over the new view id.
        msg.sender
            .verify(&msg.view_id.to_le_bytes(), &msg.view_id_signature)
            .map_err(|_| ConsensusError::InvalidSignature {
                sender: msg.sender.clone(),
                block_num: msg.block_num,
                view_id: msg.view_id,
            })?;

        // m1 or m2: either verified PREPARED evidence or a NIL vote.
        match &msg.prepared {
            Some(proof) => {
                msg.sender.verify(&prepared_payload(proof), &msg.signature).map_err(|_| {
                    ConsensusError::InvalidSignature {
                        sender: msg.sender.clone(),
                        block_num: msg.block_num,
                        view_id: msg.view_id,
                    }
                })?;
                let signers = self.decider.keys_for_bitmap(&proof.bitmap)?;
                AggregateSignature::verify(
                    proof.block_hash.as_slice(),
                    &proof.aggregate_signature,
                    &signers,
                )
                .map_err(|e| ConsensusError::InvalidAggregate {
                    block_num: msg.block_num,
                    view_id: msg.view_id,
                    reason: e.to_string(),
                })?;
                self.decider.check_bitmap_quorum(&proof.bitmap)?;

                let stronger = self
                    .pending_prepared
                    .as_ref()
                    .map(|p| proof.view_id > p.view_id)
                    .unwrap_or(true);
                if stronger {
                    self.pending_prepared = Some(proof.clone());
                }
            }
            None => {
                msg.sender.verify(&NIL_VOTE, &msg.signature).map_err(|_| {
                    ConsensusError::InvalidSignature {
                        sender: msg.sender.clone(),
                        block_num: msg.block_num,
                        view_id: msg.view_id,
                    }
                })?;
                let nil_ballot = Ballot {
                    voter: msg.sender.clone(),
                    signature: msg.signature.clone(),
                    block_hash: B256::ZERO,
                    block_num: msg.block_num,
                    view_id: msg.view_id,
                };
                self.decider.submit_vote(VotePhase::Nil, nil_ballot)?;
            }
        }

        let outcome = self.decider.submit_vote(
            VotePhase::ViewId,
            Ballot {
                voter: msg.sender.clone(),
                signature: msg.view_id_signature.clone(),
                block_hash: B256::ZERO,
                block_num: msg.block_num,
                view_id: msg.view_id,
            },
        )?;
        if matches!(outcome, SubmitOutcome::AlreadyCounted) {
            return Ok(());
        }

        self.log.add_message(ConsensusMessage::ViewChange(msg.clone()));
        tracing::debug!(
            view_id = msg.view_id,
            signers = self.decider.signers_count(VotePhase::ViewId),
            "view change vote collected"
        );

        if self.decider.is_quorum_achieved(VotePhase::ViewId) {
            self.become_new_leader(msg.view_id)?;
        }
        Ok(())
    }

    /// 2f+1 view-change votes collected: broadcast NEWVIEW and run the
    /// view as its leader.
    fn become_new_leader(&mut self, new_view: u64) -> ConsensusResult<()> {
        let (view_id_signature, view_id_bitmap) = self.decider.aggregate(VotePhase::ViewId)?;
        let (nil_signature, nil_bitmap) =
            if self.decider.signers_count(VotePhase::Nil) > 0 {
                let (sig, bitmap) = self.decider.aggregate(VotePhase::Nil)?;
                (Some(sig), bitmap)
            } else {
                (None, Default::default())
            };

        let prepared = self.pending_prepared.clone();
        let msg = NewView {
            shard_id: self.shard_id(),
            view_id: new_view,
            block_num: self.block_num,
            leader: self.public_key().clone(),
            prepared: prepared.clone(),
            nil_signature,
            nil_bitmap,
            view_id_signature,
            view_id_bitmap,
        };

        tracing::warn!(
            new_view,
            block_num = self.block_num,
            reproposing = prepared.is_some(),
            "view change quorum reached, emitting new view"
        );
        metrics::counter!("boreal_view_changes_completed").increment(1);

        self.log.add_message(ConsensusMessage::NewView(msg.clone()));
        self.emit(EngineOutput::Broadcast(ConsensusMessage::NewView(msg)));

        // Take over the view.
        self.view.set_view_id(new_view);
        self.attempted_view = new_view;
        self.view.set_mode(Mode::Normal);
        self.leader = self.public_key().clone();
        self.decider.reset();
        self.finalize_scheduled = false;
        self.pending_verification = None;

        self.emit(EngineOutput::ViewChanged {
            view_id: new_view,
            leader: self.public_key().clone(),
        });

        match prepared {
            Some(proof) => {
                // Re-propose the prepared block: restore the PREPARED
                // evidence under the new view and collect commits.
                self.block_hash = proof.block_hash;
                self.adopt_prepared_proof(&proof, new_view);
                self.set_phase(FbftPhase::Commit);

                let payload = construct_commit_payload(
                    self.staking_active(),
                    self.block_num,
                    &proof.block_hash,
                    new_view,
                );
                let self_ballot = Ballot {
                    voter: self.public_key().clone(),
                    signature: self.secret_key.sign(&payload),
                    block_hash: proof.block_hash,
                    block_num: self.block_num,
                    view_id: new_view,
                };
                self.decider.submit_vote(VotePhase::Commit, self_ballot)?;
                self.pending_prepared = None;
            }
            None => {
                // Nothing prepared survived the old view: propose fresh.
                self.block_hash = B256::ZERO;
                self.set_phase(FbftPhase::Announce);
                self.emit(EngineOutput::ProposalNewBlock);
            }
        }
        Ok(())
    }

    /// A NEWVIEW from the designated next leader: adopt the view and,
    /// when it re-proposes a prepared block, answer with a COMMIT.
    pub(super) fn on_new_view(&mut self, msg: NewView) -> ConsensusResult<()> {
        if msg.view_id <= self.view_id() {
            tracing::debug!(msg_view = msg.view_id, "stale new view");
            return Ok(());
        }
        let expected_idx = leader_index_for_view(msg.view_id, self.decider.committee_size());
        let expected = &self.decider.member(expected_idx).expect("in range").public_key;
        if msg.leader != *expected {
            return Err(ConsensusError::NotFromLeader {
                view_id: msg.view_id,
                expected: expected.clone(),
                actual: msg.leader,
            });
        }

        // The m3 aggregate proves 2f+1 validators signed the new view id.
        let signers = self.decider.keys_for_bitmap(&msg.view_id_bitmap)?;
        AggregateSignature::verify(
            &msg.view_id.to_le_bytes(),
            &msg.view_id_signature,
            &signers,
        )
        .map_err(|e| ConsensusError::InvalidAggregate {
            block_num: msg.block_num,
            view_id: msg.view_id,
            reason: e.to_string(),
        })?;
        self.decider.check_bitmap_quorum(&msg.view_id_bitmap)?;

        if let (Some(nil_sig), false) = (&msg.nil_signature, msg.nil_bitmap.is_empty()) {
            let nil_signers = self.decider.keys_for_bitmap(&msg.nil_bitmap)?;
            AggregateSignature::verify(&NIL_VOTE, nil_sig, &nil_signers).map_err(|e| {
                ConsensusError::InvalidAggregate {
                    block_num: msg.block_num,
                    view_id: msg.view_id,
                    reason: format!("nil aggregate: {e}"),
                }
            })?;
        }

        if let Some(proof) = &msg.prepared {
            let prepared_signers = self.decider.keys_for_bitmap(&proof.bitmap)?;
            AggregateSignature::verify(
                proof.block_hash.as_slice(),
                &proof.aggregate_signature,
                &prepared_signers,
            )
            .map_err(|e| ConsensusError::InvalidAggregate {
                block_num: msg.block_num,
                view_id: msg.view_id,
                reason: format!("prepared aggregate: {e}"),
            })?;
            self.decider.check_bitmap_quorum(&proof.bitmap)?;
        }

        tracing::warn!(
            new_view = msg.view_id,
            leader = ?msg.leader,
            "accepting new view"
        );

        self.log.add_message(ConsensusMessage::NewView(msg.clone()));
        self.view.set_view_id(msg.view_id);
        self.attempted_view = msg.view_id;
        self.view.set_mode(Mode::Normal);
        self.leader = msg.leader.clone();
        self.decider.reset();
        self.finalize_scheduled = false;
        self.pending_verification = None;

        self.emit(EngineOutput::ViewChanged {
            view_id: msg.view_id,
            leader: msg.leader.clone(),
        });

        match &msg.prepared {
            Some(proof) => {
                self.block_hash = proof.block_hash;
                self.adopt_prepared_proof(proof, msg.view_id);

                let payload = construct_commit_payload(
                    self.staking_active(),
                    msg.block_num,
                    &proof.block_hash,
                    msg.view_id,
                );
                let commit = boreal_primitives::Commit {
                    shard_id: self.shard_id(),
                    view_id: msg.view_id,
                    block_num: msg.block_num,
                    block_hash: proof.block_hash,
                    voter: self.public_key().clone(),
                    signature: self.secret_key.sign(&payload),
                };
                self.emit(EngineOutput::Broadcast(ConsensusMessage::Commit(commit)));
                self.set_phase(FbftPhase::Commit);
            }
            None => {
                self.block_hash = B256::ZERO;
                self.set_phase(FbftPhase::Announce);
            }
        }
        Ok(())
    }

    /// Stores the re-proposed PREPARED under the new view so catch-up can
    /// find evidence for the eventual COMMITTED.
    fn adopt_prepared_proof(&mut self, proof: &PreparedProof, new_view: u64) {
        let prepared = Prepared {
            shard_id: self.shard_id(),
            view_id: new_view,
            block_num: self.block_num,
            block_hash: proof.block_hash,
            leader: self.leader.clone(),
            aggregate_signature: proof.aggregate_signature.clone(),
            bitmap: proof.bitmap.clone(),
            block: Vec::new(),
        };
        self.log.add_message(ConsensusMessage::Prepared(prepared));
    }
}
