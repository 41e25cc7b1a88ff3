//! Validator-side FBFT: validate the leader's ANNOUNCE, cast ballots,
//! verify the leader's aggregates, and fold committed blocks into the
//! chain (`try_catchup`).

use alloy_primitives::B256;
use boreal_primitives::{
    AggregateSignature, Announce, Block, Commit, Committed, ConsensusMessage, MessageKind,
    Prepare, Prepared,
};

use crate::error::{ConsensusError, ConsensusResult};
use crate::signature::construct_commit_payload;
use crate::traits::ChainReader;
use crate::view::{FbftPhase, Mode};

use super::{EngineOutput, FbftEngine, PendingAnnounce};

impl<C: ChainReader> FbftEngine<C> {
    /// Validates the leader's proposal and hands the block to the verify
    /// loop. The PREPARE ballot waits for `BlockVerified`.
    pub(super) fn on_announce(&mut self, msg: Announce) -> ConsensusResult<()> {
        if msg.leader == *self.public_key() {
            // Our own broadcast reflected back.
            return Ok(());
        }
        if msg.block_num < self.block_num {
            tracing::debug!(msg_num = msg.block_num, "stale announce");
            return Ok(());
        }

        let block = Block::decode(&msg.block).map_err(|e| ConsensusError::Codec(e.to_string()))?;
        let block_hash = block.hash();
        if block_hash != msg.block_hash {
            return Err(ConsensusError::InvalidHeader {
                block_num: msg.block_num,
                reason: "announce hash does not match the carried block".to_string(),
            });
        }
        msg.leader.verify_hash(&block_hash, &msg.signature).map_err(|_| {
            ConsensusError::InvalidSignature {
                sender: msg.leader.clone(),
                block_num: msg.block_num,
                view_id: msg.view_id,
            }
        })?;

        if msg.block_num > self.block_num {
            // Ahead of us: keep it for catch-up, do not vote.
            tracing::debug!(msg_num = msg.block_num, ours = self.block_num, "future announce logged");
            self.log.add_message(ConsensusMessage::Announce(msg));
            self.log.add_block(block);
            return Ok(());
        }

        if msg.leader != *self.leader_key() {
            return Err(ConsensusError::NotFromLeader {
                view_id: msg.view_id,
                expected: self.leader_key().clone(),
                actual: msg.leader,
            });
        }
        if msg.view_id != self.view_id() {
            return Err(ConsensusError::SlotMismatch {
                our_num: self.block_num,
                our_view: self.view_id(),
                msg_num: msg.block_num,
                msg_view: msg.view_id,
            });
        }

        self.validate_announced_header(&block)?;

        self.log.add_message(ConsensusMessage::Announce(msg.clone()));
        self.log.add_block(block.clone());

        match self.mode() {
            Mode::Normal => {
                self.block_hash = block_hash;
                self.pending_verification = Some(PendingAnnounce {
                    block_num: msg.block_num,
                    view_id: msg.view_id,
                    block_hash,
                });
                tracing::debug!(%block_hash, "announce accepted, awaiting body verification");
                self.emit(EngineOutput::VerifyBlock(block));
            }
            Mode::ViewChanging | Mode::Listening => {
                tracing::debug!(mode = ?self.mode(), "announce logged without voting");
            }
        }
        Ok(())
    }

    /// Header checks that need no block body: linkage, timestamp
    /// monotonicity, epoch arithmetic, and the VRF when present.
    fn validate_announced_header(&self, block: &Block) -> ConsensusResult<()> {
        let header = &block.header;
        let parent = self.chain().current_header();

        if header.parent_hash != self.head_hash() {
            return Err(ConsensusError::ParentMismatch {
                head: self.head_hash(),
                claimed: header.parent_hash,
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(ConsensusError::InvalidHeader {
                block_num: header.number,
                reason: format!(
                    "timestamp {} does not advance past parent {}",
                    header.timestamp, parent.timestamp
                ),
            });
        }
        let expected_epoch = self.spec().epoch_of_block(header.number);
        if header.epoch != expected_epoch {
            return Err(ConsensusError::InvalidHeader {
                block_num: header.number,
                reason: format!("epoch {} but block number implies {}", header.epoch, expected_epoch),
            });
        }

        if !header.vrf.is_empty() {
            let seed = header.parent_hash;
            crate::vrf::verify(self.leader_key(), &seed, &header.vrf).map_err(|_| {
                ConsensusError::InvalidHeader {
                    block_num: header.number,
                    reason: "vrf does not verify under the leader key".to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// The verify loop's verdict on the announced block body.
    pub(super) fn on_block_verified(
        &mut self,
        block_hash: B256,
        valid: bool,
    ) -> ConsensusResult<()> {
        let Some(pending) = self.pending_verification else {
            return Ok(());
        };
        if pending.block_hash != block_hash {
            return Ok(());
        }
        self.pending_verification = None;

        if !valid {
            tracing::warn!(%block_hash, "announced block failed body validation, not voting");
            self.block_hash = B256::ZERO;
            return Ok(());
        }
        if self.mode() != Mode::Normal {
            return Ok(());
        }

        let prepare = Prepare {
            shard_id: self.shard_id(),
            view_id: pending.view_id,
            block_num: pending.block_num,
            block_hash,
            voter: self.public_key().clone(),
            signature: self.secret_key.sign_hash(&block_hash),
        };
        tracing::debug!(%block_hash, "block verified, sending prepare");
        self.emit(EngineOutput::Broadcast(ConsensusMessage::Prepare(prepare)));
        self.set_phase(FbftPhase::Prepare);
        Ok(())
    }

    /// The leader's aggregate PREPARE proof; answer with a COMMIT ballot.
    pub(super) fn on_prepared(&mut self, msg: Prepared) -> ConsensusResult<()> {
        if msg.leader == *self.public_key() {
            return Ok(());
        }
        if msg.block_num < self.block_num {
            tracing::debug!(msg_num = msg.block_num, "stale prepared");
            return Ok(());
        }

        // Authenticate the aggregate before anything else. The signer set
        // is the committee subset the bitmap names.
        let signers = self.decider.keys_for_bitmap(&msg.bitmap)?;
        AggregateSignature::verify(
            msg.block_hash.as_slice(),
            &msg.aggregate_signature,
            &signers,
        )
        .map_err(|e| ConsensusError::InvalidAggregate {
            block_num: msg.block_num,
            view_id: msg.view_id,
            reason: e.to_string(),
        })?;
        self.decider.check_bitmap_quorum(&msg.bitmap)?;

        if !msg.block.is_empty() {
            if let Ok(block) = Block::decode(&msg.block) {
                self.log.add_block(block);
            }
        }
        self.log.add_message(ConsensusMessage::Prepared(msg.clone()));

        if msg.block_num > self.block_num {
            tracing::debug!(msg_num = msg.block_num, "future prepared logged");
            return Ok(());
        }
        if !self.log.has_matching_announce(msg.block_num, msg.view_id, &msg.block_hash) {
            tracing::debug!(block_num = msg.block_num, "prepared without a matching announce");
        }
        if self.mode() != Mode::Normal {
            return Ok(());
        }
        if msg.leader != *self.leader_key() || msg.view_id != self.view_id() {
            return Ok(());
        }

        // Adopt the quorum's hash; a validator that missed the announce
        // can still follow the committee from here.
        self.block_hash = msg.block_hash;
        self.pending_verification = None;

        let payload = construct_commit_payload(
            self.staking_active(),
            msg.block_num,
            &msg.block_hash,
            msg.view_id,
        );
        let commit = Commit {
            shard_id: self.shard_id(),
            view_id: msg.view_id,
            block_num: msg.block_num,
            block_hash: msg.block_hash,
            voter: self.public_key().clone(),
            signature: self.secret_key.sign(&payload),
        };
        tracing::debug!(block_num = msg.block_num, "prepared verified, sending commit");
        self.emit(EngineOutput::Broadcast(ConsensusMessage::Commit(commit)));
        self.set_phase(FbftPhase::Commit);
        Ok(())
    }

    /// The leader's aggregate COMMIT proof: the block is final.
    pub(super) fn on_committed(&mut self, msg: Committed) -> ConsensusResult<()> {
        if msg.leader == *self.public_key() {
            return Ok(());
        }
        if msg.block_num < self.block_num {
            tracing::debug!(msg_num = msg.block_num, "stale committed");
            return Ok(());
        }

        let payload = construct_commit_payload(
            self.spec().is_staking(self.spec().epoch_of_block(msg.block_num)),
            msg.block_num,
            &msg.block_hash,
            msg.view_id,
        );
        let signers = self.decider.keys_for_bitmap(&msg.bitmap)?;
        AggregateSignature::verify(&payload, &msg.aggregate_signature, &signers).map_err(
            |e| ConsensusError::InvalidAggregate {
                block_num: msg.block_num,
                view_id: msg.view_id,
                reason: e.to_string(),
            },
        )?;
        self.decider.check_bitmap_quorum(&msg.bitmap)?;

        self.log.add_message(ConsensusMessage::Committed(msg));
        self.try_catchup()
    }

    /// Walks logged COMMITTED messages at the current number and commits
    /// every block whose evidence is complete: the block itself, a parent
    /// that matches our head, and a PREPARED for the same hash.
    pub(crate) fn try_catchup(&mut self) -> ConsensusResult<()> {
        let mut caught_up = false;

        loop {
            let committed: Vec<Committed> = self
                .log
                .messages_by_type_seq(MessageKind::Committed, self.block_num)
                .into_iter()
                .filter_map(|m| match m {
                    ConsensusMessage::Committed(c) => Some(c.clone()),
                    _ => None,
                })
                .collect();
            if committed.is_empty() {
                break;
            }
            if committed.len() > 1 {
                tracing::error!(
                    block_num = self.block_num,
                    count = committed.len(),
                    "multiple committed messages for one block number"
                );
                return Err(ConsensusError::AmbiguousCommit {
                    block_num: self.block_num,
                    count: committed.len(),
                });
            }
            let committed = committed.into_iter().next().expect("one committed message");

            let Some(block) = self.log.block_by_hash(&committed.block_hash).cloned() else {
                tracing::debug!(
                    block_num = self.block_num,
                    hash = %committed.block_hash,
                    "committed block not in the log yet"
                );
                break;
            };

            if block.parent_hash() != self.head_hash() {
                return Err(ConsensusError::ParentMismatch {
                    head: self.head_hash(),
                    claimed: block.parent_hash(),
                });
            }

            let prepared = self.log.messages_by_type_seq_hash(
                MessageKind::Prepared,
                committed.block_num,
                &committed.block_hash,
            );
            if self.log.find_by_max_view_id(&prepared).is_none() {
                // No prepared evidence for this hash; stop here rather
                // than guess. The view-change timer covers real stalls.
                tracing::debug!(block_num = self.block_num, "no prepared message to commit with");
                break;
            }

            let mut block = block;
            let mut bitmap_bytes = vec![0u8; (self.decider.committee_size() + 7) / 8];
            for idx in committed.bitmap.iter_ones() {
                bitmap_bytes[idx / 8] |= 0x80 >> (idx % 8);
            }
            block.set_commit_sig(
                committed.aggregate_signature.to_bytes().to_vec(),
                bitmap_bytes,
            );

            tracing::info!(
                block_num = committed.block_num,
                view_id = committed.view_id,
                hash = %committed.block_hash,
                "committing block"
            );

            self.last_committed = Some((block.number(), block.hash()));
            self.emit(EngineOutput::CommitBlock(block));

            // Advance the slot: next number, next view, the committing
            // leader carries on until a view change rotates it out.
            self.view.set_view_id(committed.view_id + 1);
            self.attempted_view = committed.view_id + 1;
            self.leader = committed.leader.clone();
            self.block_num += 1;
            self.reset_slot();
            self.log.delete_less_than(self.block_num.saturating_sub(1));
            caught_up = true;
        }

        if caught_up {
            self.set_phase(FbftPhase::Announce);
            if self.mode() == Mode::ViewChanging {
                tracing::info!("caught up during view change, back to normal");
                self.view.set_mode(Mode::Normal);
            }
        }
        Ok(())
    }
}
