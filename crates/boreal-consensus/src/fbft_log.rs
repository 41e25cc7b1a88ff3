//! In-memory log of consensus messages and candidate blocks for the
//! rounds in flight. Entries are indexed by (kind, block number, view id,
//! block hash) and garbage-collected behind the committed watermark.

use alloy_primitives::B256;
use boreal_primitives::{Block, BlockNumber, ConsensusMessage, MessageKind, ViewId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct FbftLog {
    messages: Vec<ConsensusMessage>,
    blocks: HashMap<B256, Block>,
}

impl FbftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Byte-identical duplicates are dropped;
    /// conflicting ballots from the same sender are both retained so
    /// double-sign detection can see the pair.
    pub fn add_message(&mut self, message: ConsensusMessage) {
        if self.messages.contains(&message) {
            return;
        }
        self.messages.push(message);
    }

    /// Stores a candidate block under its content hash. Re-adding the
    /// same block is a no-op.
    pub fn add_block(&mut self, block: Block) {
        self.blocks.entry(block.hash()).or_insert(block);
    }

    pub fn block_by_hash(&self, hash: &B256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// All messages of `kind` at `block_num`, in arrival order.
    pub fn messages_by_type_seq(
        &self,
        kind: MessageKind,
        block_num: BlockNumber,
    ) -> Vec<&ConsensusMessage> {
        self.messages
            .iter()
            .filter(|m| m.kind() == kind && m.block_num() == block_num)
            .collect()
    }

    /// All messages of `kind` at `block_num` naming `block_hash`.
    pub fn messages_by_type_seq_hash(
        &self,
        kind: MessageKind,
        block_num: BlockNumber,
        block_hash: &B256,
    ) -> Vec<&ConsensusMessage> {
        self.messages
            .iter()
            .filter(|m| {
                m.kind() == kind && m.block_num() == block_num && m.block_hash() == *block_hash
            })
            .collect()
    }

    /// True when an ANNOUNCE for exactly this (number, view, hash) slot
    /// has been logged.
    pub fn has_matching_announce(
        &self,
        block_num: BlockNumber,
        view_id: ViewId,
        block_hash: &B256,
    ) -> bool {
        self.messages.iter().any(|m| {
            m.kind() == MessageKind::Announce
                && m.block_num() == block_num
                && m.view_id() == view_id
                && m.block_hash() == *block_hash
        })
    }

    /// Picks the message with the highest view id out of a candidate set.
    pub fn find_by_max_view_id<'a>(
        &self,
        messages: &[&'a ConsensusMessage],
    ) -> Option<&'a ConsensusMessage> {
        messages.iter().max_by_key(|m| m.view_id()).copied()
    }

    /// Drops every message and block below `block_num`. Called after a
    /// commit with `committed - 1` so the previous round stays available
    /// for commit-signature recovery.
    pub fn delete_less_than(&mut self, block_num: BlockNumber) {
        self.messages.retain(|m| m.block_num() >= block_num);
        self.blocks.retain(|_, b| b.number() >= block_num);
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use boreal_primitives::{BlsSecretKey, Header, Prepare};

    fn prepare_msg(
        sk: &BlsSecretKey,
        block_num: BlockNumber,
        view_id: ViewId,
        hash: B256,
    ) -> ConsensusMessage {
        ConsensusMessage::Prepare(Prepare {
            shard_id: 1,
            view_id,
            block_num,
            block_hash: hash,
            voter: sk.public_key(),
            signature: sk.sign_hash(&hash),
        })
    }

    fn block_at(number: BlockNumber) -> Block {
        Block {
            header: Header {
                parent_hash: B256::repeat_byte(1),
                number,
                epoch: 0,
                view_id: 0,
                shard_id: 1,
                coinbase: Address::ZERO,
                state_root: B256::ZERO,
                tx_root: B256::ZERO,
                receipt_root: B256::ZERO,
                timestamp: number,
                gas_limit: 0,
                gas_used: 0,
                vrf: Vec::new(),
                vdf: Vec::new(),
                shard_state: Vec::new(),
                cross_links: Vec::new(),
                slashes: Vec::new(),
                last_commit_signature: Vec::new(),
                last_commit_bitmap: Vec::new(),
            },
            transactions: Vec::new(),
            staking_transactions: Vec::new(),
            incoming_receipts: Vec::new(),
            commit_signature: Vec::new(),
            commit_bitmap: Vec::new(),
        }
    }

    #[test]
    fn identical_messages_are_idempotent() {
        let sk = BlsSecretKey::random().unwrap();
        let mut log = FbftLog::new();
        let msg = prepare_msg(&sk, 3, 0, B256::repeat_byte(0xaa));

        log.add_message(msg.clone());
        log.add_message(msg);
        assert_eq!(log.message_count(), 1);
    }

    #[test]
    fn conflicting_ballots_are_both_kept() {
        let sk = BlsSecretKey::random().unwrap();
        let mut log = FbftLog::new();
        log.add_message(prepare_msg(&sk, 3, 0, B256::repeat_byte(0xaa)));
        log.add_message(prepare_msg(&sk, 3, 0, B256::repeat_byte(0xbb)));

        assert_eq!(log.message_count(), 2);
        assert_eq!(
            log.messages_by_type_seq_hash(MessageKind::Prepare, 3, &B256::repeat_byte(0xbb))
                .len(),
            1
        );
    }

    #[test]
    fn lookup_by_type_seq_and_hash() {
        let sk = BlsSecretKey::random().unwrap();
        let mut log = FbftLog::new();
        log.add_message(prepare_msg(&sk, 3, 0, B256::repeat_byte(0xaa)));
        log.add_message(prepare_msg(&sk, 4, 0, B256::repeat_byte(0xbb)));

        assert_eq!(log.messages_by_type_seq(MessageKind::Prepare, 3).len(), 1);
        assert_eq!(log.messages_by_type_seq(MessageKind::Commit, 3).len(), 0);
        assert_eq!(
            log.messages_by_type_seq_hash(MessageKind::Prepare, 3, &B256::repeat_byte(0xbb))
                .len(),
            0
        );
    }

    #[test]
    fn matching_announce_requires_exact_slot() {
        let sk = BlsSecretKey::random().unwrap();
        let hash = B256::repeat_byte(0x42);
        let mut log = FbftLog::new();
        log.add_message(ConsensusMessage::Announce(boreal_primitives::Announce {
            shard_id: 1,
            view_id: 2,
            block_num: 9,
            block_hash: hash,
            leader: sk.public_key(),
            block: Vec::new(),
            signature: sk.sign_hash(&hash),
        }));

        assert!(log.has_matching_announce(9, 2, &hash));
        assert!(!log.has_matching_announce(9, 3, &hash));
        assert!(!log.has_matching_announce(8, 2, &hash));
        assert!(!log.has_matching_announce(9, 2, &B256::ZERO));
    }

    #[test]
    fn max_view_id_selection() {
        let sk = BlsSecretKey::random().unwrap();
        let mut log = FbftLog::new();
        for view in [1u64, 4, 2] {
            log.add_message(prepare_msg(&sk, 5, view, B256::repeat_byte(view as u8)));
        }

        let candidates = log.messages_by_type_seq(MessageKind::Prepare, 5);
        let best = log.find_by_max_view_id(&candidates).unwrap();
        assert_eq!(best.view_id(), 4);
        assert!(log.find_by_max_view_id(&[]).is_none());
    }

    #[test]
    fn gc_respects_watermark() {
        let sk = BlsSecretKey::random().unwrap();
        let mut log = FbftLog::new();
        for num in 1..=5u64 {
            log.add_message(prepare_msg(&sk, num, 0, B256::repeat_byte(num as u8)));
            log.add_block(block_at(num));
        }

        // Committed block 4: keep numbers >= 3.
        log.delete_less_than(3);
        assert_eq!(log.message_count(), 3);
        assert_eq!(log.block_count(), 3);
        assert!(log.messages_by_type_seq(MessageKind::Prepare, 2).is_empty());
        assert!(log.block_by_hash(&block_at(3).hash()).is_some());
    }
}
