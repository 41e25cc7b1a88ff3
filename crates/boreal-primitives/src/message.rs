use alloy_primitives::B256;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bls::{BlsPublicKey, BlsSignature};
use crate::{BlockNumber, ShardId, ViewId};

/// Marker signed by a view-changing validator that has no PREPARED
/// evidence to carry (the m2 form).
pub const NIL_VOTE: [u8; 1] = [0x01];

/// Discriminant for FBFT log indexing and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Announce,
    Prepare,
    Prepared,
    Commit,
    Committed,
    ViewChange,
    NewView,
}

/// Leader's block proposal. The signature is the leader's ballot over the
/// block hash, doubling as its own PREPARE vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub leader: BlsPublicKey,
    /// Canonical encoding of the proposed block.
    pub block: Vec<u8>,
    pub signature: BlsSignature,
}

/// Validator ballot over the announced block hash, sent toward the leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub voter: BlsPublicKey,
    pub signature: BlsSignature,
}

/// Leader's proof that the prepare quorum was reached: the aggregate
/// prepare signature and the roster-order bitmap of signers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepared {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub leader: BlsPublicKey,
    pub aggregate_signature: BlsSignature,
    pub bitmap: BitVec<u8, Msb0>,
    /// The announced block rides along so late validators can catch up
    /// without a separate fetch.
    pub block: Vec<u8>,
}

/// Validator ballot over the commit payload
/// (`LE(number) ‖ hash [‖ LE(view)]`), sent toward the leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub voter: BlsPublicKey,
    pub signature: BlsSignature,
}

/// Leader's proof of commitment: aggregate commit signature plus bitmap.
/// Receiving this finalizes the block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub leader: BlsPublicKey,
    pub aggregate_signature: BlsSignature,
    pub bitmap: BitVec<u8, Msb0>,
}

/// The strongest PREPARED evidence a view-changing validator has seen for
/// the pending block number (the m1 form).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub view_id: ViewId,
    pub block_hash: B256,
    pub aggregate_signature: BlsSignature,
    pub bitmap: BitVec<u8, Msb0>,
}

/// Vote to depose the current leader. Carries either the highest PREPARED
/// seen (m1) or nothing (m2/NIL); `signature` covers the m1 payload or the
/// NIL marker, and `view_id_signature` covers the little-endian view id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub shard_id: ShardId,
    /// The view being moved to, not the failed one.
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub sender: BlsPublicKey,
    pub next_leader: BlsPublicKey,
    pub prepared: Option<PreparedProof>,
    pub signature: BlsSignature,
    pub view_id_signature: BlsSignature,
}

/// The designated next leader's proof that 2f+1 validators agreed to move:
/// aggregated NIL (m2) and view-id (m3) signatures with bitmaps, plus the
/// m1 payload to re-propose when one exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub shard_id: ShardId,
    pub view_id: ViewId,
    pub block_num: BlockNumber,
    pub leader: BlsPublicKey,
    pub prepared: Option<PreparedProof>,
    pub nil_signature: Option<BlsSignature>,
    pub nil_bitmap: BitVec<u8, Msb0>,
    pub view_id_signature: BlsSignature,
    pub view_id_bitmap: BitVec<u8, Msb0>,
}

/// Union of all consensus-category messages on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Announce(Announce),
    Prepare(Prepare),
    Prepared(Prepared),
    Commit(Commit),
    Committed(Committed),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Announce(_) => MessageKind::Announce,
            Self::Prepare(_) => MessageKind::Prepare,
            Self::Prepared(_) => MessageKind::Prepared,
            Self::Commit(_) => MessageKind::Commit,
            Self::Committed(_) => MessageKind::Committed,
            Self::ViewChange(_) => MessageKind::ViewChange,
            Self::NewView(_) => MessageKind::NewView,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        match self {
            Self::Announce(m) => m.shard_id,
            Self::Prepare(m) => m.shard_id,
            Self::Prepared(m) => m.shard_id,
            Self::Commit(m) => m.shard_id,
            Self::Committed(m) => m.shard_id,
            Self::ViewChange(m) => m.shard_id,
            Self::NewView(m) => m.shard_id,
        }
    }

    pub fn view_id(&self) -> ViewId {
        match self {
            Self::Announce(m) => m.view_id,
            Self::Prepare(m) => m.view_id,
            Self::Prepared(m) => m.view_id,
            Self::Commit(m) => m.view_id,
            Self::Committed(m) => m.view_id,
            Self::ViewChange(m) => m.view_id,
            Self::NewView(m) => m.view_id,
        }
    }

    pub fn block_num(&self) -> BlockNumber {
        match self {
            Self::Announce(m) => m.block_num,
            Self::Prepare(m) => m.block_num,
            Self::Prepared(m) => m.block_num,
            Self::Commit(m) => m.block_num,
            Self::Committed(m) => m.block_num,
            Self::ViewChange(m) => m.block_num,
            Self::NewView(m) => m.block_num,
        }
    }

    /// The block hash named by the message. View-change traffic names no
    /// single block, so it reports the zero hash.
    pub fn block_hash(&self) -> B256 {
        match self {
            Self::Announce(m) => m.block_hash,
            Self::Prepare(m) => m.block_hash,
            Self::Prepared(m) => m.block_hash,
            Self::Commit(m) => m.block_hash,
            Self::Committed(m) => m.block_hash,
            Self::ViewChange(m) => {
                m.prepared.as_ref().map(|p| p.block_hash).unwrap_or(B256::ZERO)
            }
            Self::NewView(m) => m.prepared.as_ref().map(|p| p.block_hash).unwrap_or(B256::ZERO),
        }
    }

    pub fn sender(&self) -> &BlsPublicKey {
        match self {
            Self::Announce(m) => &m.leader,
            Self::Prepare(m) => &m.voter,
            Self::Prepared(m) => &m.leader,
            Self::Commit(m) => &m.voter,
            Self::Committed(m) => &m.leader,
            Self::ViewChange(m) => &m.sender,
            Self::NewView(m) => &m.leader,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsSecretKey;

    fn dummy_key_and_sig() -> (BlsPublicKey, BlsSignature) {
        let sk = BlsSecretKey::random().unwrap();
        (sk.public_key(), sk.sign(b"dummy"))
    }

    fn all_variants() -> Vec<ConsensusMessage> {
        let (key, sig) = dummy_key_and_sig();
        let bitmap = bitvec![u8, Msb0; 1, 0, 1, 1];
        let proof = PreparedProof {
            view_id: 2,
            block_hash: B256::repeat_byte(0x22),
            aggregate_signature: sig.clone(),
            bitmap: bitmap.clone(),
        };

        vec![
            ConsensusMessage::Announce(Announce {
                shard_id: 1,
                view_id: 0,
                block_num: 10,
                block_hash: B256::repeat_byte(0x10),
                leader: key.clone(),
                block: vec![1, 2, 3],
                signature: sig.clone(),
            }),
            ConsensusMessage::Prepare(Prepare {
                shard_id: 1,
                view_id: 0,
                block_num: 10,
                block_hash: B256::repeat_byte(0x10),
                voter: key.clone(),
                signature: sig.clone(),
            }),
            ConsensusMessage::Prepared(Prepared {
                shard_id: 1,
                view_id: 0,
                block_num: 10,
                block_hash: B256::repeat_byte(0x10),
                leader: key.clone(),
                aggregate_signature: sig.clone(),
                bitmap: bitmap.clone(),
                block: Vec::new(),
            }),
            ConsensusMessage::Commit(Commit {
                shard_id: 1,
                view_id: 0,
                block_num: 10,
                block_hash: B256::repeat_byte(0x10),
                voter: key.clone(),
                signature: sig.clone(),
            }),
            ConsensusMessage::Committed(Committed {
                shard_id: 1,
                view_id: 0,
                block_num: 10,
                block_hash: B256::repeat_byte(0x10),
                leader: key.clone(),
                aggregate_signature: sig.clone(),
                bitmap: bitmap.clone(),
            }),
            ConsensusMessage::ViewChange(ViewChange {
                shard_id: 1,
                view_id: 1,
                block_num: 10,
                sender: key.clone(),
                next_leader: key.clone(),
                prepared: Some(proof.clone()),
                signature: sig.clone(),
                view_id_signature: sig.clone(),
            }),
            ConsensusMessage::NewView(NewView {
                shard_id: 1,
                view_id: 1,
                block_num: 10,
                leader: key,
                prepared: None,
                nil_signature: Some(sig.clone()),
                nil_bitmap: bitmap.clone(),
                view_id_signature: sig,
                view_id_bitmap: bitmap,
            }),
        ]
    }

    #[test]
    fn serde_roundtrip_every_variant() {
        for msg in all_variants() {
            let encoded = bincode::serialize(&msg).unwrap();
            let decoded: ConsensusMessage = bincode::deserialize(&encoded).unwrap();
            assert_eq!(decoded.kind(), msg.kind());
            assert_eq!(decoded.shard_id(), msg.shard_id());
            assert_eq!(decoded.view_id(), msg.view_id());
            assert_eq!(decoded.block_num(), msg.block_num());
            assert_eq!(decoded.block_hash(), msg.block_hash());
        }
    }

    #[test]
    fn view_change_block_hash_follows_prepared_payload() {
        let msgs = all_variants();
        let ConsensusMessage::ViewChange(vc) = &msgs[5] else {
            panic!("expected view change at index 5");
        };
        assert_eq!(
            ConsensusMessage::ViewChange(vc.clone()).block_hash(),
            B256::repeat_byte(0x22),
            "m1 view change names the prepared block"
        );

        let mut nil = vc.clone();
        nil.prepared = None;
        assert_eq!(ConsensusMessage::ViewChange(nil).block_hash(), B256::ZERO);
    }
}
