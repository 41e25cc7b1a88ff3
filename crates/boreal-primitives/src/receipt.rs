use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{BlockNumber, ShardId};

/// A single outgoing transfer recorded on the source shard, to be replayed
/// on the destination shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CxReceipt {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub shard_id: ShardId,
    pub to_shard_id: ShardId,
    pub amount: u128,
}

/// Merkle proof anchoring a batch of receipts to a source-shard header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CxMerkleProof {
    pub shard_id: ShardId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    /// Root over all destination-shard receipt cells of the source block.
    pub cx_receipt_root: B256,
    /// Destination shards present in the source block, and the per-shard
    /// cell roots, index-aligned.
    pub shard_ids: Vec<ShardId>,
    pub cell_roots: Vec<B256>,
}

/// A batch of incoming cross-shard receipts plus the proof tying them to
/// the source shard. Keyed by (source shard, source block number).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CxReceiptsProof {
    pub receipts: Vec<CxReceipt>,
    pub proof: CxMerkleProof,
}

impl CxReceiptsProof {
    /// The pending-pool key for this proof.
    pub fn key(&self) -> (ShardId, BlockNumber) {
        (self.proof.shard_id, self.proof.block_num)
    }

    /// True when every receipt in the batch targets `shard_id`.
    pub fn targets_shard(&self, shard_id: ShardId) -> bool {
        self.receipts.iter().all(|r| r.to_shard_id == shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof_for(shard: ShardId, num: BlockNumber, to_shard: ShardId) -> CxReceiptsProof {
        CxReceiptsProof {
            receipts: vec![CxReceipt {
                tx_hash: B256::repeat_byte(1),
                from: Address::with_last_byte(1),
                to: Address::with_last_byte(2),
                shard_id: shard,
                to_shard_id: to_shard,
                amount: 10,
            }],
            proof: CxMerkleProof {
                shard_id: shard,
                block_num: num,
                block_hash: B256::repeat_byte(2),
                cx_receipt_root: B256::repeat_byte(3),
                shard_ids: vec![to_shard],
                cell_roots: vec![B256::repeat_byte(4)],
            },
        }
    }

    #[test]
    fn key_is_source_shard_and_number() {
        let p = proof_for(2, 77, 1);
        assert_eq!(p.key(), (2, 77));
    }

    #[test]
    fn targets_shard_checks_every_receipt() {
        let mut p = proof_for(2, 1, 1);
        assert!(p.targets_shard(1));
        assert!(!p.targets_shard(3));

        p.receipts.push(CxReceipt {
            tx_hash: B256::repeat_byte(9),
            from: Address::with_last_byte(3),
            to: Address::with_last_byte(4),
            shard_id: 2,
            to_shard_id: 3,
            amount: 1,
        });
        assert!(!p.targets_shard(1), "one misrouted receipt poisons the batch");
    }
}
