use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::{BlockNumber, ShardId};

/// A beacon-shard record attesting one shard block: the committee's
/// aggregate commit signature and bitmap over that block. Each
/// (shard, number) pair is recorded at most once on the beacon chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossLink {
    pub shard_id: ShardId,
    pub block_num: BlockNumber,
    pub block_hash: B256,
    pub epoch: u64,
    /// Aggregate commit signature bytes from the shard committee.
    pub signature: Vec<u8>,
    /// Commit bitmap in the shard committee's roster order.
    pub bitmap: Vec<u8>,
}

impl CrossLink {
    /// The at-most-once key for beacon persistence.
    pub fn key(&self) -> (ShardId, BlockNumber) {
        (self.shard_id, self.block_num)
    }
}

/// Canonical ordering inside a beacon block: (shard id asc, number asc).
pub fn sort_cross_links(links: &mut [CrossLink]) {
    links.sort_by_key(|l| (l.shard_id, l.block_num));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(shard: ShardId, num: BlockNumber) -> CrossLink {
        CrossLink {
            shard_id: shard,
            block_num: num,
            block_hash: B256::repeat_byte(num as u8),
            epoch: 0,
            signature: Vec::new(),
            bitmap: Vec::new(),
        }
    }

    #[test]
    fn ordering_is_shard_then_number() {
        let mut links = vec![link(2, 5), link(1, 9), link(2, 3), link(1, 2)];
        sort_cross_links(&mut links);
        let keys: Vec<_> = links.iter().map(|l| l.key()).collect();
        assert_eq!(keys, vec![(1, 2), (1, 9), (2, 3), (2, 5)]);
    }
}
