use boreal_primitives::{ShardId, BEACON_SHARD_ID};
use libp2p::gossipsub::IdentTopic;

/// Committee traffic for one shard: all FBFT messages.
pub fn shard_topic(shard_id: ShardId) -> IdentTopic {
    IdentTopic::new(format!("boreal/shard/{shard_id}"))
}

/// Client-facing traffic for one shard: accepted block announcements.
pub fn client_topic(shard_id: ShardId) -> IdentTopic {
    IdentTopic::new(format!("boreal/client/{shard_id}"))
}

/// Beacon-shard group: staking transactions, slash records, cross-links.
pub fn beacon_topic() -> IdentTopic {
    shard_topic(BEACON_SHARD_ID)
}

/// Network-wide announcements that are not shard-scoped.
pub fn global_topic() -> IdentTopic {
    IdentTopic::new("boreal/global")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_distinct_per_shard_and_role() {
        assert_ne!(shard_topic(1).hash(), shard_topic(2).hash());
        assert_ne!(shard_topic(1).hash(), client_topic(1).hash());
        assert_eq!(beacon_topic().hash(), shard_topic(0).hash());
        assert_ne!(global_topic().hash(), shard_topic(0).hash());
    }
}
