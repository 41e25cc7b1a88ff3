use alloy_primitives::B256;
use boreal_primitives::{BlockNumber, ShardId};
use serde::{Deserialize, Serialize};

/// Stream protocol id for the sync sub-protocol.
pub const SYNC_PROTOCOL: &str = "/boreal/sync/0.0.1";

/// Requests a peer can serve over a sync stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Current tips of the peer's shard and beacon chains.
    BlockHeight,
    /// One header by number.
    BlockHeader { shard_id: ShardId, height: BlockNumber },
    /// One full block by number.
    Block { shard_id: ShardId, height: BlockNumber },
}

/// Responses, one per request kind, plus the structured miss.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    BlockHeight {
        shard_id: ShardId,
        beacon_height: BlockNumber,
        beacon_hash: B256,
        shard_height: BlockNumber,
        shard_hash: B256,
    },
    /// Canonical encoding of the requested header.
    BlockHeader { header: Vec<u8> },
    /// Canonical encoding of the requested block.
    Block { block: Vec<u8> },
    /// The peer's tip is below the requested height.
    DoNotHaveBlock { requested: BlockNumber, latest: BlockNumber },
}

/// Stream envelope: a per-handle request counter so a response is always
/// matched back to the request that asked for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFrame<T> {
    pub request_id: u64,
    pub message: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_roundtrip() {
        let frame = SyncFrame {
            request_id: 42,
            message: SyncRequest::Block { shard_id: 1, height: 11 },
        };
        let bytes = bincode::serialize(&frame).unwrap();
        let decoded: SyncFrame<SyncRequest> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_frames_roundtrip() {
        let frame = SyncFrame {
            request_id: 7,
            message: SyncResponse::BlockHeight {
                shard_id: 1,
                beacon_height: 100,
                beacon_hash: B256::repeat_byte(1),
                shard_height: 90,
                shard_hash: B256::repeat_byte(2),
            },
        };
        let bytes = bincode::serialize(&frame).unwrap();
        let decoded: SyncFrame<SyncResponse> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, frame);

        let miss = SyncFrame {
            request_id: 8,
            message: SyncResponse::DoNotHaveBlock { requested: 12, latest: 9 },
        };
        let bytes = bincode::serialize(&miss).unwrap();
        let decoded: SyncFrame<SyncResponse> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, miss);
    }
}
