//! Peer-to-peer block sync: height probe → most-common-hash tie-break →
//! block fetch, over per-peer request/response streams.

mod codec;
mod handles;
mod messages;
mod round;

pub use codec::SyncCodec;
pub use handles::{HandleMap, PeerHandle, StreamOpener, StreamSyncClient, SyncClient};
pub use messages::{
    SyncFrame, SyncRequest, SyncResponse, SYNC_PROTOCOL,
};
pub use round::{
    most_common_clusters, serve_request, should_sync, HashCluster, PeerChainInfo, Syncer,
    PROBE_FANOUT, STREAM_TIMEOUT, SYNC_ROUND_TIMEOUT,
};
