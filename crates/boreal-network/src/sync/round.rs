//! One sync round: probe peer heights with bounded fan-out, group the
//! answers by (shard hash, beacon hash), then pull the next block we are
//! missing from the most widely agreed-on cluster. Round errors are
//! swallowed at the round boundary; per-peer failures only cost that
//! peer's handle.

use alloy_primitives::B256;
use boreal_consensus::traits::ChainReader;
use boreal_primitives::{Block, BlockNumber, ShardId, BEACON_SHARD_ID};
use libp2p::PeerId;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{NetworkError, NetworkResult};

use super::handles::SyncClient;
use super::messages::{SyncRequest, SyncResponse};

/// Wall-clock budget for a whole round; expired peer RPCs are abandoned.
pub const SYNC_ROUND_TIMEOUT: Duration = Duration::from_secs(25);

/// Read deadline on a single peer stream.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(25);

/// Concurrent height probes per round.
pub const PROBE_FANOUT: usize = 10;

/// One peer's advertised tips.
#[derive(Clone, Debug)]
pub struct PeerChainInfo {
    pub peer: PeerId,
    pub shard_height: BlockNumber,
    pub shard_hash: B256,
    pub beacon_height: BlockNumber,
    pub beacon_hash: B256,
}

/// Peers that agree on a tip, keyed by both chain hashes.
#[derive(Clone, Debug)]
pub struct HashCluster {
    pub shard_hash: B256,
    pub beacon_hash: B256,
    pub shard_height: BlockNumber,
    pub peers: Vec<PeerId>,
}

/// Groups probe results by (shard hash, beacon hash) and sorts clusters
/// by descending peer count; the first entry is the canonical tip
/// candidate.
pub fn most_common_clusters(infos: &[PeerChainInfo]) -> Vec<HashCluster> {
    let mut grouped: HashMap<(B256, B256), HashCluster> = HashMap::new();
    for info in infos {
        grouped
            .entry((info.shard_hash, info.beacon_hash))
            .or_insert_with(|| HashCluster {
                shard_hash: info.shard_hash,
                beacon_hash: info.beacon_hash,
                shard_height: info.shard_height,
                peers: Vec::new(),
            })
            .peers
            .push(info.peer);
    }

    let mut clusters: Vec<HashCluster> = grouped.into_values().collect();
    clusters.sort_by(|a, b| {
        b.peers.len().cmp(&a.peers.len()).then(b.shard_height.cmp(&a.shard_height))
    });
    clusters
}

/// Watchdog predicate: a round starts when the mode of peer heights is
/// ahead of the local tip. Ties between heights break toward the higher
/// one.
pub fn should_sync(local_height: BlockNumber, peer_heights: &[BlockNumber]) -> bool {
    let mut counts: HashMap<BlockNumber, usize> = HashMap::new();
    for &height in peer_heights {
        *counts.entry(height).or_default() += 1;
    }
    let Some(mode) = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(height, _)| height)
    else {
        return false;
    };
    mode > local_height
}

pub struct Syncer<K> {
    shard_id: ShardId,
    client: Arc<K>,
    incoming_tx: mpsc::Sender<Block>,
}

impl<K: SyncClient + 'static> Syncer<K> {
    pub fn new(shard_id: ShardId, client: Arc<K>, incoming_tx: mpsc::Sender<Block>) -> Self {
        Self { shard_id, client, incoming_tx }
    }

    /// Runs one round against `peers`, starting from `local_height`.
    /// Fetched blocks land on the incoming channel; the caller inserts
    /// them. All handles are dropped when the round ends.
    pub async fn run_round(
        &self,
        peers: Vec<PeerId>,
        local_height: BlockNumber,
    ) -> NetworkResult<()> {
        let result = self.run_round_inner(peers, local_height).await;
        self.client.end_round();
        result
    }

    async fn run_round_inner(
        &self,
        peers: Vec<PeerId>,
        local_height: BlockNumber,
    ) -> NetworkResult<()> {
        let infos = self.probe_heights(peers).await;
        if infos.is_empty() {
            return Ok(());
        }

        // The watchdog rule: only pull when the mode of peer heights is
        // ahead of us.
        let heights: Vec<BlockNumber> = infos.iter().map(|i| i.shard_height).collect();
        if !should_sync(local_height, &heights) {
            tracing::debug!(local_height, "peers are not ahead, skipping round");
            return Ok(());
        }

        let clusters = most_common_clusters(&infos);
        let wanted = local_height + 1;

        for cluster in clusters {
            if cluster.shard_height <= local_height {
                continue;
            }
            let peer = cluster.peers[rand::thread_rng().gen_range(0..cluster.peers.len())];

            let request = SyncRequest::Block { shard_id: self.shard_id, height: wanted };
            let response =
                match tokio::time::timeout(STREAM_TIMEOUT, self.client.request(peer, request))
                    .await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(NetworkError::StreamReset)) => continue,
                    Ok(Err(err)) => {
                        tracing::debug!(%peer, %err, "block fetch failed");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "block fetch timed out");
                        continue;
                    }
                };

            match response {
                SyncResponse::Block { block } => {
                    let block = Block::decode(&block)
                        .map_err(|e| NetworkError::Codec(e.to_string()))?;
                    metrics::counter!("boreal_sync_blocks_fetched").increment(1);
                    tracing::info!(height = block.number(), %peer, "fetched block from peer");
                    if self.incoming_tx.send(block).await.is_err() {
                        return Err(NetworkError::ChannelClosed);
                    }
                }
                SyncResponse::DoNotHaveBlock { requested, latest } => {
                    tracing::debug!(%peer, requested, latest, "peer cannot serve block");
                }
                other => {
                    tracing::debug!(%peer, ?other, "unexpected response to block fetch");
                }
            }
        }

        Ok(())
    }

    /// Probes up to `PROBE_FANOUT` peers concurrently under the round
    /// deadline; peers that fail or time out are simply absent from the
    /// result.
    async fn probe_heights(&self, peers: Vec<PeerId>) -> Vec<PeerChainInfo> {
        let mut tasks: JoinSet<Option<PeerChainInfo>> = JoinSet::new();

        for peer in peers.into_iter().take(PROBE_FANOUT) {
            let client = self.client.clone();
            tasks.spawn(async move {
                let response = tokio::time::timeout(
                    SYNC_ROUND_TIMEOUT,
                    client.request(peer, SyncRequest::BlockHeight),
                )
                .await
                .ok()?
                .ok()?;

                match response {
                    SyncResponse::BlockHeight {
                        beacon_height,
                        beacon_hash,
                        shard_height,
                        shard_hash,
                        ..
                    } => Some(PeerChainInfo {
                        peer,
                        shard_height,
                        shard_hash,
                        beacon_height,
                        beacon_hash,
                    }),
                    _ => None,
                }
            });
        }

        let mut infos = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(info)) = joined {
                infos.push(info);
            }
        }
        infos
    }
}

/// Server side of the sub-protocol: answers a request from the local
/// chains. A height above the tip yields the structured miss.
pub fn serve_request<C: ChainReader>(
    shard_chain: &C,
    beacon_chain: &C,
    local_shard_id: ShardId,
    request: SyncRequest,
) -> SyncResponse {
    match request {
        SyncRequest::BlockHeight => {
            let shard_tip = shard_chain.current_header();
            let beacon_tip = beacon_chain.current_header();
            SyncResponse::BlockHeight {
                shard_id: local_shard_id,
                beacon_height: beacon_tip.number,
                beacon_hash: beacon_tip.hash(),
                shard_height: shard_tip.number,
                shard_hash: shard_tip.hash(),
            }
        }
        SyncRequest::BlockHeader { shard_id, height } => {
            let chain = if shard_id == BEACON_SHARD_ID { beacon_chain } else { shard_chain };
            let latest = chain.current_header().number;
            if height > latest {
                return SyncResponse::DoNotHaveBlock { requested: height, latest };
            }
            match chain.header_by_number(height) {
                Some(header) => SyncResponse::BlockHeader {
                    header: bincode::serialize(&header).expect("header encodes"),
                },
                None => SyncResponse::DoNotHaveBlock { requested: height, latest },
            }
        }
        SyncRequest::Block { shard_id, height } => {
            let chain = if shard_id == BEACON_SHARD_ID { beacon_chain } else { shard_chain };
            let latest = chain.current_header().number;
            if height > latest {
                return SyncResponse::DoNotHaveBlock { requested: height, latest };
            }
            match chain.block_by_number(height) {
                Some(block) => SyncResponse::Block { block: block.encode() },
                None => SyncResponse::DoNotHaveBlock { requested: height, latest },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    fn info(peer: PeerId, height: BlockNumber, hash_byte: u8) -> PeerChainInfo {
        PeerChainInfo {
            peer,
            shard_height: height,
            shard_hash: B256::repeat_byte(hash_byte),
            beacon_height: height,
            beacon_hash: B256::repeat_byte(hash_byte),
        }
    }

    #[test]
    fn clustering_sorts_by_agreement() {
        let peers: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        let infos = vec![
            info(peers[0], 12, 0x0c),
            info(peers[1], 12, 0x0c),
            info(peers[2], 12, 0x0c),
            info(peers[3], 11, 0x0b),
            info(peers[4], 9, 0x09),
        ];

        let clusters = most_common_clusters(&infos);
        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters[0].peers.len(), 3, "majority cluster first");
        assert_eq!(clusters[0].shard_hash, B256::repeat_byte(0x0c));
        assert_eq!(clusters[0].shard_height, 12);
    }

    #[test]
    fn watchdog_uses_the_mode_of_peer_heights() {
        assert!(should_sync(10, &[12, 12, 12, 11, 9]));
        assert!(!should_sync(12, &[12, 12, 12, 11, 9]));
        assert!(!should_sync(12, &[11, 11, 10]));
        assert!(!should_sync(5, &[]), "no peers, no round");
        // Tie between 11 and 12 breaks toward the higher tip.
        assert!(should_sync(11, &[11, 12]));
    }

    /// Canned peer network for round tests.
    struct CannedPeers {
        heights: HashMap<PeerId, (BlockNumber, u8)>,
        blocks: HashMap<BlockNumber, Block>,
        /// Height-serving peers; requests to others miss.
        serving: Vec<PeerId>,
        requests: Mutex<Vec<(PeerId, SyncRequest)>>,
    }

    impl SyncClient for CannedPeers {
        fn request(
            &self,
            peer: PeerId,
            request: SyncRequest,
        ) -> BoxFuture<'_, NetworkResult<SyncResponse>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push((peer, request.clone()));
                match request {
                    SyncRequest::BlockHeight => {
                        let (height, hash_byte) = self.heights[&peer];
                        Ok(SyncResponse::BlockHeight {
                            shard_id: 1,
                            beacon_height: height,
                            beacon_hash: B256::repeat_byte(hash_byte),
                            shard_height: height,
                            shard_hash: B256::repeat_byte(hash_byte),
                        })
                    }
                    SyncRequest::Block { height, .. } => {
                        if self.serving.contains(&peer) {
                            if let Some(block) = self.blocks.get(&height) {
                                return Ok(SyncResponse::Block { block: block.encode() });
                            }
                        }
                        Ok(SyncResponse::DoNotHaveBlock {
                            requested: height,
                            latest: self.heights[&peer].0,
                        })
                    }
                    SyncRequest::BlockHeader { .. } => {
                        Ok(SyncResponse::DoNotHaveBlock { requested: 0, latest: 0 })
                    }
                }
            })
        }
    }

    fn block_at(height: BlockNumber) -> Block {
        Block {
            header: boreal_primitives::Header {
                parent_hash: B256::repeat_byte(height.saturating_sub(1) as u8),
                number: height,
                epoch: 0,
                view_id: 0,
                shard_id: 1,
                coinbase: alloy_primitives::Address::ZERO,
                state_root: B256::ZERO,
                tx_root: B256::ZERO,
                receipt_root: B256::ZERO,
                timestamp: height,
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

    #[tokio::test]
    async fn round_fetches_next_block_from_majority_cluster() {
        // Local head 10; peers report {12, 12, 12, 11, 9}. The canonical
        // tip is the cluster of three, and block 11 must come from it.
        let ahead: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let behind = PeerId::random();
        let stale = PeerId::random();

        let mut heights = HashMap::new();
        for p in &ahead {
            heights.insert(*p, (12u64, 0x0c));
        }
        heights.insert(behind, (11, 0x0b));
        heights.insert(stale, (9, 0x09));

        let mut blocks = HashMap::new();
        blocks.insert(11u64, block_at(11));

        let client = Arc::new(CannedPeers {
            heights,
            blocks,
            serving: ahead.clone(),
            requests: Mutex::new(Vec::new()),
        });
        let (incoming_tx, mut incoming_rx) = mpsc::channel(8);
        let syncer = Syncer::new(1, client.clone(), incoming_tx);

        let mut peers = ahead.clone();
        peers.push(behind);
        peers.push(stale);
        syncer.run_round(peers, 10).await.unwrap();

        let fetched = incoming_rx.try_recv().expect("block 11 fetched");
        assert_eq!(fetched.number(), 11);

        // The first block request went to a member of the majority
        // cluster, for exactly local + 1.
        let requests = client.requests.lock().unwrap();
        let first_block_request = requests
            .iter()
            .find(|(_, r)| matches!(r, SyncRequest::Block { .. }))
            .expect("a block was requested");
        assert!(ahead.contains(&first_block_request.0));
        assert!(matches!(first_block_request.1, SyncRequest::Block { height: 11, .. }));
    }

    #[tokio::test]
    async fn round_with_no_peers_is_a_noop() {
        let client = Arc::new(CannedPeers {
            heights: HashMap::new(),
            blocks: HashMap::new(),
            serving: Vec::new(),
            requests: Mutex::new(Vec::new()),
        });
        let (incoming_tx, mut incoming_rx) = mpsc::channel(8);
        let syncer = Syncer::new(1, client, incoming_tx);

        syncer.run_round(Vec::new(), 10).await.unwrap();
        assert!(incoming_rx.try_recv().is_err());
    }
}
