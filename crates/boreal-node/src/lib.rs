//! Shard-node orchestration: wires the FBFT engine to the network
//! plumbing and the chain store, and runs the long-lived loops: the
//! consensus loop, the engine-output executor, the leader loop, the
//! block-processing loops, the view timer, the slash relay and the sync
//! watchdog.

pub mod addresses;
pub mod block_processing;
pub mod leader;
pub mod singleflight;
pub mod slashing;

use alloy_primitives::Address;
use boreal_chainspec::{ChainSpec, BLOCK_TIME};
use boreal_consensus::engine::{ConsensusEvent, EngineOutput};
use boreal_consensus::traits::{ChainReader, ChainStore, TxPool, VdfBackend};
use boreal_consensus::{
    BlockProposer, CommitteeMember, ConsensusError, ConsensusTimer, FbftEngine,
};
use boreal_network::sync::{SyncClient, Syncer};
use boreal_network::{Broadcaster, NetworkError, NodeMessage, Overlay, Routed};
use boreal_primitives::{Block, BlsSecretKey, CxReceiptsProof, ShardId, SlashRecord};
use singleflight::SingleFlight;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Static identity and chain parameters for one node.
#[derive(Clone)]
pub struct NodeConfig {
    pub spec: ChainSpec,
    pub shard_id: ShardId,
    pub secret_key: BlsSecretKey,
    /// Pre-staking coinbase and slash beneficiary.
    pub address: Address,
}

/// A running node's ingress points and task handles.
pub struct NodeHandles {
    /// Feed decoded router output here.
    pub routed_tx: mpsc::Sender<Routed>,
    /// Direct consensus-event injection (used by tests and the router).
    pub event_tx: mpsc::Sender<ConsensusEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub struct Node<C, P, O> {
    config: NodeConfig,
    committee: Vec<CommitteeMember>,
    chain: Arc<C>,
    pool: Arc<P>,
    overlay: Arc<O>,
}

impl<C, P, O> Node<C, P, O>
where
    C: ChainReader + ChainStore + 'static,
    P: TxPool + 'static,
    O: Overlay + 'static,
{
    /// Validates the configuration up front: a node with no committee or
    /// whose key is not seated must not enter the consensus loop.
    pub fn new(
        config: NodeConfig,
        committee: Vec<CommitteeMember>,
        chain: Arc<C>,
        pool: Arc<P>,
        overlay: Arc<O>,
    ) -> Result<Self, NodeError> {
        config.spec.validate().map_err(NodeError::Config)?;
        if committee.is_empty() {
            return Err(NodeError::Config("committee is empty".to_string()));
        }
        let own_key = config.secret_key.public_key();
        if !committee.iter().any(|m| m.public_key == own_key) {
            return Err(NodeError::Config(format!(
                "own key {own_key:?} is not in the shard committee"
            )));
        }
        Ok(Self { config, committee, chain, pool, overlay })
    }

    /// Spawns every long-lived task and returns the ingress handles.
    pub fn spawn<B, K>(
        self,
        vdf_backend: Arc<B>,
        sync_client: Arc<K>,
        peers_fn: impl Fn() -> Vec<libp2p::PeerId> + Send + Sync + 'static,
    ) -> Result<NodeHandles, NodeError>
    where
        B: VdfBackend + 'static,
        K: SyncClient + 'static,
    {
        let shard_id = self.config.shard_id;
        let is_beacon = self.config.spec.is_beacon(shard_id);

        let (event_tx, event_rx) = mpsc::channel::<ConsensusEvent>(1024);
        let (routed_tx, routed_rx) = mpsc::channel::<Routed>(1024);
        let (proposal_tx, proposal_rx) = mpsc::channel::<()>(8);
        let (verify_tx, verify_rx) = mpsc::channel(16);
        let (round_tx, round_rx) = mpsc::channel(16);
        let (slash_tx, slash_rx) = mpsc::channel::<SlashRecord>(64);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Block>(64);
        let (output_tx, output_rx) = mpsc::unbounded_channel::<EngineOutput>();

        let engine = FbftEngine::new(
            self.config.spec.clone(),
            shard_id,
            self.config.secret_key.clone(),
            self.config.address,
            self.committee.clone(),
            self.chain.clone(),
            output_tx,
        )?;
        let engine = Arc::new(Mutex::new(engine));

        let broadcaster = Arc::new(Broadcaster::new(self.overlay.clone(), shard_id));
        let proposer = Arc::new(BlockProposer::new(
            self.config.spec.clone(),
            shard_id,
            self.config.secret_key.clone(),
            self.config.address,
            self.chain.clone(),
            self.pool.clone(),
        ));
        let timer = Arc::new(StdMutex::new(ConsensusTimer::new(BLOCK_TIME)));
        let syncer = Syncer::new(shard_id, sync_client, incoming_tx);

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_consensus_loop(engine.clone(), event_rx)));
        tasks.push(tokio::spawn(run_output_loop(OutputLoop {
            shard_id,
            engine: engine.clone(),
            broadcaster: broadcaster.clone(),
            timer: timer.clone(),
            event_tx: event_tx.clone(),
            verify_tx,
            round_tx,
            proposal_tx,
            slash_tx: slash_tx.clone(),
            output_rx,
        })));
        tasks.push(tokio::spawn(run_routed_loop(
            shard_id,
            is_beacon,
            routed_rx,
            event_tx.clone(),
            self.pool.clone(),
            slash_tx.clone(),
        )));
        tasks.push(tokio::spawn(leader::run_leader_loop(
            self.config.spec.clone(),
            engine.clone(),
            proposer,
            self.chain.clone(),
            vdf_backend,
            timer.clone(),
            proposal_rx,
            event_tx.clone(),
        )));
        tasks.push(tokio::spawn(block_processing::run_round_completed_loop(
            self.chain.clone(),
            broadcaster.clone(),
            round_rx,
        )));
        tasks.push(tokio::spawn(block_processing::run_verify_loop(
            self.chain.clone(),
            verify_rx,
        )));
        tasks.push(tokio::spawn(block_processing::run_incoming_blocks_loop(
            self.chain.clone(),
            incoming_rx,
        )));
        tasks.push(tokio::spawn(slashing::run_slash_relay(
            is_beacon,
            self.committee.clone(),
            self.chain.clone(),
            broadcaster,
            slash_rx,
        )));
        tasks.push(tokio::spawn(run_view_timer(timer, event_tx.clone())));
        tasks.push(tokio::spawn(run_sync_watchdog(
            syncer,
            self.chain.clone(),
            peers_fn,
            Duration::from_secs(10),
        )));

        tracing::info!(shard_id, is_beacon, "node tasks spawned");
        Ok(NodeHandles { routed_tx, event_tx, tasks })
    }
}

/// The single-threaded consensus loop: all engine mutation happens here.
/// A handler error never kills the loop.
async fn run_consensus_loop<C: ChainReader>(
    engine: Arc<Mutex<FbftEngine<C>>>,
    mut events: mpsc::Receiver<ConsensusEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut engine = engine.lock().await;
        if let Err(err) = engine.process_event(event) {
            tracing::warn!(%err, "consensus handler rejected event");
        }
    }
    tracing::info!("consensus loop shut down");
}

struct OutputLoop<C, O> {
    shard_id: ShardId,
    engine: Arc<Mutex<FbftEngine<C>>>,
    broadcaster: Arc<Broadcaster<O>>,
    timer: Arc<StdMutex<ConsensusTimer>>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    verify_tx: mpsc::Sender<block_processing::BlockRequest>,
    round_tx: mpsc::Sender<block_processing::BlockRequest>,
    proposal_tx: mpsc::Sender<()>,
    slash_tx: mpsc::Sender<SlashRecord>,
    output_rx: mpsc::UnboundedReceiver<EngineOutput>,
}

/// Executes engine outputs against the outside world.
async fn run_output_loop<C, O>(mut ctx: OutputLoop<C, O>)
where
    C: ChainReader + 'static,
    O: Overlay + 'static,
{
    let finalize_flight: Arc<SingleFlight<(u64, ShardId)>> = Arc::new(SingleFlight::new());

    while let Some(output) = ctx.output_rx.recv().await {
        match output {
            EngineOutput::Broadcast(msg) => {
                if let Err(err) = ctx.broadcaster.consensus_message(&msg).await {
                    tracing::warn!(%err, "consensus broadcast failed");
                }
            }
            EngineOutput::VerifyBlock(block) => {
                let hash = block.hash();
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctx.verify_tx.send((block, reply_tx)).await.is_err() {
                    continue;
                }
                let event_tx = ctx.event_tx.clone();
                tokio::spawn(async move {
                    let valid = matches!(reply_rx.await, Ok(Ok(())));
                    let _ = event_tx
                        .send(ConsensusEvent::BlockVerified { block_hash: hash, valid })
                        .await;
                });
            }
            EngineOutput::CommitBlock(block) => {
                let number = block.number();
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctx.round_tx.send((block, reply_tx)).await.is_err() {
                    continue;
                }
                match reply_rx.await {
                    Ok(Ok(())) => {
                        ctx.timer.lock().unwrap().on_block_committed();
                    }
                    Ok(Err(err)) => {
                        // Storage failure is fatal: stop executing outputs
                        // so the supervisor can wind the node down.
                        tracing::error!(number, %err, "block insertion failed, stopping");
                        return;
                    }
                    Err(_) => return,
                }
            }
            EngineOutput::ScheduleFinalize => {
                let view_id = ctx.engine.lock().await.view_id();
                let due = ctx.timer.lock().unwrap().next_block_due();
                let flight = finalize_flight.clone();
                let event_tx = ctx.event_tx.clone();
                let key = (view_id, ctx.shard_id);
                tokio::spawn(async move {
                    flight
                        .run(key, || async {
                            tokio::time::sleep_until(due).await;
                            let _ = event_tx.send(ConsensusEvent::FinalizeDue).await;
                        })
                        .await;
                });
            }
            EngineOutput::ProposalNewBlock => {
                let _ = ctx.proposal_tx.send(()).await;
            }
            EngineOutput::SlashCandidate(record) => {
                let _ = ctx.slash_tx.send(record).await;
            }
            EngineOutput::ViewChanged { view_id, .. } => {
                tracing::info!(view_id, "view changed, resetting the view clock");
                ctx.timer.lock().unwrap().on_view_change();
            }
        }
    }
    tracing::info!("output loop shut down");
}

/// Dispatches router output: consensus traffic to the engine, mempool
/// traffic to the pool, mesh-reported slash records to the relay.
async fn run_routed_loop<P: TxPool>(
    shard_id: ShardId,
    is_beacon: bool,
    mut routed: mpsc::Receiver<Routed>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    pool: Arc<P>,
    slash_tx: mpsc::Sender<SlashRecord>,
) {
    while let Some(item) = routed.recv().await {
        match item {
            Routed::Consensus(msg) => {
                if event_tx.send(ConsensusEvent::Message(msg)).await.is_err() {
                    return;
                }
            }
            Routed::Node(NodeMessage::Transactions(txs)) => pool.add_transactions(txs),
            Routed::Node(NodeMessage::StakingTransactions(txs)) => {
                pool.add_staking_transactions(txs)
            }
            Routed::Node(NodeMessage::CxReceipts(proofs)) => {
                let accepted = filter_incoming_receipts(shard_id, proofs);
                if !accepted.is_empty() {
                    pool.add_pending_receipts(accepted);
                }
            }
            Routed::Node(NodeMessage::SlashRecords(records)) => {
                // Mesh-delivered records take the relay's verify-and-queue
                // path on the beacon shard only; forwarding them elsewhere
                // would just echo them back onto the mesh.
                if is_beacon {
                    for record in records {
                        let _ = slash_tx.send(record).await;
                    }
                }
            }
            Routed::Node(NodeMessage::BroadcastedNewBlock(_)) => {
                // Client-group traffic; committee nodes learn blocks from
                // COMMITTED messages instead.
            }
        }
    }
}

/// Drops receipt batches that do not target this shard, plus anything
/// over the cross-shard message size cap. Misrouted batches are not an
/// error, they are simply someone else's mail.
pub fn filter_incoming_receipts(
    shard_id: ShardId,
    proofs: Vec<CxReceiptsProof>,
) -> Vec<CxReceiptsProof> {
    proofs
        .into_iter()
        .filter(|p| p.targets_shard(shard_id))
        .filter(|p| {
            bincode::serialized_size(p)
                .map(|size| size as usize <= boreal_chainspec::MAX_CROSS_TX_SIZE)
                .unwrap_or(false)
        })
        .collect()
}

/// Fires `ViewTimeout` whenever the view deadline passes. The deadline
/// is re-read after every sleep because commits and view changes move it.
async fn run_view_timer(
    timer: Arc<StdMutex<ConsensusTimer>>,
    event_tx: mpsc::Sender<ConsensusEvent>,
) {
    loop {
        let deadline = timer.lock().unwrap().view_deadline();
        tokio::time::sleep_until(deadline).await;

        let current = timer.lock().unwrap().view_deadline();
        if current > tokio::time::Instant::now() {
            // Somebody reset the clock while we slept.
            continue;
        }
        timer.lock().unwrap().on_view_change();
        if event_tx.send(ConsensusEvent::ViewTimeout).await.is_err() {
            return;
        }
    }
}

/// Periodic sync rounds; errors are swallowed at the round boundary.
async fn run_sync_watchdog<K, C>(
    syncer: Syncer<K>,
    chain: Arc<C>,
    peers_fn: impl Fn() -> Vec<libp2p::PeerId> + Send + Sync,
    interval: Duration,
) where
    K: SyncClient + 'static,
    C: ChainReader,
{
    loop {
        tokio::time::sleep(interval).await;
        let peers = peers_fn();
        if peers.is_empty() {
            continue;
        }
        let local_height = chain.current_header().number;
        if let Err(err) = syncer.run_round(peers, local_height).await {
            tracing::debug!(%err, "sync round failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use boreal_primitives::{CxMerkleProof, CxReceipt};

    fn proof_targeting(to_shard: ShardId) -> CxReceiptsProof {
        CxReceiptsProof {
            receipts: vec![CxReceipt {
                tx_hash: B256::repeat_byte(1),
                from: Address::with_last_byte(1),
                to: Address::with_last_byte(2),
                shard_id: 2,
                to_shard_id: to_shard,
                amount: 5,
            }],
            proof: CxMerkleProof {
                shard_id: 2,
                block_num: 3,
                block_hash: B256::repeat_byte(3),
                cx_receipt_root: B256::repeat_byte(4),
                shard_ids: vec![to_shard],
                cell_roots: vec![B256::repeat_byte(5)],
            },
        }
    }

    #[test]
    fn misrouted_receipts_are_dropped_without_error() {
        let accepted =
            filter_incoming_receipts(1, vec![proof_targeting(1), proof_targeting(3)]);
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].targets_shard(1));

        let none = filter_incoming_receipts(1, vec![proof_targeting(2)]);
        assert!(none.is_empty());
    }
}
