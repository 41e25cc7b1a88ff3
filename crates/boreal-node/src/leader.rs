//! The leader loop: wait for the proposal trigger, assemble the next
//! block, set the block cadence, and hand the block to the engine for
//! ANNOUNCE. Also kicks the epoch VDF off and feeds its output into the
//! next proposal.

use boreal_chainspec::ChainSpec;
use boreal_consensus::engine::ConsensusEvent;
use boreal_consensus::traits::{ChainReader, ChainStore, TxPool, VdfBackend};
use boreal_consensus::{vrf, BlockProposer, ConsensusTimer, FbftEngine, ProposalInputs};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

pub async fn run_leader_loop<C, P, B>(
    spec: ChainSpec,
    engine: Arc<Mutex<FbftEngine<C>>>,
    proposer: Arc<BlockProposer<C, P>>,
    chain: Arc<C>,
    vdf_backend: Arc<B>,
    timer: Arc<StdMutex<ConsensusTimer>>,
    mut proposal_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<ConsensusEvent>,
) where
    C: ChainReader + ChainStore + 'static,
    P: TxPool,
    B: VdfBackend + 'static,
{
    let (rnd_tx, mut rnd_rx) = mpsc::channel::<Vec<u8>>(4);

    while proposal_rx.recv().await.is_some() {
        let head = chain.current_header();
        let next_number = head.number + 1;

        // Recover the parent's commit signature from the store or the
        // still-warm FBFT log.
        let (view_id, last_commit) = {
            let engine = engine.lock().await;
            if !engine.is_leader() {
                tracing::debug!("proposal trigger while not leader, skipping");
                continue;
            }
            match engine.block_commit_sig(head.number) {
                Ok(sig) => (engine.view_id(), sig),
                Err(err) => {
                    tracing::error!(%err, "cannot recover parent commit signature");
                    continue;
                }
            }
        };

        // Epoch boundary: start the delay function on its own task; its
        // output lands on the randomness channel for a later proposal.
        let epoch = spec.epoch_of_block(next_number);
        if spec.is_epoch_last_block(next_number) {
            if let Some(seed) = vrf::vdf_seed(chain.as_ref(), epoch, spec.vdf_seed_size) {
                tracing::info!(epoch, "starting epoch vdf computation");
                vrf::start_vdf(vdf_backend.clone(), spec.vdf_difficulty, seed, rnd_tx.clone());
            }
        }
        let vdf_output = rnd_rx
            .try_recv()
            .ok()
            .map(|rnd| rnd[..boreal_primitives::VDF_OUTPUT_SIZE.min(rnd.len())].to_vec());

        let inputs = ProposalInputs {
            last_commit_signature: last_commit.0,
            last_commit_bitmap: last_commit.1,
            vdf_output,
        };

        let block = match proposer.propose(view_id, inputs) {
            Ok(block) => block,
            Err(err) => {
                tracing::error!(%err, "block proposal failed");
                continue;
            }
        };

        // The next block is due one block time from this proposal.
        timer.lock().unwrap().schedule_next_block();

        tracing::debug!(
            block_num = block.number(),
            view_id,
            txs = block.transactions.len(),
            "handing proposed block to consensus"
        );
        if event_tx.send(ConsensusEvent::ProposedBlock(block)).await.is_err() {
            tracing::error!("consensus event channel closed, stopping leader loop");
            return;
        }
    }
    tracing::info!("leader loop shut down");
}
