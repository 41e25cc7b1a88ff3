//! The two block-processing loops behind the consensus engine: one
//! inserts committed blocks and runs post-consensus work, one validates
//! candidate bodies. Each request carries its own reply channel so the
//! sender decides whether a failure is retryable or fatal.

use boreal_consensus::traits::{ChainError, ChainReader, ChainStore};
use boreal_network::{Broadcaster, Overlay};
use boreal_primitives::Block;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A block plus the channel its outcome is reported on.
pub type BlockRequest = (Block, oneshot::Sender<Result<(), ChainError>>);

/// Drains committed blocks: append to the chain store, persist the
/// commit signature, and announce the accepted block to the client
/// group. Insertion failures surface on the reply channel; the caller
/// treats storage failures as fatal.
pub async fn run_round_completed_loop<C, O>(
    chain: Arc<C>,
    broadcaster: Arc<Broadcaster<O>>,
    mut requests: mpsc::Receiver<BlockRequest>,
) where
    C: ChainReader + ChainStore,
    O: Overlay,
{
    while let Some((block, reply)) = requests.recv().await {
        let number = block.number();
        let result = insert_committed_block(chain.as_ref(), &block);

        if result.is_ok() {
            metrics::counter!("boreal_blocks_inserted").increment(1);
            tracing::info!(block_num = number, hash = %block.hash(), "inserted committed block");
            if let Err(err) = broadcaster.accepted_block(&block).await {
                // Best-effort: clients re-sync if they miss it.
                tracing::warn!(block_num = number, %err, "accepted-block broadcast failed");
            }
        }

        if reply.send(result).is_err() {
            tracing::debug!(block_num = number, "round-completed requester went away");
        }
    }
    tracing::info!("round-completed loop shut down");
}

/// Appends the block and records its commit signature by number.
pub fn insert_committed_block<C>(chain: &C, block: &Block) -> Result<(), ChainError>
where
    C: ChainReader + ChainStore,
{
    chain.insert_block(block.clone())?;
    if !block.commit_signature.is_empty() {
        chain.write_commit_sig(
            block.number(),
            block.commit_signature.clone(),
            block.commit_bitmap.clone(),
        );
    }
    Ok(())
}

/// Drains candidate blocks from the consensus engine and answers with
/// the body-validation verdict.
pub async fn run_verify_loop<C>(chain: Arc<C>, mut requests: mpsc::Receiver<BlockRequest>)
where
    C: ChainReader,
{
    while let Some((block, reply)) = requests.recv().await {
        let result = chain.validate_block(&block);
        if let Err(ref err) = result {
            tracing::warn!(block_num = block.number(), %err, "candidate block failed validation");
        }
        if reply.send(result).is_err() {
            tracing::debug!("verify requester went away");
        }
    }
    tracing::info!("verify loop shut down");
}

/// Drains blocks pulled by the syncer and appends them in order. A block
/// that does not extend the head is dropped; the next round will fetch
/// the right one.
pub async fn run_incoming_blocks_loop<C>(chain: Arc<C>, mut incoming: mpsc::Receiver<Block>)
where
    C: ChainReader + ChainStore,
{
    while let Some(block) = incoming.recv().await {
        let head = chain.current_header();
        if block.number() != head.number + 1 || block.parent_hash() != head.hash() {
            tracing::debug!(
                block_num = block.number(),
                head = head.number,
                "synced block does not extend the head, dropping"
            );
            continue;
        }
        match insert_committed_block(chain.as_ref(), &block) {
            Ok(()) => {
                metrics::counter!("boreal_sync_blocks_inserted").increment(1);
                tracing::info!(block_num = block.number(), "inserted synced block");
            }
            Err(err) => {
                tracing::warn!(block_num = block.number(), %err, "synced block insert failed");
            }
        }
    }
}
