//! Slash-candidate relay. On the beacon shard, verified records join the
//! pending queue the proposer drains; everywhere else they are broadcast
//! toward the beacon group.

use boreal_consensus::{slash, CommitteeMember};
use boreal_consensus::traits::ChainStore;
use boreal_network::{Broadcaster, Overlay};
use boreal_primitives::SlashRecord;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn run_slash_relay<C, O>(
    is_beacon: bool,
    committee: Vec<CommitteeMember>,
    chain: Arc<C>,
    broadcaster: Arc<Broadcaster<O>>,
    mut candidates: mpsc::Receiver<SlashRecord>,
) where
    C: ChainStore,
    O: Overlay,
{
    while let Some(record) = candidates.recv().await {
        if is_beacon {
            match slash::verify(&committee, &record) {
                Ok(()) => {
                    tracing::info!(offender = ?record.offender, "queueing verified slash record");
                    chain.add_pending_slash(record);
                }
                Err(err) => {
                    tracing::warn!(%err, "rejected slash candidate");
                }
            }
        } else if let Err(err) = broadcaster.new_slash_record(record).await {
            tracing::warn!(%err, "failed to relay slash record to the beacon group");
        }
    }
    tracing::info!("slash relay shut down");
}
