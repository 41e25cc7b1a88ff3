//! Outbound fan-out to topic groups with bounded retry. Delivery is
//! best-effort and idempotent at the receiver; nothing here waits for
//! acknowledgements.

use boreal_chainspec::NUM_TRY_BROADCAST;
use boreal_primitives::{
    Block, ConsensusMessage, ShardId, SlashRecord, StakingTransaction, Transaction,
    BEACON_SHARD_ID,
};
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::codec::{encode_consensus_message, encode_node_message, NodeMessage};
use crate::error::{NetworkError, NetworkResult};
use crate::topics::{beacon_topic, client_topic, shard_topic};

/// The only capability the broadcaster needs from the overlay: publish
/// bytes to a named topic.
pub trait Overlay: Send + Sync {
    fn publish(&self, topic: String, data: Vec<u8>) -> BoxFuture<'_, NetworkResult<()>>;
}

pub struct Broadcaster<O> {
    overlay: Arc<O>,
    shard_id: ShardId,
}

impl<O: Overlay> Broadcaster<O> {
    pub fn new(overlay: Arc<O>, shard_id: ShardId) -> Self {
        Self { overlay, shard_id }
    }

    /// Publishes with up to `NUM_TRY_BROADCAST` attempts. Failures after
    /// the last attempt are returned but callers treat them as advisory.
    async fn try_broadcast(&self, topic: String, data: Vec<u8>) -> NetworkResult<()> {
        let mut last_err = None;
        for attempt in 0..NUM_TRY_BROADCAST {
            match self.overlay.publish(topic.clone(), data.clone()).await {
                Ok(()) => {
                    metrics::counter!("boreal_broadcasts_sent").increment(1);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(%topic, attempt, %err, "broadcast attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(NetworkError::ChannelClosed))
    }

    /// FBFT traffic goes to the shard committee group.
    pub async fn consensus_message(&self, msg: &ConsensusMessage) -> NetworkResult<()> {
        let data = encode_consensus_message(msg)?;
        self.try_broadcast(shard_topic(self.shard_id).to_string(), data).await
    }

    /// Plain transactions go to the source shard's group.
    pub async fn new_transaction(&self, tx: Transaction) -> NetworkResult<()> {
        let topic = shard_topic(tx.shard_id).to_string();
        let data = encode_node_message(&NodeMessage::Transactions(vec![tx]))?;
        self.try_broadcast(topic, data).await
    }

    /// Staking transactions always go to the beacon group.
    pub async fn new_staking_transaction(&self, tx: StakingTransaction) -> NetworkResult<()> {
        let data = encode_node_message(&NodeMessage::StakingTransactions(vec![tx]))?;
        self.try_broadcast(beacon_topic().to_string(), data).await
    }

    /// An accepted block goes to this shard's client group.
    pub async fn accepted_block(&self, block: &Block) -> NetworkResult<()> {
        if block.shard_id() != self.shard_id {
            return Err(NetworkError::Publish {
                topic: client_topic(self.shard_id).to_string(),
                reason: format!(
                    "block belongs to shard {}, we serve shard {}",
                    block.shard_id(),
                    self.shard_id
                ),
            });
        }
        let data = encode_node_message(&NodeMessage::BroadcastedNewBlock(block.encode()))?;
        self.try_broadcast(client_topic(self.shard_id).to_string(), data).await
    }

    /// Double-sign records go to the beacon group for inclusion.
    pub async fn new_slash_record(&self, record: SlashRecord) -> NetworkResult<()> {
        let data = encode_node_message(&NodeMessage::SlashRecords(vec![record]))?;
        let result = self.try_broadcast(beacon_topic().to_string(), data).await;
        if result.is_ok() {
            tracing::info!("broadcast double-sign record to the beacon group");
        }
        result
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// True when this node serves the beacon shard and keeps slash
    /// records locally instead of broadcasting them.
    pub fn is_beacon(&self) -> bool {
        self.shard_id == BEACON_SHARD_ID
    }
}
