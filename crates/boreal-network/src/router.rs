//! Topic demultiplexing with bounded concurrency. Each subscribed topic
//! gets a receiver whose in-flight handlers are capped by a counting
//! semaphore; a bounded queue in front tail-drops under overload so a
//! flooded topic degrades by shedding rather than by ballooning memory.

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::codec::{decode_topic_message, sane_topic_message, Routed};

/// In-flight handler cap per topic receiver.
pub const RX_INFLIGHT_LIMIT: usize = 200;

/// Worker-pool widths per topic class.
pub const CLIENT_RX_WORKERS: usize = 8;
pub const SHARD_RX_WORKERS: usize = 32;
pub const GLOBAL_RX_WORKERS: usize = 32;

/// Depth of the per-topic ingress queue.
pub const RX_QUEUE_SIZE: usize = 16384;

/// A raw message delivered by the overlay for one topic.
#[derive(Clone, Debug)]
pub struct TopicMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

/// Ingress handle for one topic; hand this to the overlay subscription.
#[derive(Clone, Debug)]
pub struct TopicInlet {
    queue_tx: mpsc::Sender<TopicMessage>,
}

impl TopicInlet {
    /// Enqueues a delivery. Overflow is tail-dropped with a warning; the
    /// overlay will re-gossip anything that matters.
    pub fn deliver(&self, msg: TopicMessage) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.queue_tx.try_send(msg) {
            metrics::counter!("boreal_router_dropped").increment(1);
            tracing::warn!(topic = %dropped.topic, "router queue full, dropping message");
        }
    }
}

/// Spawns the receiver for one topic: messages flow queue → sanity check
/// → decode → `out`, with at most `workers` handlers in flight.
pub fn spawn_topic_receiver(
    workers: usize,
    out: mpsc::Sender<Routed>,
) -> TopicInlet {
    let (queue_tx, mut queue_rx) = mpsc::channel::<TopicMessage>(RX_QUEUE_SIZE);
    let limiter = Arc::new(Semaphore::new(workers.min(RX_INFLIGHT_LIMIT)));

    tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            let permit = match limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    metrics::counter!("boreal_router_dropped").increment(1);
                    tracing::warn!(topic = %msg.topic, "all handlers busy, dropping message");
                    continue;
                }
            };

            let out = out.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if !sane_topic_message(&msg.data) {
                    tracing::debug!(topic = %msg.topic, "insane topic message dropped");
                    return;
                }
                match decode_topic_message(&msg.data) {
                    Ok(routed) => {
                        metrics::counter!("boreal_router_dispatched").increment(1);
                        if out.send(routed).await.is_err() {
                            tracing::debug!("router output closed");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(topic = %msg.topic, %err, "undecodable topic message");
                    }
                }
            });
        }
        tracing::info!("topic receiver shut down");
    });

    TopicInlet { queue_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_consensus_message, NodeMessage};
    use alloy_primitives::B256;
    use boreal_primitives::{BlsSecretKey, ConsensusMessage, Prepare};

    fn prepare_bytes() -> Vec<u8> {
        let sk = BlsSecretKey::random().unwrap();
        let hash = B256::repeat_byte(0x61);
        encode_consensus_message(&ConsensusMessage::Prepare(Prepare {
            shard_id: 1,
            view_id: 0,
            block_num: 2,
            block_hash: hash,
            voter: sk.public_key(),
            signature: sk.sign_hash(&hash),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn routes_valid_messages_to_output() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let inlet = spawn_topic_receiver(SHARD_RX_WORKERS, out_tx);

        inlet.deliver(TopicMessage { topic: "boreal/shard/1".into(), data: prepare_bytes() });

        let routed = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .expect("message should be routed")
            .expect("channel open");
        match routed {
            Routed::Consensus(msg) => assert_eq!(msg.block_num(), 2),
            Routed::Node(NodeMessage::BroadcastedNewBlock(_)) => panic!("wrong route"),
            other => panic!("unexpected routing: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_is_dropped_silently() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let inlet = spawn_topic_receiver(SHARD_RX_WORKERS, out_tx);

        inlet.deliver(TopicMessage { topic: "boreal/shard/1".into(), data: vec![0xde, 0xad] });
        inlet.deliver(TopicMessage { topic: "boreal/shard/1".into(), data: prepare_bytes() });

        // Only the valid message arrives.
        let routed = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(routed, Routed::Consensus(_)));
        assert!(out_rx.try_recv().is_err());
    }
}
