//! Topic-message encoding: a one-byte service category in front of the
//! bincode payload, plus lightweight pre-dispatch validation.

use alloy_primitives::keccak256;
use boreal_primitives::wire::{decode_envelope, encode_envelope, ServiceCategory, MAX_WIRE_MESSAGE};
use boreal_primitives::{
    ConsensusMessage, CxReceiptsProof, SlashRecord, StakingTransaction, Transaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// Node-category payloads: everything on the topic mesh that is not an
/// FBFT message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeMessage {
    /// An accepted block, published to the shard's client group.
    BroadcastedNewBlock(Vec<u8>),
    Transactions(Vec<Transaction>),
    StakingTransactions(Vec<StakingTransaction>),
    SlashRecords(Vec<SlashRecord>),
    /// Outgoing receipt batches relayed toward their destination shard.
    CxReceipts(Vec<CxReceiptsProof>),
}

/// A decoded, category-dispatched topic message.
#[derive(Clone, Debug)]
pub enum Routed {
    Consensus(ConsensusMessage),
    Node(NodeMessage),
}

pub fn encode_consensus_message(msg: &ConsensusMessage) -> NetworkResult<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| NetworkError::Codec(e.to_string()))?;
    Ok(encode_envelope(ServiceCategory::Consensus, &payload))
}

pub fn encode_node_message(msg: &NodeMessage) -> NetworkResult<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| NetworkError::Codec(e.to_string()))?;
    Ok(encode_envelope(ServiceCategory::Node, &payload))
}

/// Decodes a topic message into its routed form. Client-support traffic
/// runs on dedicated streams, not the topic mesh, and drand is carried
/// for forward compatibility only; both are rejected here.
pub fn decode_topic_message(data: &[u8]) -> NetworkResult<Routed> {
    let (category, payload) = decode_envelope(data)?;
    match category {
        ServiceCategory::Consensus => {
            let msg = bincode::deserialize(payload)
                .map_err(|e| NetworkError::Codec(e.to_string()))?;
            Ok(Routed::Consensus(msg))
        }
        ServiceCategory::Node => {
            let msg = bincode::deserialize(payload)
                .map_err(|e| NetworkError::Codec(e.to_string()))?;
            Ok(Routed::Node(msg))
        }
        ServiceCategory::ClientSupport | ServiceCategory::Drand => Err(NetworkError::Codec(
            format!("category {category:?} does not belong on the topic mesh"),
        )),
    }
}

/// Cheap sanity check before a message enters a worker queue: non-empty,
/// size-bounded, known category. Full semantic validation stays with the
/// consensus engine.
pub fn sane_topic_message(data: &[u8]) -> bool {
    if data.is_empty() || data.len() > MAX_WIRE_MESSAGE {
        return false;
    }
    decode_envelope(data).is_ok()
}

/// Deduplication id for the overlay: a cryptographic hash, so identical
/// messages relayed over different paths collapse to one delivery.
pub fn message_id(topic: &str, data: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(topic.len() + data.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(topic.as_bytes());
    keccak256(&buf).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use boreal_primitives::{BlsSecretKey, Prepare};

    fn sample_consensus_message() -> ConsensusMessage {
        let sk = BlsSecretKey::random().unwrap();
        let hash = B256::repeat_byte(0x31);
        ConsensusMessage::Prepare(Prepare {
            shard_id: 1,
            view_id: 0,
            block_num: 4,
            block_hash: hash,
            voter: sk.public_key(),
            signature: sk.sign_hash(&hash),
        })
    }

    #[test]
    fn consensus_roundtrip_through_topic_encoding() {
        let msg = sample_consensus_message();
        let encoded = encode_consensus_message(&msg).unwrap();
        assert!(sane_topic_message(&encoded));

        match decode_topic_message(&encoded).unwrap() {
            Routed::Consensus(decoded) => {
                assert_eq!(decoded.block_num(), msg.block_num());
                assert_eq!(decoded.block_hash(), msg.block_hash());
            }
            other => panic!("expected consensus routing, got {other:?}"),
        }
    }

    #[test]
    fn node_roundtrip_through_topic_encoding() {
        let msg = NodeMessage::Transactions(vec![Transaction {
            from: Address::with_last_byte(1),
            to: Address::with_last_byte(2),
            nonce: 3,
            gas_price: 4,
            gas_limit: 21_000,
            shard_id: 1,
            to_shard_id: 1,
            value: 5,
            data: Vec::new(),
        }]);
        let encoded = encode_node_message(&msg).unwrap();

        match decode_topic_message(&encoded).unwrap() {
            Routed::Node(NodeMessage::Transactions(txs)) => assert_eq!(txs[0].nonce, 3),
            other => panic!("expected node transactions, got {other:?}"),
        }
    }

    #[test]
    fn sanity_rejects_garbage() {
        assert!(!sane_topic_message(&[]));
        assert!(!sane_topic_message(&[0x7f, 1, 2, 3]), "unknown category");

        let mut oversized = vec![0x00];
        oversized.resize(MAX_WIRE_MESSAGE + 2, 0);
        assert!(!sane_topic_message(&oversized));
    }

    #[test]
    fn client_support_rejected_on_topics() {
        let enveloped = boreal_primitives::wire::encode_envelope(
            ServiceCategory::ClientSupport,
            &[1, 2, 3],
        );
        assert!(decode_topic_message(&enveloped).is_err());
    }

    #[test]
    fn message_id_depends_on_topic_and_payload() {
        let a = message_id("boreal/shard/1", b"payload");
        let b = message_id("boreal/shard/2", b"payload");
        let c = message_id("boreal/shard/1", b"other");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, message_id("boreal/shard/1", b"payload"));
    }
}
