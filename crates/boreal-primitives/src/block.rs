use alloy_primitives::{keccak256, Address, B256};
use serde::{Deserialize, Serialize};

use crate::receipt::CxReceiptsProof;
use crate::{BlockNumber, ShardId, ViewId};

/// VRF payload length: 32-byte output hash followed by the 96-byte proof.
pub const VRF_SIZE: usize = 128;

/// VDF output length.
pub const VDF_OUTPUT_SIZE: usize = 516;

/// Block header. Blocks are content-addressed by keccak256 over the
/// canonical (bincode) encoding of this struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: B256,
    pub number: BlockNumber,
    pub epoch: u64,
    pub view_id: ViewId,
    pub shard_id: ShardId,
    pub coinbase: Address,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipt_root: B256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Empty, or `VRF_SIZE` bytes: output hash followed by proof.
    pub vrf: Vec<u8>,
    /// Empty, or `VDF_OUTPUT_SIZE` bytes on an epoch-boundary block.
    pub vdf: Vec<u8>,
    /// Encoded next-epoch committee; non-empty only on the last beacon
    /// block of an epoch.
    pub shard_state: Vec<u8>,
    /// Encoded cross-links (beacon shard only).
    pub cross_links: Vec<u8>,
    /// Encoded slash records (beacon shard only).
    pub slashes: Vec<u8>,
    /// Aggregate commit signature of the parent block, filled in by the
    /// proposer from the previous round.
    pub last_commit_signature: Vec<u8>,
    /// Commit bitmap of the parent block, roster order.
    pub last_commit_bitmap: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> B256 {
        let encoded = bincode::serialize(self).expect("header serialization is infallible");
        keccak256(&encoded)
    }

    /// The VRF output hash, when a VRF is attached.
    pub fn vrf_hash(&self) -> Option<B256> {
        if self.vrf.len() != VRF_SIZE {
            return None;
        }
        Some(B256::from_slice(&self.vrf[..32]))
    }

    /// The VRF proof, when a VRF is attached.
    pub fn vrf_proof(&self) -> Option<&[u8]> {
        if self.vrf.len() != VRF_SIZE {
            return None;
        }
        Some(&self.vrf[32..])
    }

    pub fn has_vdf(&self) -> bool {
        self.vdf.len() == VDF_OUTPUT_SIZE
    }

    /// True on the last beacon block of an epoch, which carries the
    /// next-epoch committee.
    pub fn has_shard_state(&self) -> bool {
        !self.shard_state.is_empty()
    }
}

/// A plain value-transfer transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub shard_id: ShardId,
    pub to_shard_id: ShardId,
    pub value: u128,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> B256 {
        let encoded = bincode::serialize(self).expect("transaction serialization is infallible");
        keccak256(&encoded)
    }

    /// Cross-shard transfers leave receipts for the destination shard.
    pub fn is_cross_shard(&self) -> bool {
        self.shard_id != self.to_shard_id
    }
}

/// A staking directive. Accepted only on the beacon shard once the
/// pre-staking epoch has begun; the directive body is opaque to this core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingTransaction {
    pub from: Address,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub directive: Vec<u8>,
}

impl StakingTransaction {
    pub fn hash(&self) -> B256 {
        let encoded = bincode::serialize(self).expect("transaction serialization is infallible");
        keccak256(&encoded)
    }
}

/// A full block: header plus transaction lists and incoming cross-shard
/// receipt proofs.
///
/// `commit_signature`/`commit_bitmap` are the aggregate this block was
/// itself committed under. They are filled in at commit time and ride
/// outside the header, so they do not perturb the content address; the
/// header's `last_commit_*` fields carry the *parent's* aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    pub staking_transactions: Vec<StakingTransaction>,
    pub incoming_receipts: Vec<CxReceiptsProof>,
    pub commit_signature: Vec<u8>,
    pub commit_bitmap: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn shard_id(&self) -> ShardId {
        self.header.shard_id
    }

    pub fn epoch(&self) -> u64 {
        self.header.epoch
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Records the aggregate commit signature and bitmap this block was
    /// committed under. Called when a COMMITTED message finalizes the
    /// block, before it is handed to the chain store.
    pub fn set_commit_sig(&mut self, signature: Vec<u8>, bitmap: Vec<u8>) {
        self.commit_signature = signature;
        self.commit_bitmap = bitmap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_header(number: u64) -> Header {
        Header {
            parent_hash: B256::repeat_byte(0x11),
            number,
            epoch: 0,
            view_id: 0,
            shard_id: 1,
            coinbase: Address::with_last_byte(9),
            state_root: B256::ZERO,
            tx_root: B256::ZERO,
            receipt_root: B256::ZERO,
            timestamp: 1_700_000_000,
            gas_limit: 80_000_000,
            gas_used: 21_000,
            vrf: Vec::new(),
            vdf: Vec::new(),
            shard_state: Vec::new(),
            cross_links: Vec::new(),
            slashes: Vec::new(),
            last_commit_signature: Vec::new(),
            last_commit_bitmap: Vec::new(),
        }
    }

    #[test]
    fn header_hash_changes_with_content() {
        let h1 = sample_header(1);
        let mut h2 = sample_header(1);
        assert_eq!(h1.hash(), h2.hash());

        h2.view_id = 3;
        assert_ne!(h1.hash(), h2.hash(), "hash must cover the view id");
    }

    #[test]
    fn vrf_accessors() {
        let mut header = sample_header(2);
        assert!(header.vrf_hash().is_none());

        let mut vrf = vec![0xaa; 32];
        vrf.extend_from_slice(&[0xbb; 96]);
        header.vrf = vrf;
        assert_eq!(header.vrf_hash(), Some(B256::repeat_byte(0xaa)));
        assert_eq!(header.vrf_proof().unwrap().len(), 96);

        // A truncated payload is treated as absent, not misread.
        header.vrf.truncate(100);
        assert!(header.vrf_hash().is_none());
        assert!(header.vrf_proof().is_none());
    }

    #[test]
    fn block_encode_decode_roundtrip() {
        let block = Block {
            header: sample_header(5),
            transactions: vec![Transaction {
                from: Address::with_last_byte(1),
                to: Address::with_last_byte(2),
                nonce: 0,
                gas_price: 30,
                gas_limit: 21_000,
                shard_id: 1,
                to_shard_id: 1,
                value: 1_000,
                data: Vec::new(),
            }],
            staking_transactions: Vec::new(),
            incoming_receipts: Vec::new(),
            commit_signature: Vec::new(),
            commit_bitmap: Vec::new(),
        };

        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn cross_shard_detection() {
        let mut tx = Transaction {
            from: Address::with_last_byte(1),
            to: Address::with_last_byte(2),
            nonce: 0,
            gas_price: 1,
            gas_limit: 21_000,
            shard_id: 1,
            to_shard_id: 1,
            value: 5,
            data: Vec::new(),
        };
        assert!(!tx.is_cross_shard());
        tx.to_shard_id = 2;
        assert!(tx.is_cross_shard());
    }

    #[test]
    fn set_commit_sig_leaves_content_address_alone() {
        let mut block = Block {
            header: sample_header(7),
            transactions: Vec::new(),
            staking_transactions: Vec::new(),
            incoming_receipts: Vec::new(),
            commit_signature: Vec::new(),
            commit_bitmap: Vec::new(),
        };
        let before = block.hash();
        block.set_commit_sig(vec![1; 96], vec![0b1110_0000]);
        assert_eq!(block.commit_signature.len(), 96);
        assert_eq!(block.hash(), before, "own commit sig is not hashed content");
    }
}
