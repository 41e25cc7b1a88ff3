use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::bls::{BlsPublicKey, BlsSignature};
use crate::block::Header;

/// A header together with the offender's ballot signature over its hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub header: Header,
    pub signature: BlsSignature,
}

/// Proof of equivocation: the same validator signed two distinct headers
/// at the same (shard, block number, view). The beneficiary is the witness
/// that reported the pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashRecord {
    pub offender: BlsPublicKey,
    pub signed: SignedHeader,
    pub double_signed: SignedHeader,
    pub beneficiary: Address,
}

impl SlashRecord {
    /// True when the two headers name the same consensus slot but
    /// different blocks, the shape every valid record must have.
    pub fn is_conflicting_pair(&self) -> bool {
        let a = &self.signed.header;
        let b = &self.double_signed.header;
        a.shard_id == b.shard_id
            && a.number == b.number
            && a.view_id == b.view_id
            && a.hash() != b.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsSecretKey;
    use alloy_primitives::B256;

    fn header(view: u64, salt: u8) -> Header {
        Header {
            parent_hash: B256::repeat_byte(salt),
            number: 4,
            epoch: 0,
            view_id: view,
            shard_id: 1,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            tx_root: B256::ZERO,
            receipt_root: B256::ZERO,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
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
    fn conflicting_pair_requires_same_slot_different_hash() {
        let sk = BlsSecretKey::random().unwrap();
        let h1 = header(0, 0xaa);
        let h2 = header(0, 0xbb);
        let record = SlashRecord {
            offender: sk.public_key(),
            signed: SignedHeader { signature: sk.sign_hash(&h1.hash()), header: h1.clone() },
            double_signed: SignedHeader { signature: sk.sign_hash(&h2.hash()), header: h2 },
            beneficiary: Address::with_last_byte(7),
        };
        assert!(record.is_conflicting_pair());

        let same = SlashRecord {
            double_signed: record.signed.clone(),
            ..record.clone()
        };
        assert!(!same.is_conflicting_pair(), "identical headers are not a conflict");

        let other_view = SlashRecord {
            double_signed: SignedHeader {
                signature: sk.sign_hash(&header(1, 0xbb).hash()),
                header: header(1, 0xbb),
            },
            ..record
        };
        assert!(!other_view.is_conflicting_pair(), "different views are not a conflict");
    }
}
