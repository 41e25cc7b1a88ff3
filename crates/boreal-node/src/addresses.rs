//! Per-epoch BLS-key → reward-address cache. Rebuilt from the committee
//! whenever the epoch moves, so readers never observe a half-updated
//! mapping from the previous committee.

use alloy_primitives::Address;
use boreal_consensus::CommitteeMember;
use boreal_primitives::BlsPublicKey;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct KeyAddressCache {
    epoch: Option<u64>,
    addresses: HashMap<BlsPublicKey, Address>,
}

impl KeyAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the reward address for a key at `epoch`, rebuilding the
    /// snapshot when the epoch changed. Post-staking callers pass
    /// `bls_derived` to map keys to their derived addresses instead of
    /// the committee's registered ones.
    pub fn address_for_key(
        &mut self,
        epoch: u64,
        committee: &[CommitteeMember],
        bls_derived: bool,
        key: &BlsPublicKey,
    ) -> Option<Address> {
        if self.epoch != Some(epoch) {
            self.rebuild(epoch, committee, bls_derived);
        }
        self.addresses.get(key).copied()
    }

    fn rebuild(&mut self, epoch: u64, committee: &[CommitteeMember], bls_derived: bool) {
        let mut addresses = HashMap::with_capacity(committee.len());
        for member in committee {
            let address = if bls_derived {
                member.public_key.to_address()
            } else {
                member.address
            };
            addresses.insert(member.public_key.clone(), address);
        }
        tracing::debug!(epoch, entries = addresses.len(), "rebuilt key-address cache");
        self.epoch = Some(epoch);
        self.addresses = addresses;
    }
}
