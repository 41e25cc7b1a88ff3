//! Double-sign slash records: verification of reported evidence and the
//! stake reduction applied when a record lands in a beacon block.

use alloy_primitives::Address;
use boreal_primitives::{BlsPublicKey, SlashRecord};

use crate::error::{ConsensusError, ConsensusResult};
use crate::quorum::CommitteeMember;

/// Fraction of the offender's effective stake burned per record: 2%.
pub const SLASH_RATE_NUM: u64 = 2;
pub const SLASH_RATE_DEN: u64 = 100;

/// Share of the slashed amount credited to the reporting beneficiary.
pub const BENEFICIARY_SHARE_DEN: u64 = 2;

/// Staking state surface the slash application mutates. Owned by the
/// staking module; this core only names the operations it needs.
pub trait StakingBackend {
    fn effective_stake(&self, key: &BlsPublicKey) -> Option<u64>;
    fn set_effective_stake(&mut self, key: &BlsPublicKey, stake: u64);
    fn credit(&mut self, address: Address, amount: u64);
    /// Records the cumulative slashed amount on the offender's entry.
    fn record_slash(&mut self, key: &BlsPublicKey, amount: u64);
}

/// Verifies a reported double-sign record against the committee that was
/// active at the offending slot.
pub fn verify(committee: &[CommitteeMember], record: &SlashRecord) -> ConsensusResult<()> {
    if !committee.iter().any(|m| m.public_key == record.offender) {
        return Err(ConsensusError::SlashVerify {
            reason: "offender is not a committee member".to_string(),
        });
    }

    if record.beneficiary == Address::ZERO {
        return Err(ConsensusError::SlashVerify {
            reason: "beneficiary address is zero".to_string(),
        });
    }

    if !record.is_conflicting_pair() {
        return Err(ConsensusError::SlashVerify {
            reason: "headers do not form a conflicting pair".to_string(),
        });
    }

    let first_hash = record.signed.header.hash();
    record
        .offender
        .verify_hash(&first_hash, &record.signed.signature)
        .map_err(|_| ConsensusError::SlashVerify {
            reason: "signature over the first header does not verify".to_string(),
        })?;

    let second_hash = record.double_signed.header.hash();
    record
        .offender
        .verify_hash(&second_hash, &record.double_signed.signature)
        .map_err(|_| ConsensusError::SlashVerify {
            reason: "signature over the second header does not verify".to_string(),
        })?;

    Ok(())
}

/// Applies verified records: burns the protocol fraction of the
/// offender's effective stake, credits half of it to the beneficiary and
/// records the slashed amount. Returns the total amount slashed.
pub fn apply<S: StakingBackend>(state: &mut S, records: &[SlashRecord]) -> u64 {
    let mut total = 0u64;
    for record in records {
        let Some(stake) = state.effective_stake(&record.offender) else {
            tracing::warn!(offender = ?record.offender, "slash offender has no staking entry");
            continue;
        };

        let slashed = stake.saturating_mul(SLASH_RATE_NUM) / SLASH_RATE_DEN;
        if slashed == 0 {
            continue;
        }

        state.set_effective_stake(&record.offender, stake - slashed);
        state.credit(record.beneficiary, slashed / BENEFICIARY_SHARE_DEN);
        state.record_slash(&record.offender, slashed);
        total = total.saturating_add(slashed);

        tracing::info!(
            offender = ?record.offender,
            slashed,
            beneficiary = %record.beneficiary,
            "applied double-sign slash"
        );
    }
    total
}
