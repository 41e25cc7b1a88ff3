//! Per-phase ballot tallying for one consensus slot. Tracks the ordered
//! committee roster with stake weights, decides when two-thirds of voting
//! power has signed, and folds ballots into an aggregate signature plus a
//! roster-order bitmap.

use alloy_primitives::{Address, B256};
use bitvec::prelude::*;
use boreal_primitives::{
    AggregateSignature, BlockNumber, BlsPublicKey, BlsSignature, ViewId,
};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{ConsensusError, ConsensusResult};

/// Ballot phases the decider tallies independently. `ViewId` and `Nil`
/// belong to the view-change sub-protocol (m3 and m2 signatures).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VotePhase {
    Prepare,
    Commit,
    ViewId,
    Nil,
}

const PHASE_COUNT: usize = 4;

fn phase_slot(phase: VotePhase) -> usize {
    match phase {
        VotePhase::Prepare => 0,
        VotePhase::Commit => 1,
        VotePhase::ViewId => 2,
        VotePhase::Nil => 3,
    }
}

/// One recorded vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ballot {
    pub voter: BlsPublicKey,
    pub signature: BlsSignature,
    pub block_hash: B256,
    pub block_num: BlockNumber,
    pub view_id: ViewId,
}

/// One committee seat, in roster order.
#[derive(Clone, Debug)]
pub struct CommitteeMember {
    pub public_key: BlsPublicKey,
    pub address: Address,
    /// `None` for externally unweighted members; they vote with weight 1.
    pub effective_stake: Option<u64>,
}

impl From<&boreal_chainspec::ValidatorInfo> for CommitteeMember {
    fn from(info: &boreal_chainspec::ValidatorInfo) -> Self {
        Self {
            public_key: info.bls_public_key.clone(),
            address: info.address,
            effective_stake: info.effective_stake,
        }
    }
}

/// What `submit_vote` did with a ballot.
#[derive(Clone, Debug)]
pub enum SubmitOutcome {
    /// First ballot from this voter in this phase; it counts.
    Counted,
    /// Identical re-submission; nothing changed.
    AlreadyCounted,
    /// The voter already signed a different block hash at the same
    /// (phase, number, view): double-sign evidence. The new ballot does
    /// not count. The existing ballot is returned exactly once per
    /// conflicting pair so a slash record is produced exactly once.
    Conflict { existing: Option<Ballot>, offending: Ballot },
}

#[derive(Debug)]
pub struct QuorumDecider {
    members: Vec<CommitteeMember>,
    index: HashMap<BlsPublicKey, usize>,
    /// Stake-weighted voting once the staking epoch is active.
    stake_weighted: bool,
    total_weight: u128,
    /// Roster index → ballot, per phase. BTreeMap keeps roster-order
    /// iteration for aggregation tie-breaks.
    ballots: [BTreeMap<usize, Ballot>; PHASE_COUNT],
    /// Conflicts already reported, so evidence is emitted exactly once.
    reported_conflicts: HashSet<(usize, usize, B256)>,
}

impl QuorumDecider {
    pub fn new(members: Vec<CommitteeMember>, stake_weighted: bool) -> ConsensusResult<Self> {
        if members.is_empty() {
            return Err(ConsensusError::EmptyCommittee);
        }
        let mut index = HashMap::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            index.insert(member.public_key.clone(), i);
        }
        let total_weight = members
            .iter()
            .map(|m| member_weight(m, stake_weighted))
            .sum();
        Ok(Self {
            members,
            index,
            stake_weighted,
            total_weight,
            ballots: Default::default(),
            reported_conflicts: HashSet::new(),
        })
    }

    pub fn committee_size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[CommitteeMember] {
        &self.members
    }

    pub fn member(&self, index: usize) -> Option<&CommitteeMember> {
        self.members.get(index)
    }

    pub fn total_weight(&self) -> u128 {
        self.total_weight
    }

    pub fn index_of(&self, key: &BlsPublicKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn is_member(&self, key: &BlsPublicKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn read_ballot(&self, phase: VotePhase, key: &BlsPublicKey) -> Option<&Ballot> {
        let idx = self.index_of(key)?;
        self.ballots[phase_slot(phase)].get(&idx)
    }

    /// Records a ballot. Unknown voters are rejected; identical ballots
    /// are idempotent; conflicting ballots are surfaced as evidence and
    /// not counted.
    pub fn submit_vote(&mut self, phase: VotePhase, ballot: Ballot) -> ConsensusResult<SubmitOutcome> {
        let Some(idx) = self.index_of(&ballot.voter) else {
            return Err(ConsensusError::UnknownVoter { voter: ballot.voter });
        };

        let slot = phase_slot(phase);
        if let Some(existing) = self.ballots[slot].get(&idx) {
            let same_slot = existing.block_num == ballot.block_num
                && existing.view_id == ballot.view_id;
            if same_slot && existing.block_hash == ballot.block_hash {
                return Ok(SubmitOutcome::AlreadyCounted);
            }
            if same_slot {
                // Same (phase, number, view), different hash: equivocation.
                let conflict_key = (slot, idx, ballot.block_hash);
                let first_report = self.reported_conflicts.insert(conflict_key);
                let existing = first_report.then(|| existing.clone());
                return Ok(SubmitOutcome::Conflict { existing, offending: ballot });
            }
            // A vote for a newer slot (view-change ballots walk forward
            // through candidate views) supersedes the old one.
        }

        self.ballots[slot].insert(idx, ballot);
        Ok(SubmitOutcome::Counted)
    }

    pub fn signers_count(&self, phase: VotePhase) -> usize {
        self.ballots[phase_slot(phase)].len()
    }

    fn accumulated_weight(&self, phase: VotePhase) -> u128 {
        self.ballots[phase_slot(phase)]
            .keys()
            .map(|&idx| member_weight(&self.members[idx], self.stake_weighted))
            .sum()
    }

    /// Strictly more than two-thirds of total voting power has signed.
    pub fn is_quorum_achieved(&self, phase: VotePhase) -> bool {
        3 * self.accumulated_weight(phase) > 2 * self.total_weight
    }

    /// Every committee member has a commit ballot.
    pub fn is_all_sigs_collected(&self) -> bool {
        self.signers_count(VotePhase::Commit) == self.members.len()
    }

    /// Aggregates the phase's ballots: signature product plus a set bit
    /// for each signer, in roster order.
    pub fn aggregate(&self, phase: VotePhase) -> ConsensusResult<(BlsSignature, BitVec<u8, Msb0>)> {
        let ballots = &self.ballots[phase_slot(phase)];
        let signatures: Vec<&BlsSignature> = ballots.values().map(|b| &b.signature).collect();
        let aggregate = AggregateSignature::aggregate(&signatures)?;

        let mut bitmap = bitvec![u8, Msb0; 0; self.members.len()];
        for &idx in ballots.keys() {
            bitmap.set(idx, true);
        }
        Ok((aggregate, bitmap))
    }

    /// Resolves a received bitmap into the signer keys it names.
    pub fn keys_for_bitmap(&self, bitmap: &BitVec<u8, Msb0>) -> ConsensusResult<Vec<&BlsPublicKey>> {
        // Trailing padding bits inside the last byte must stay unset.
        if bitmap.iter_ones().any(|idx| idx >= self.members.len()) {
            return Err(ConsensusError::BitmapOutOfRange {
                bits: bitmap.len(),
                committee: self.members.len(),
            });
        }
        Ok(bitmap.iter_ones().map(|idx| &self.members[idx].public_key).collect())
    }

    /// Total voting power of the signers a bitmap names.
    pub fn bitmap_weight(&self, bitmap: &BitVec<u8, Msb0>) -> ConsensusResult<u128> {
        if bitmap.iter_ones().any(|idx| idx >= self.members.len()) {
            return Err(ConsensusError::BitmapOutOfRange {
                bits: bitmap.len(),
                committee: self.members.len(),
            });
        }
        Ok(bitmap
            .iter_ones()
            .map(|idx| member_weight(&self.members[idx], self.stake_weighted))
            .sum())
    }

    /// Checks that a bitmap's signers clear the two-thirds threshold.
    pub fn check_bitmap_quorum(&self, bitmap: &BitVec<u8, Msb0>) -> ConsensusResult<()> {
        let have = self.bitmap_weight(bitmap)?;
        if 3 * have <= 2 * self.total_weight {
            return Err(ConsensusError::InsufficientWeight { have, total: self.total_weight });
        }
        Ok(())
    }

    /// Clears one phase's ballots (used when a view change settles).
    pub fn reset_phase(&mut self, phase: VotePhase) {
        self.ballots[phase_slot(phase)].clear();
    }

    /// Clears all tallies for the next consensus slot.
    pub fn reset(&mut self) {
        for slot in &mut self.ballots {
            slot.clear();
        }
        self.reported_conflicts.clear();
    }
}

fn member_weight(member: &CommitteeMember, stake_weighted: bool) -> u128 {
    if stake_weighted {
        u128::from(member.effective_stake.unwrap_or(1))
    } else {
        1
    }
}
