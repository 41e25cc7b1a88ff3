//! Leader-side block assembly: drains the mempool, selects cross-shard
//! receipts, folds in cross-links and slashes on the beacon shard,
//! recovers the parent commit signature and attaches the VRF.

use alloy_primitives::Address;
use boreal_chainspec::{ChainSpec, INCOMING_RECEIPTS_LIMIT};
use boreal_primitives::{
    crosslink::sort_cross_links, Block, BlsSecretKey, CrossLink, CxReceiptsProof, Header, ShardId,
    StakingTransaction, Transaction, ViewId, BEACON_SHARD_ID,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ConsensusError, ConsensusResult};
use crate::traits::{ChainError, ChainReader, ChainStore, TxPool};
use crate::vrf;

/// Inputs the node hands the proposer for one block.
#[derive(Clone, Debug, Default)]
pub struct ProposalInputs {
    /// Aggregate commit signature and bitmap of the parent block.
    pub last_commit_signature: Vec<u8>,
    pub last_commit_bitmap: Vec<u8>,
    /// Completed VDF output for this epoch, if the randomness channel has
    /// delivered one.
    pub vdf_output: Option<Vec<u8>>,
}

pub struct BlockProposer<C, P> {
    spec: ChainSpec,
    shard_id: ShardId,
    secret_key: BlsSecretKey,
    /// Pre-staking coinbase; post-staking blocks use the BLS-derived one.
    leader_address: Address,
    chain: Arc<C>,
    pool: Arc<P>,
}

impl<C, P> BlockProposer<C, P>
where
    C: ChainReader + ChainStore,
    P: TxPool,
{
    pub fn new(
        spec: ChainSpec,
        shard_id: ShardId,
        secret_key: BlsSecretKey,
        leader_address: Address,
        chain: Arc<C>,
        pool: Arc<P>,
    ) -> Self {
        Self { spec, shard_id, secret_key, leader_address, chain, pool }
    }

    /// Assembles the next block on top of the current head.
    pub fn propose(&self, view_id: ViewId, inputs: ProposalInputs) -> ConsensusResult<Block> {
        let parent = self.chain.current_header();
        let number = parent.number + 1;
        let epoch = self.spec.epoch_of_block(number);
        let staking = self.spec.is_staking(epoch);
        let is_beacon = self.shard_id == BEACON_SHARD_ID;

        let coinbase = if staking {
            self.secret_key.public_key().to_address()
        } else {
            self.leader_address
        };
        if coinbase == Address::ZERO {
            return Err(ConsensusError::Proposal { reason: "coinbase is the zero address".into() });
        }

        let (pending_plain, pending_staking) = self.pool.pending();
        let staking_txs: Vec<StakingTransaction> =
            if is_beacon && self.spec.is_prestaking(epoch) { pending_staking } else { Vec::new() };

        let gas_budget = parent.gas_limit;
        let selected = select_transactions(pending_plain, gas_budget);

        let receipts = self.propose_receipts();

        let cross_links = if is_beacon && self.spec.is_cross_link(epoch) {
            self.propose_cross_links()
        } else {
            Vec::new()
        };

        let slashes = if is_beacon && staking {
            self.chain.take_pending_slashes()
        } else {
            Vec::new()
        };

        let shard_state = if is_beacon && self.spec.is_epoch_last_block(number) {
            self.chain.next_shard_state(epoch + 1)?
        } else {
            Vec::new()
        };

        let execution = self.chain.execute_for_proposal(
            &parent,
            coinbase,
            selected,
            staking_txs,
        )?;

        let parent_hash = parent.hash();
        let vrf_payload = vrf::evaluate(&self.secret_key, &parent_hash);
        let vdf = inputs.vdf_output.unwrap_or_default();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let timestamp = now.max(parent.timestamp + 1);

        let header = Header {
            parent_hash,
            number,
            epoch,
            view_id,
            shard_id: self.shard_id,
            coinbase,
            state_root: execution.state_root,
            tx_root: execution.tx_root,
            receipt_root: execution.receipt_root,
            timestamp,
            gas_limit: gas_budget,
            gas_used: execution.gas_used,
            vrf: vrf_payload,
            vdf,
            shard_state,
            cross_links: encode_payload(&cross_links)?,
            slashes: encode_payload(&slashes)?,
            last_commit_signature: inputs.last_commit_signature,
            last_commit_bitmap: inputs.last_commit_bitmap,
        };

        tracing::info!(
            block_num = number,
            epoch,
            view_id,
            txs = execution.applied.len(),
            staking_txs = execution.applied_staking.len(),
            receipts = receipts.len(),
            cross_links = cross_links.len(),
            slashes = slashes.len(),
            "proposed new block"
        );
        metrics::counter!("boreal_blocks_proposed").increment(1);

        Ok(Block {
            header,
            transactions: execution.applied,
            staking_transactions: execution.applied_staking,
            incoming_receipts: receipts,
            commit_signature: Vec::new(),
            commit_bitmap: Vec::new(),
        })
    }

    /// Selects incoming cross-shard receipt proofs for this block: ordered
    /// by source (shard, number), spent and duplicated batches dropped,
    /// misrouted batches dropped, unverifiable batches either re-queued
    /// (missing shard state) or discarded.
    fn propose_receipts(&self) -> Vec<CxReceiptsProof> {
        let mut pending = self.pool.pending_receipts();
        pending.sort_by_key(CxReceiptsProof::key);

        let mut accepted = Vec::new();
        let mut requeue = Vec::new();
        let mut seen_source_hashes = std::collections::HashSet::new();
        let mut proposed_receipts = 0usize;

        for proof in pending {
            if proposed_receipts > INCOMING_RECEIPTS_LIMIT {
                requeue.push(proof);
                continue;
            }
            if self.chain.is_receipt_spent(&proof) {
                tracing::debug!(key = ?proof.key(), "receipt batch already spent");
                continue;
            }
            if !seen_source_hashes.insert(proof.proof.block_hash) {
                continue;
            }
            if !proof.targets_shard(self.shard_id) {
                continue;
            }
            match self.chain.validate_cx_receipts_proof(&proof) {
                Ok(()) => {
                    proposed_receipts += proof.receipts.len();
                    accepted.push(proof);
                }
                Err(ChainError::MissingShardState { .. }) => requeue.push(proof),
                Err(err) => {
                    tracing::error!(key = ?proof.key(), %err, "invalid receipt proof dropped");
                }
            }
        }

        if !requeue.is_empty() {
            self.pool.requeue_receipts(requeue);
        }
        accepted
    }

    /// Beacon-only: pending cross-links that are neither already on chain
    /// nor unverifiable, in (shard, number) order. Rejected links are
    /// deleted from the pending set.
    fn propose_cross_links(&self) -> Vec<CrossLink> {
        let pending = self.chain.read_pending_cross_links();
        let mut accepted = Vec::new();
        let mut invalid = Vec::new();

        for link in pending {
            if self.chain.read_cross_link(link.shard_id, link.block_num).is_some() {
                tracing::debug!(key = ?link.key(), "pending cross-link already committed");
                invalid.push(link);
                continue;
            }
            if let Err(err) = self.chain.verify_cross_link(&link) {
                tracing::debug!(key = ?link.key(), %err, "pending cross-link failed verification");
                invalid.push(link);
                continue;
            }
            accepted.push(link);
        }

        if !invalid.is_empty() {
            self.chain.delete_pending_cross_links(&invalid);
        }
        sort_cross_links(&mut accepted);
        accepted
    }
}

fn encode_payload<T: serde::Serialize>(items: &[T]) -> ConsensusResult<Vec<u8>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    bincode::serialize(items).map_err(|e| ConsensusError::Codec(e.to_string()))
}

/// Orders pending transactions for inclusion: nonce order within a
/// sender, and (gas price descending, address ascending) across senders,
/// stopping per sender once the gas budget would be exceeded.
pub fn select_transactions(
    pending: BTreeMap<Address, Vec<Transaction>>,
    gas_budget: u64,
) -> Vec<Transaction> {
    // Per-sender cursors over nonce-ordered queues.
    let mut queues: BTreeMap<Address, std::collections::VecDeque<Transaction>> = pending
        .into_iter()
        .map(|(addr, mut txs)| {
            txs.sort_by_key(|tx| tx.nonce);
            (addr, txs.into())
        })
        .collect();

    let mut selected = Vec::new();
    let mut gas_used = 0u64;

    loop {
        // The best head across senders: highest gas price, lowest address
        // breaking ties. BTreeMap iteration is address-ascending, so the
        // first strict maximum wins the tie.
        let best = queues
            .iter()
            .filter_map(|(addr, queue)| queue.front().map(|tx| (*addr, tx.gas_price)))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));

        let Some((addr, _)) = best else { break };
        let queue = queues.get_mut(&addr).expect("sender has a queue");
        let tx = queue.front().expect("queue has a head");

        if gas_used.saturating_add(tx.gas_limit) > gas_budget {
            // This sender's remaining transactions cannot skip the nonce,
            // so the whole queue is done for this block.
            queues.remove(&addr);
            continue;
        }

        let tx = queue.pop_front().expect("head exists");
        gas_used += tx.gas_limit;
        selected.push(tx);
        if queue.is_empty() {
            queues.remove(&addr);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(from: u8, nonce: u64, gas_price: u64) -> Transaction {
        Transaction {
            from: Address::with_last_byte(from),
            to: Address::with_last_byte(0xff),
            nonce,
            gas_price,
            gas_limit: 21_000,
            shard_id: 1,
            to_shard_id: 1,
            value: 1,
            data: Vec::new(),
        }
    }

    #[test]
    fn selection_orders_by_price_then_address() {
        let mut pending = BTreeMap::new();
        pending.insert(Address::with_last_byte(2), vec![tx(2, 0, 50)]);
        pending.insert(Address::with_last_byte(1), vec![tx(1, 0, 50), tx(1, 1, 90)]);
        pending.insert(Address::with_last_byte(3), vec![tx(3, 0, 70)]);

        let selected = select_transactions(pending, 1_000_000);
        let order: Vec<(u8, u64)> =
            selected.iter().map(|t| (t.from.as_slice()[19], t.nonce)).collect();

        // Sender 3 opens at 70. Senders 1 and 2 both head at 50; the lower
        // address wins, and only then does sender 1's 90-price follow-up
        // become eligible (nonce order within a sender is absolute).
        assert_eq!(order, vec![(3, 0), (1, 0), (1, 1), (2, 0)]);
    }

    #[test]
    fn selection_respects_gas_budget() {
        let mut pending = BTreeMap::new();
        pending.insert(Address::with_last_byte(1), vec![tx(1, 0, 10), tx(1, 1, 10), tx(1, 2, 10)]);

        let selected = select_transactions(pending, 45_000);
        assert_eq!(selected.len(), 2, "third transfer exceeds the budget");
    }

    #[test]
    fn selection_never_skips_a_nonce() {
        let mut pending = BTreeMap::new();
        let mut big = tx(1, 0, 10);
        big.gas_limit = 50_000;
        pending.insert(Address::with_last_byte(1), vec![big, tx(1, 1, 99)]);
        pending.insert(Address::with_last_byte(2), vec![tx(2, 0, 1)]);

        let selected = select_transactions(pending, 40_000);
        // Sender 1's first transaction does not fit, so its high-priced
        // successor must not be included either.
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].from, Address::with_last_byte(2));
    }

    #[test]
    fn selection_sorts_unordered_sender_queues() {
        let mut pending = BTreeMap::new();
        pending.insert(Address::with_last_byte(1), vec![tx(1, 2, 5), tx(1, 0, 5), tx(1, 1, 5)]);

        let selected = select_transactions(pending, 1_000_000);
        let nonces: Vec<u64> = selected.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2]);
    }
}
