//! BLS-based VRF and the epoch VDF.
//!
//! The VRF is the signature construction: evaluating at a seed signs the
//! seed with the consensus key; the output hash is keccak256 of the
//! signature and the proof is the signature itself. Uniqueness of BLS
//! signatures makes the output unbiasable by the leader.
//!
//! The VDF seed folds the first `vdf_seed_size` VRF outputs of the epoch
//! together by XOR; execution runs on a blocking task and delivers
//! `output ‖ seed` on the randomness channel so proposal never stalls.

use alloy_primitives::{keccak256, B256};
use boreal_primitives::{BlsPublicKey, BlsSecretKey, BlsSignature, VDF_OUTPUT_SIZE, VRF_SIZE};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ConsensusError, ConsensusResult};
use crate::traits::{ChainReader, VdfBackend};

/// Length of a randomness-channel message: VDF output plus the seed it
/// was derived from.
pub const RND_SIZE: usize = VDF_OUTPUT_SIZE + 32;

/// Evaluates the VRF at `seed`, producing the header payload
/// `hash(32) ‖ proof(96)`.
pub fn evaluate(secret_key: &BlsSecretKey, seed: &B256) -> Vec<u8> {
    let proof = secret_key.sign_hash(seed);
    let hash = keccak256(proof.to_bytes());

    let mut out = Vec::with_capacity(VRF_SIZE);
    out.extend_from_slice(hash.as_slice());
    out.extend_from_slice(&proof.to_bytes());
    out
}

/// Verifies a VRF payload against the signer and seed, returning the
/// output hash on success.
pub fn verify(public_key: &BlsPublicKey, seed: &B256, vrf: &[u8]) -> ConsensusResult<B256> {
    if vrf.len() != VRF_SIZE {
        return Err(ConsensusError::InvalidHeader {
            block_num: 0,
            reason: format!("vrf payload is {} bytes, expected {VRF_SIZE}", vrf.len()),
        });
    }
    let claimed = B256::from_slice(&vrf[..32]);
    let proof = BlsSignature::from_slice(&vrf[32..])?;

    public_key
        .verify_hash(seed, &proof)
        .map_err(|_| ConsensusError::InvalidHeader {
            block_num: 0,
            reason: "vrf proof does not verify against the seed".to_string(),
        })?;

    let recomputed = keccak256(proof.to_bytes());
    if recomputed != claimed {
        return Err(ConsensusError::InvalidHeader {
            block_num: 0,
            reason: "vrf hash does not match its proof".to_string(),
        });
    }
    Ok(claimed)
}

/// Derives the epoch VDF seed: XOR of the first `seed_size` VRF outputs
/// recorded in the epoch. Returns `None` until enough VRFs exist.
pub fn vdf_seed<C: ChainReader>(chain: &C, epoch: u64, seed_size: usize) -> Option<[u8; 32]> {
    let vrf_numbers = chain.epoch_vrf_block_nums(epoch);
    if vrf_numbers.len() < seed_size {
        return None;
    }

    let mut seed = [0u8; 32];
    for &number in vrf_numbers.iter().take(seed_size) {
        let vrf = chain.vrf_by_number(number)?;
        for (byte, vrf_byte) in seed.iter_mut().zip(vrf.as_slice()) {
            *byte ^= vrf_byte;
        }
    }
    Some(seed)
}

/// Kicks off VDF execution on a blocking task. The result, `output ‖ seed`,
/// arrives on `rnd_tx` when the computation finishes.
pub fn start_vdf<B: VdfBackend + 'static>(
    backend: Arc<B>,
    difficulty: u64,
    seed: [u8; 32],
    rnd_tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        let started = std::time::Instant::now();
        let output = backend.execute(difficulty, seed);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vdf computation finished"
        );

        let mut rnd = Vec::with_capacity(RND_SIZE);
        rnd.extend_from_slice(&output);
        rnd.extend_from_slice(&seed);
        if rnd_tx.blocking_send(rnd).is_err() {
            tracing::warn!("randomness channel closed, dropping vdf output");
        }
    });
}

/// Validates a header's VDF output by re-deriving the epoch seed and
/// checking the output with the backend.
pub fn validate_vdf<C: ChainReader, B: VdfBackend>(
    chain: &C,
    backend: &B,
    difficulty: u64,
    seed_size: usize,
    epoch: u64,
    output: &[u8],
) -> bool {
    if output.len() != VDF_OUTPUT_SIZE {
        return false;
    }
    let Some(seed) = vdf_seed(chain, epoch, seed_size) else {
        // The epoch has not accumulated enough VRFs; an attached VDF can
        // only be premature output from a confused proposer.
        return false;
    };
    backend.verify(difficulty, seed, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_then_verify() {
        let sk = BlsSecretKey::random().unwrap();
        let seed = B256::repeat_byte(0x21);

        let vrf = evaluate(&sk, &seed);
        assert_eq!(vrf.len(), VRF_SIZE);

        let hash = verify(&sk.public_key(), &seed, &vrf).expect("own vrf verifies");
        assert_eq!(hash, B256::from_slice(&vrf[..32]));
    }

    #[test]
    fn verify_rejects_tampering() {
        let sk = BlsSecretKey::random().unwrap();
        let seed = B256::repeat_byte(0x21);
        let vrf = evaluate(&sk, &seed);

        // Wrong signer.
        let other = BlsSecretKey::random().unwrap();
        assert!(verify(&other.public_key(), &seed, &vrf).is_err());

        // Wrong seed.
        assert!(verify(&sk.public_key(), &B256::repeat_byte(0x22), &vrf).is_err());

        // Flipped output hash.
        let mut forged = vrf.clone();
        forged[0] ^= 0xff;
        assert!(verify(&sk.public_key(), &seed, &forged).is_err());

        // Truncated payload.
        assert!(verify(&sk.public_key(), &seed, &vrf[..64]).is_err());
    }

    #[test]
    fn vrf_is_deterministic_per_key_and_seed() {
        let sk = BlsSecretKey::random().unwrap();
        let seed = B256::repeat_byte(0x05);
        assert_eq!(evaluate(&sk, &seed), evaluate(&sk, &seed));
        assert_ne!(evaluate(&sk, &seed), evaluate(&sk, &B256::repeat_byte(0x06)));
    }
}
