use blst::min_pk::{AggregatePublicKey, AggregateSignature as BlstAggSig};
use blst::BLST_ERROR;

use super::keys::{BlsError, BlsPublicKey, BlsSignature};
use super::DST;

/// Multi-signature helpers. An aggregate is the product of individual
/// signatures; verification runs against the subset of committee keys the
/// accompanying bitmap selects, all over one common message.
pub struct AggregateSignature;

impl AggregateSignature {
    /// Aggregates signatures into one. Errors on an empty set.
    pub fn aggregate(signatures: &[&BlsSignature]) -> Result<BlsSignature, BlsError> {
        if signatures.is_empty() {
            return Err(BlsError::EmptyAggregation);
        }
        let sigs: Vec<&blst::min_pk::Signature> = signatures.iter().map(|s| s.inner()).collect();
        let agg = BlstAggSig::aggregate(&sigs, true).map_err(BlsError::VerificationFailed)?;
        Ok(BlsSignature(agg.to_signature()))
    }

    /// Verifies an aggregate over a single message against the signing
    /// subset of the committee.
    pub fn verify(
        message: &[u8],
        signature: &BlsSignature,
        signers: &[&BlsPublicKey],
    ) -> Result<(), BlsError> {
        if signers.is_empty() {
            return Err(BlsError::EmptyAggregation);
        }
        let pks: Vec<&blst::min_pk::PublicKey> = signers.iter().map(|pk| pk.inner()).collect();
        let result = signature.inner().fast_aggregate_verify(true, message, DST, &pks);
        if result != BLST_ERROR::BLST_SUCCESS {
            return Err(BlsError::VerificationFailed(result));
        }
        Ok(())
    }

    /// Combines the signing subset into one aggregate public key. Used
    /// where a single masked committee key is needed rather than a
    /// verification result.
    pub fn aggregate_keys(signers: &[&BlsPublicKey]) -> Result<BlsPublicKey, BlsError> {
        if signers.is_empty() {
            return Err(BlsError::EmptyAggregation);
        }
        let pks: Vec<&blst::min_pk::PublicKey> = signers.iter().map(|pk| pk.inner()).collect();
        let agg =
            AggregatePublicKey::aggregate(&pks, true).map_err(BlsError::VerificationFailed)?;
        Ok(BlsPublicKey::from_bytes(&agg.to_public_key().to_bytes())
            .expect("aggregate of valid keys is a valid key"))
    }
}
