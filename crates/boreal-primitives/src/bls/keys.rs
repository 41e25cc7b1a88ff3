use alloy_primitives::{hex, keccak256, Address, B256};
use blst::min_pk::{PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DST, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

#[derive(Debug, Error)]
pub enum BlsError {
    #[error("key generation failed")]
    KeyGeneration,
    #[error("cannot aggregate an empty signature set")]
    EmptyAggregation,
    #[error("signature verification failed: {0:?}")]
    VerificationFailed(BLST_ERROR),
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("invalid secret key encoding")]
    InvalidSecretKey,
}

/// A validator's BLS signing key. `Debug` prints only the public key.
#[derive(Clone)]
pub struct BlsSecretKey(SecretKey);

impl BlsSecretKey {
    pub fn random() -> Result<Self, BlsError> {
        let mut ikm = [0u8; 32];
        getrandom::fill(&mut ikm).map_err(|_| BlsError::KeyGeneration)?;
        Self::from_ikm(&ikm)
    }

    /// Derives a key from input keying material via the standard BLS
    /// hash-to-scalar key generation. Always yields a valid key, unlike
    /// `from_bytes`, which rejects scalars above the curve order.
    pub fn from_ikm(ikm: &[u8; 32]) -> Result<Self, BlsError> {
        let sk = SecretKey::key_gen(ikm, &[]).map_err(|_| BlsError::KeyGeneration)?;
        Ok(Self(sk))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, BlsError> {
        let sk = SecretKey::from_bytes(bytes).map_err(|_| BlsError::InvalidSecretKey)?;
        Ok(Self(sk))
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk())
    }

    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.0.sign(message, DST, &[]))
    }

    /// Signs a 32-byte digest, the form used for PREPARE ballots over the
    /// announced block hash.
    pub fn sign_hash(&self, hash: &B256) -> BlsSignature {
        self.sign(hash.as_slice())
    }
}

impl std::fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlsSecretKey").field(&self.public_key()).finish()
    }
}

#[derive(Clone)]
pub struct BlsPublicKey(PublicKey);

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, BlsError> {
        let pk = PublicKey::from_bytes(bytes).map_err(|_| BlsError::InvalidPublicKey)?;
        Ok(Self(pk))
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// The address a post-staking coinbase derives from this key: the last
    /// 20 bytes of keccak256 over the serialized key.
    pub fn to_address(&self) -> Address {
        let digest = keccak256(self.to_bytes());
        Address::from_slice(&digest[12..])
    }

    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> Result<(), BlsError> {
        let result = signature.0.verify(true, message, DST, &[], &self.0, true);
        if result != BLST_ERROR::BLST_SUCCESS {
            return Err(BlsError::VerificationFailed(result));
        }
        Ok(())
    }

    pub fn verify_hash(&self, hash: &B256, signature: &BlsSignature) -> Result<(), BlsError> {
        self.verify(hash.as_slice(), signature)
    }

    pub(crate) fn inner(&self) -> &PublicKey {
        &self.0
    }
}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "BlsPublicKey(0x{}..)", hex::encode(&bytes[..6]))
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl std::hash::Hash for BlsPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 48-byte BLS public key"))?;
        Self::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone)]
pub struct BlsSignature(pub(crate) Signature);

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Result<Self, BlsError> {
        let sig = Signature::from_bytes(bytes).map_err(|_| BlsError::InvalidSignature)?;
        Ok(Self(sig))
    }

    /// Decodes a signature from an untrusted, possibly wrong-length slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BlsError> {
        let arr: [u8; SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| BlsError::InvalidSignature)?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0.to_bytes()
    }

    pub(crate) fn inner(&self) -> &Signature {
        &self.0
    }
}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "BlsSignature(0x{}..)", hex::encode(&bytes[..6]))
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl std::hash::Hash for BlsSignature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let arr: [u8; SIGNATURE_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 96-byte BLS signature"))?;
        Self::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let sk = BlsSecretKey::random().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"ballot payload");
        pk.verify(b"ballot payload", &sig).expect("signature should verify");
        assert!(pk.verify(b"different payload", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let sk1 = BlsSecretKey::random().unwrap();
        let sk2 = BlsSecretKey::random().unwrap();
        let sig = sk1.sign(b"msg");
        assert!(sk2.public_key().verify(b"msg", &sig).is_err());
    }

    #[test]
    fn sign_hash_matches_raw_bytes() {
        let sk = BlsSecretKey::random().unwrap();
        let hash = B256::repeat_byte(0x5a);
        let sig = sk.sign_hash(&hash);
        sk.public_key()
            .verify(hash.as_slice(), &sig)
            .expect("sign_hash is sign over the digest bytes");
    }

    #[test]
    fn from_ikm_is_deterministic() {
        let a = BlsSecretKey::from_ikm(&[7u8; 32]).unwrap();
        let b = BlsSecretKey::from_ikm(&[7u8; 32]).unwrap();
        let c = BlsSecretKey::from_ikm(&[8u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn address_derivation_is_stable_and_distinct() {
        let sk = BlsSecretKey::from_ikm(&[1u8; 32]).unwrap();
        let addr1 = sk.public_key().to_address();
        let addr2 = sk.public_key().to_address();
        assert_eq!(addr1, addr2);

        let other = BlsSecretKey::from_ikm(&[2u8; 32]).unwrap();
        assert_ne!(addr1, other.public_key().to_address());
        assert_ne!(addr1, Address::ZERO);
    }

    #[test]
    fn serde_roundtrip() {
        let sk = BlsSecretKey::random().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"roundtrip");

        let pk2: BlsPublicKey = bincode::deserialize(&bincode::serialize(&pk).unwrap()).unwrap();
        let sig2: BlsSignature = bincode::deserialize(&bincode::serialize(&sig).unwrap()).unwrap();
        assert_eq!(pk, pk2);
        assert_eq!(sig, sig2);
    }

    #[test]
    fn serde_rejects_wrong_length() {
        let short = bincode::serialize(&vec![0u8; 32]).unwrap();
        assert!(bincode::deserialize::<BlsPublicKey>(&short).is_err());
        assert!(bincode::deserialize::<BlsSignature>(&short).is_err());
    }

    #[test]
    fn invalid_encodings_rejected() {
        assert!(BlsPublicKey::from_bytes(&[0xff; 48]).is_err());
        assert!(BlsSignature::from_bytes(&[0xff; 96]).is_err());
        assert!(BlsSignature::from_slice(&[0u8; 12]).is_err());
    }
}
