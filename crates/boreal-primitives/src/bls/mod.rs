//! BLS12-381 signatures over the `min_pk` variant: 48-byte public keys,
//! 96-byte signatures. Multi-signatures are plain signature products
//! verified against the subset of committee keys named by a bitmap.

mod aggregate;
mod keys;

pub use aggregate::AggregateSignature;
pub use keys::{BlsError, BlsPublicKey, BlsSecretKey, BlsSignature};

/// Domain separation tag for all Boreal consensus signatures.
pub(crate) const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Serialized public key length in bytes.
pub const PUBLIC_KEY_SIZE: usize = 48;

/// Serialized signature length in bytes.
pub const SIGNATURE_SIZE: usize = 96;
