//! Participant identities.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::crypto::PublicKey;

/// Short identifier derived from a participant's public key.
///
/// Identities are what the participant list, leader rotation, and per-signer
/// message maps are keyed by. Equality and ordering are total.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 20]);

impl Identity {
    /// Identifier length in bytes.
    pub const LEN: usize = 20;

    /// Construct from a raw 20-byte array.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Identity(bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}..)", hex::encode(&self.0[..4]))
    }
}

/// The canonical public-key-to-identity mapping.
///
/// Takes the trailing 20 bytes of the SHA-256 digest of the uncompressed
/// point encoding. Distinct keys collide only with negligible probability.
pub fn default_pubkey_to_identity(key: &PublicKey) -> Identity {
    let mut hasher = Sha256::new();
    hasher.update(key.uncompressed());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[12..]);
    Identity(id)
}
