//! ECDSA keys and signatures over secp256k1.
//!
//! Envelopes carry the signer's public key as fixed-width big-endian affine
//! coordinates `(X, Y)` and the signature as fixed-width `(R, S)`. Signing
//! always normalizes to the low-S form, and verification rejects the
//! malleable high-S form, so every accepted signature has exactly one byte
//! representation.

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, Secp256k1, SecretKey};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

use crate::hash::Hash;

/// Shared verification context.
fn secp() -> &'static Secp256k1<All> {
    static CTX: OnceLock<Secp256k1<All>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

/// Errors from key material handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("point is not on the curve")]
    InvalidPoint,
}

/// A secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    /// Reconstruct a key from affine coordinates.
    ///
    /// Fails if `(x, y)` does not name a point on the curve.
    pub fn from_coordinates(x: &[u8; 32], y: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut encoded = [0u8; 65];
        encoded[0] = 0x04;
        encoded[1..33].copy_from_slice(x);
        encoded[33..65].copy_from_slice(y);
        secp256k1::PublicKey::from_slice(&encoded)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPoint)
    }

    /// Big-endian affine coordinates `(x, y)`.
    pub fn coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let encoded = self.0.serialize_uncompressed();
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&encoded[1..33]);
        y.copy_from_slice(&encoded[33..65]);
        (x, y)
    }

    /// The uncompressed SEC1 encoding (`0x04 || x || y`).
    pub fn uncompressed(&self) -> [u8; 65] {
        self.0.serialize_uncompressed()
    }

    /// Verify a signature over a 32-byte digest.
    ///
    /// Returns `false` for high-S (malleable) signatures.
    pub fn verify(&self, digest: &Hash, signature: &SignatureBytes) -> bool {
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&signature.r);
        compact[32..].copy_from_slice(&signature.s);
        let Ok(sig) = Signature::from_compact(&compact) else {
            return false;
        };
        let msg = Message::from_digest(*digest.as_bytes());
        secp().verify_ecdsa(&msg, &sig, &self.0).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, _) = self.coordinates();
        write!(f, "PublicKey({}..)", hex::encode(&x[..4]))
    }
}

/// A signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate<R: secp256k1::rand::Rng + ?Sized>(rng: &mut R) -> Self {
        let secret = SecretKey::new(rng);
        let public = PublicKey(secret.public_key(secp()));
        KeyPair { secret, public }
    }

    /// Construct from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey(secret.public_key(secp()));
        Ok(KeyPair { secret, public })
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign a 32-byte digest, producing a low-S (canonical) signature.
    pub fn sign(&self, digest: &Hash) -> SignatureBytes {
        let msg = Message::from_digest(*digest.as_bytes());
        let mut sig = secp().sign_ecdsa(&msg, &self.secret);
        sig.normalize_s();
        let compact = sig.serialize_compact();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[..32]);
        s.copy_from_slice(&compact[32..]);
        SignatureBytes { r, s }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Fixed-width big-endian ECDSA signature components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes {
    pub r: [u8; 32],
    pub s: [u8; 32],
}
