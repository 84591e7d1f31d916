//! Core types for the Lockstep consensus engine.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: [`Hash`], cryptographic keys and signatures
//! - **Identifiers**: [`Identity`], the short participant identifier
//! - **Application hooks**: [`StateCompare`], [`StateValidate`],
//!   [`PubKeyToIdentity`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identity;
mod state;

pub use crypto::{CryptoError, KeyPair, PublicKey, SignatureBytes};
pub use hash::Hash;
pub use identity::{default_pubkey_to_identity, Identity};
pub use state::{PubKeyToIdentity, State, StateCompare, StateValidate};

/// Quorum threshold for a participant set of the given size.
///
/// For `n >= 3t + 1` participants tolerating `t` Byzantine faults, the
/// protocol requires `2t + 1 = 2 * floor((n - 1) / 3) + 1` distinct
/// signatures for every proof set.
pub fn quorum(participants: usize) -> usize {
    2 * (participants.saturating_sub(1) / 3) + 1
}
