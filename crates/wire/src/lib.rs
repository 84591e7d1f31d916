//! Canonical wire format for Lockstep consensus messages.
//!
//! This crate defines the two layers of the wire protocol:
//!
//! - [`Message`]: the six protocol message kinds as a closed tagged enum
//! - [`SignedPacket`]: the outer envelope carrying the encoded inner message,
//!   the signer's public key coordinates, and an ECDSA signature
//!
//! # Canonical Encoding
//!
//! Signatures are computed over encoded bytes, so the codec is part of the
//! safety contract: a given message has exactly one valid encoding. Fields
//! are written in ascending tag order, defaults are omitted, and decoding
//! rejects unknown tags, repeated tags, out-of-order tags, and fields that
//! do not belong to the decoded message kind.

mod codec;
mod envelope;
mod message;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use codec::WireError;
pub use envelope::{SignedPacket, PROTOCOL_VERSION};
pub use message::{Message, MessageKind};
