//! The signed outer envelope.

use crate::codec::{FieldReader, FieldWriter, WireError};
use crate::message::Message;
use lockstep_types::{Hash, KeyPair, PublicKey, SignatureBytes};
use std::fmt;

/// The only protocol version accepted on the wire.
pub const PROTOCOL_VERSION: u32 = 1;

/// Field tags of the envelope record.
const TAG_VERSION: u32 = 1;
const TAG_MESSAGE: u32 = 2;
const TAG_X: u32 = 3;
const TAG_Y: u32 = 4;
const TAG_R: u32 = 5;
const TAG_S: u32 = 6;

/// A signed consensus message envelope.
///
/// Carries the protocol version, the encoded inner [`Message`], the signer's
/// public key coordinates, and an ECDSA signature over
/// `sha256(version_be || x || y || message)`. The signer identity is derived
/// from `(x, y)`; there is no separate `from` field.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedPacket {
    pub version: u32,
    pub message: Vec<u8>,
    pub x: [u8; 32],
    pub y: [u8; 32],
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl SignedPacket {
    /// Encode and sign an inner message.
    pub fn sign(message: &Message, key: &KeyPair) -> Self {
        let (x, y) = key.public_key().coordinates();
        let mut packet = SignedPacket {
            version: PROTOCOL_VERSION,
            message: message.encode(),
            x,
            y,
            r: [0u8; 32],
            s: [0u8; 32],
        };
        let SignatureBytes { r, s } = key.sign(&packet.signing_digest());
        packet.r = r;
        packet.s = s;
        packet
    }

    /// The digest the signature covers.
    ///
    /// `sha256(version_be || x || y || message)`: the version and signer
    /// coordinates are bound into the signature, so neither can be swapped
    /// without invalidating it.
    pub fn signing_digest(&self) -> Hash {
        let mut input = Vec::with_capacity(4 + 64 + self.message.len());
        input.extend_from_slice(&self.version.to_be_bytes());
        input.extend_from_slice(&self.x);
        input.extend_from_slice(&self.y);
        input.extend_from_slice(&self.message);
        Hash::digest(&input)
    }

    /// Verify the signature and return the signer's public key.
    ///
    /// `None` when `(x, y)` is not a curve point or the signature does not
    /// verify (including malleable high-S forms).
    pub fn verify_signature(&self) -> Option<PublicKey> {
        let key = PublicKey::from_coordinates(&self.x, &self.y).ok()?;
        let signature = SignatureBytes {
            r: self.r,
            s: self.s,
        };
        key.verify(&self.signing_digest(), &signature)
            .then_some(key)
    }

    /// Decode the embedded inner message.
    pub fn message(&self) -> Result<Message, WireError> {
        Message::decode(&self.message)
    }

    /// Encode to canonical bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.uint(TAG_VERSION, u64::from(self.version));
        w.bytes(TAG_MESSAGE, &self.message);
        w.bytes_raw(TAG_X, &self.x);
        w.bytes_raw(TAG_Y, &self.y);
        w.bytes_raw(TAG_R, &self.r);
        w.bytes_raw(TAG_S, &self.s);
        w.finish()
    }

    /// Decode from canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut packet = SignedPacket {
            version: 0,
            message: Vec::new(),
            x: [0u8; 32],
            y: [0u8; 32],
            r: [0u8; 32],
            s: [0u8; 32],
        };
        let mut seen = [false; 7];
        let mut reader = FieldReader::new(bytes);
        while let Some((tag, value)) = reader.next_field()? {
            let slot = tag as usize;
            if seen.get(slot).copied().unwrap_or(false) {
                return Err(WireError::DuplicateField(tag));
            }
            if let Some(flag) = seen.get_mut(slot) {
                *flag = true;
            }
            match tag {
                TAG_VERSION => packet.version = value.uint()? as u32,
                TAG_MESSAGE => packet.message = value.bytes()?.to_vec(),
                TAG_X => packet.x = fixed32(tag, value.bytes()?)?,
                TAG_Y => packet.y = fixed32(tag, value.bytes()?)?,
                TAG_R => packet.r = fixed32(tag, value.bytes()?)?,
                TAG_S => packet.s = fixed32(tag, value.bytes()?)?,
                other => return Err(WireError::UnknownField(other)),
            }
        }
        Ok(packet)
    }
}

fn fixed32(tag: u32, bytes: &[u8]) -> Result<[u8; 32], WireError> {
    bytes.try_into().map_err(|_| WireError::BadFieldLength {
        tag,
        expected: 32,
        actual: bytes.len(),
    })
}

impl fmt::Debug for SignedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPacket")
            .field("version", &self.version)
            .field("message_len", &self.message.len())
            .field("x", &hex::encode(&self.x[..4]))
            .finish_non_exhaustive()
    }
}
