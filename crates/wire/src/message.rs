//! The six protocol message kinds.

use crate::codec::{FieldReader, FieldWriter, WireError};
use crate::envelope::SignedPacket;
use lockstep_types::State;
use std::fmt;

/// Field tags of the inner message record.
const TAG_TYPE: u32 = 1;
const TAG_HEIGHT: u32 = 2;
const TAG_ROUND: u32 = 3;
const TAG_STATE: u32 = 4;
const TAG_PROOF: u32 = 5;
const TAG_LOCK_RELEASE: u32 = 6;

/// Discriminant for the six message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    RoundChange = 0,
    Lock = 1,
    Select = 2,
    LockRelease = 3,
    Commit = 4,
    Decide = 5,
}

impl MessageKind {
    fn from_wire(value: u64) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageKind::RoundChange),
            1 => Ok(MessageKind::Lock),
            2 => Ok(MessageKind::Select),
            3 => Ok(MessageKind::LockRelease),
            4 => Ok(MessageKind::Commit),
            5 => Ok(MessageKind::Decide),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }

    /// Human-readable name for telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::RoundChange => "roundchange",
            MessageKind::Lock => "lock",
            MessageKind::Select => "select",
            MessageKind::LockRelease => "lock-release",
            MessageKind::Commit => "commit",
            MessageKind::Decide => "decide",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An inner consensus message.
///
/// The kind is part of the variant, so a decoded message can only carry the
/// fields its kind defines: a `<commit>` with a proof list or a
/// `<lock-release>` with a height does not decode.
///
/// States are `Option` because emptiness is a validation concern, not a
/// codec concern: a stateless `<commit>` must decode so the engine can
/// reject it with the right error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A participant's request to move to (or vote for) a round, carrying
    /// the state it supports.
    RoundChange {
        height: u64,
        round: u64,
        state: Option<State>,
    },

    /// Leader proposal backed by a quorum of identical-state
    /// `<roundchange>` proofs.
    Lock {
        height: u64,
        round: u64,
        state: Option<State>,
        proof: Vec<SignedPacket>,
    },

    /// Leader proposal carrying the maximal state across a quorum of
    /// `<roundchange>` proofs with divergent states.
    Select {
        height: u64,
        round: u64,
        state: Option<State>,
        proof: Vec<SignedPacket>,
    },

    /// Re-broadcast of a held `<lock>`, authorising peers to drop locks at
    /// rounds up to the embedded lock's round.
    LockRelease { lock: Option<Box<SignedPacket>> },

    /// A participant's commitment to the locked state of the current round.
    Commit {
        height: u64,
        round: u64,
        state: Option<State>,
    },

    /// Terminal proof that a quorum committed to a state.
    Decide {
        height: u64,
        round: u64,
        state: Option<State>,
        proof: Vec<SignedPacket>,
    },
}

impl Message {
    /// The kind discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RoundChange { .. } => MessageKind::RoundChange,
            Message::Lock { .. } => MessageKind::Lock,
            Message::Select { .. } => MessageKind::Select,
            Message::LockRelease { .. } => MessageKind::LockRelease,
            Message::Commit { .. } => MessageKind::Commit,
            Message::Decide { .. } => MessageKind::Decide,
        }
    }

    /// Message height; zero for `<lock-release>`, which carries none.
    pub fn height(&self) -> u64 {
        match self {
            Message::RoundChange { height, .. }
            | Message::Lock { height, .. }
            | Message::Select { height, .. }
            | Message::Commit { height, .. }
            | Message::Decide { height, .. } => *height,
            Message::LockRelease { .. } => 0,
        }
    }

    /// Message round; zero for `<lock-release>`.
    pub fn round(&self) -> u64 {
        match self {
            Message::RoundChange { round, .. }
            | Message::Lock { round, .. }
            | Message::Select { round, .. }
            | Message::Commit { round, .. }
            | Message::Decide { round, .. } => *round,
            Message::LockRelease { .. } => 0,
        }
    }

    /// The carried state, if any.
    pub fn state(&self) -> Option<&[u8]> {
        match self {
            Message::RoundChange { state, .. }
            | Message::Lock { state, .. }
            | Message::Select { state, .. }
            | Message::Commit { state, .. }
            | Message::Decide { state, .. } => state.as_deref(),
            Message::LockRelease { .. } => None,
        }
    }

    /// Supporting evidence; empty for kinds that carry none.
    pub fn proof(&self) -> &[SignedPacket] {
        match self {
            Message::Lock { proof, .. }
            | Message::Select { proof, .. }
            | Message::Decide { proof, .. } => proof,
            _ => &[],
        }
    }

    /// Encode to canonical bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.uint(TAG_TYPE, self.kind() as u64);
        match self {
            Message::RoundChange {
                height,
                round,
                state,
            }
            | Message::Commit {
                height,
                round,
                state,
            } => {
                w.uint(TAG_HEIGHT, *height);
                w.uint(TAG_ROUND, *round);
                if let Some(state) = state {
                    w.bytes(TAG_STATE, state);
                }
            }
            Message::Lock {
                height,
                round,
                state,
                proof,
            }
            | Message::Select {
                height,
                round,
                state,
                proof,
            }
            | Message::Decide {
                height,
                round,
                state,
                proof,
            } => {
                w.uint(TAG_HEIGHT, *height);
                w.uint(TAG_ROUND, *round);
                if let Some(state) = state {
                    w.bytes(TAG_STATE, state);
                }
                for packet in proof {
                    w.bytes_raw(TAG_PROOF, &packet.encode());
                }
            }
            Message::LockRelease { lock } => {
                if let Some(lock) = lock {
                    w.bytes_raw(TAG_LOCK_RELEASE, &lock.encode());
                }
            }
        }
        w.finish()
    }

    /// Decode from canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut kind_raw = 0u64;
        let mut height = 0u64;
        let mut round = 0u64;
        let mut state: Option<State> = None;
        let mut proof: Vec<SignedPacket> = Vec::new();
        let mut lock_release: Option<Box<SignedPacket>> = None;
        let mut seen = [false; 7];

        let mut reader = FieldReader::new(bytes);
        while let Some((tag, value)) = reader.next_field()? {
            if tag != TAG_PROOF {
                let slot = tag as usize;
                if seen.get(slot).copied().unwrap_or(false) {
                    return Err(WireError::DuplicateField(tag));
                }
                if let Some(flag) = seen.get_mut(slot) {
                    *flag = true;
                }
            }
            match tag {
                TAG_TYPE => kind_raw = value.uint()?,
                TAG_HEIGHT => height = value.uint()?,
                TAG_ROUND => round = value.uint()?,
                TAG_STATE => {
                    let bytes = value.bytes()?;
                    if !bytes.is_empty() {
                        state = Some(bytes.to_vec());
                    }
                }
                TAG_PROOF => proof.push(SignedPacket::decode(value.bytes()?)?),
                TAG_LOCK_RELEASE => {
                    lock_release = Some(Box::new(SignedPacket::decode(value.bytes()?)?))
                }
                other => return Err(WireError::UnknownField(other)),
            }
        }

        let kind = MessageKind::from_wire(kind_raw)?;
        let reject = |condition: bool, tag: u32| {
            if condition {
                Err(WireError::UnexpectedField(tag, kind.name()))
            } else {
                Ok(())
            }
        };

        match kind {
            MessageKind::RoundChange | MessageKind::Commit => {
                reject(!proof.is_empty(), TAG_PROOF)?;
                reject(lock_release.is_some(), TAG_LOCK_RELEASE)?;
                Ok(match kind {
                    MessageKind::RoundChange => Message::RoundChange {
                        height,
                        round,
                        state,
                    },
                    _ => Message::Commit {
                        height,
                        round,
                        state,
                    },
                })
            }
            MessageKind::Lock | MessageKind::Select | MessageKind::Decide => {
                reject(lock_release.is_some(), TAG_LOCK_RELEASE)?;
                Ok(match kind {
                    MessageKind::Lock => Message::Lock {
                        height,
                        round,
                        state,
                        proof,
                    },
                    MessageKind::Select => Message::Select {
                        height,
                        round,
                        state,
                        proof,
                    },
                    _ => Message::Decide {
                        height,
                        round,
                        state,
                        proof,
                    },
                })
            }
            MessageKind::LockRelease => {
                reject(height != 0, TAG_HEIGHT)?;
                reject(round != 0, TAG_ROUND)?;
                reject(state.is_some(), TAG_STATE)?;
                reject(!proof.is_empty(), TAG_PROOF)?;
                Ok(Message::LockRelease { lock: lock_release })
            }
        }
    }
}
