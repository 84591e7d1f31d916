//! Deterministic BFT consensus state machine.
//!
//! This crate implements the core of a leader-driven, round-based Byzantine
//! fault tolerant consensus protocol with an explicit lock / lock-release
//! discipline. A fixed quorum of participants, each identified by a
//! secp256k1 public key, agrees on a sequence of opaque binary states, one
//! per height, tolerating up to `t` Byzantine faults among `n >= 3t + 1`
//! participants.
//!
//! # Architecture
//!
//! The engine is a synchronous state machine advanced by two entry points:
//!
//! - [`Consensus::receive_message`] — validate and absorb one wire message
//! - [`Consensus::update`] — fire expired timers and advance stages
//!
//! It is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + input + clock = same behavior
//! - **Pure-ish**: mutates itself, performs no I/O
//!
//! All I/O belongs to the caller: outgoing messages land in an outbox
//! ([`Consensus::take_outbound`]) the transport drains, and the clock is the
//! `now` argument threaded through every call.
//!
//! # Protocol
//!
//! Each height runs numbered rounds; each round walks four stages:
//!
//! 1. **RoundChanging** — participants broadcast `<roundchange>` carrying the
//!    state they support. A quorum moves the round to Lock.
//! 2. **Lock** — the leader turns a quorum of identical-state proofs into a
//!    `<lock>`, or divergent proofs into a `<select>` carrying the maximal
//!    state. Followers lock the proposed state and move to Commit.
//! 3. **Commit** — participants broadcast `<commit>` over the locked state;
//!    the leader turns a quorum of commits into a terminal `<decide>`.
//! 4. **LockRelease** — a failed round drains here, then moves up a round,
//!    carrying held locks so the maximal supported state survives leader
//!    changes.
//!
//! Safety rests on quorum intersection over the proof sets attached to
//! `<lock>`, `<select>` and `<decide>`; liveness on the timeout ladder that
//! walks stalled rounds forward.

mod config;
mod error;
mod latency;
mod locks;
mod outbound;
mod round;
mod state;

pub use config::{
    verify_config, Config, DEFAULT_LATENCY, DEFAULT_ROUND_CHANGE_CAP, MINIMUM_PARTICIPANTS,
};
pub use error::ConsensusError;
pub use outbound::OutboundMessage;
pub use round::Stage;
pub use state::{Consensus, CurrentState};
