//! Message-construction helpers for tests.
//!
//! Mirrors the fixture style used across the workspace test suites: each
//! helper builds a structurally valid signed message, with proof sets shaped
//! so that exactly a quorum of them supports the message state and the rest
//! carry random states.

use crate::{Message, SignedPacket};
use lockstep_types::{quorum, KeyPair, State};
use rand::Rng;

/// A signed proposal plus the keys behind its proof set.
pub struct ProposalFixture {
    pub message: Message,
    pub packet: SignedPacket,
    pub signer: KeyPair,
    pub proof_keys: Vec<KeyPair>,
}

impl ProposalFixture {
    /// Re-sign the (possibly mutated) message with the original signer.
    pub fn resign(&mut self) {
        self.packet = SignedPacket::sign(&self.message, &self.signer);
    }
}

/// 1 KiB of random state bytes.
pub fn random_state<R: Rng + ?Sized>(rng: &mut R) -> State {
    let mut state = vec![0u8; 1024];
    rng.fill_bytes(&mut state);
    state
}

/// A `<roundchange>` signed by the given key.
pub fn round_change_signed(
    height: u64,
    round: u64,
    state: Option<State>,
    signer: &KeyPair,
) -> (Message, SignedPacket) {
    let message = Message::RoundChange {
        height,
        round,
        state,
    };
    let packet = SignedPacket::sign(&message, signer);
    (message, packet)
}

/// A `<roundchange>` with random state from a fresh key.
pub fn round_change<R: Rng + ?Sized>(
    height: u64,
    round: u64,
    rng: &mut R,
) -> (Message, SignedPacket, KeyPair) {
    let signer = KeyPair::generate(rng);
    let state = random_state(rng);
    let (message, packet) = round_change_signed(height, round, Some(state), &signer);
    (message, packet, signer)
}

/// A `<commit>` signed by the given key.
pub fn commit_signed(
    height: u64,
    round: u64,
    state: Option<State>,
    signer: &KeyPair,
) -> (Message, SignedPacket) {
    let message = Message::Commit {
        height,
        round,
        state,
    };
    let packet = SignedPacket::sign(&message, signer);
    (message, packet)
}

/// A `<lock>` over the given state.
///
/// The first `2t+1` of `num_proofs` `<roundchange>` proofs carry the lock
/// state (the very first signed by the lock's own signer); the remainder
/// carry random states. `proof_keys` lists the proof signers in order.
pub fn lock_message_state<R: Rng + ?Sized>(
    num_proofs: usize,
    state: Option<State>,
    height: u64,
    round: u64,
    proof_height: u64,
    proof_round: u64,
    rng: &mut R,
) -> ProposalFixture {
    let signer = KeyPair::generate(rng);
    let valid = quorum(num_proofs);

    let mut proof = Vec::with_capacity(num_proofs);
    let mut proof_keys = Vec::with_capacity(num_proofs);
    for i in 0..num_proofs {
        let (proof_state, key) = if i >= valid {
            (Some(random_state(rng)), KeyPair::generate(rng))
        } else if i == 0 {
            (state.clone(), signer.clone())
        } else {
            (state.clone(), KeyPair::generate(rng))
        };
        let (_, packet) = round_change_signed(proof_height, proof_round, proof_state, &key);
        proof.push(packet);
        proof_keys.push(key);
    }

    let message = Message::Lock {
        height,
        round,
        state,
        proof,
    };
    let packet = SignedPacket::sign(&message, &signer);
    ProposalFixture {
        message,
        packet,
        signer,
        proof_keys,
    }
}

/// A `<lock>` over a random state.
pub fn lock_message<R: Rng + ?Sized>(
    num_proofs: usize,
    height: u64,
    round: u64,
    proof_height: u64,
    proof_round: u64,
    rng: &mut R,
) -> ProposalFixture {
    let state = random_state(rng);
    lock_message_state(
        num_proofs,
        Some(state),
        height,
        round,
        proof_height,
        proof_round,
        rng,
    )
}

/// A `<select>` whose proofs all carry distinct random states.
///
/// The message state is the byte-wise maximum across the proofs, and the
/// first proof is signed by the select's own signer.
pub fn select_message<R: Rng + ?Sized>(
    num_proofs: usize,
    height: u64,
    round: u64,
    proof_height: u64,
    proof_round: u64,
    rng: &mut R,
) -> ProposalFixture {
    let signer = KeyPair::generate(rng);

    let mut max_state: Option<State> = None;
    let mut proof = Vec::with_capacity(num_proofs);
    let mut proof_keys = Vec::with_capacity(num_proofs);
    for i in 0..num_proofs {
        let state = random_state(rng);
        if max_state.as_ref().is_none_or(|max| *max < state) {
            max_state = Some(state.clone());
        }
        let key = if i == 0 {
            signer.clone()
        } else {
            KeyPair::generate(rng)
        };
        let (_, packet) = round_change_signed(proof_height, proof_round, Some(state), &key);
        proof.push(packet);
        proof_keys.push(key);
    }

    let message = Message::Select {
        height,
        round,
        state: max_state,
        proof,
    };
    let packet = SignedPacket::sign(&message, &signer);
    ProposalFixture {
        message,
        packet,
        signer,
        proof_keys,
    }
}

/// A `<decide>` backed by `<commit>` proofs.
///
/// The first `2t+1` of `num_proofs` proofs carry the decided state; the
/// remainder carry random states.
pub fn decide_message<R: Rng + ?Sized>(
    num_proofs: usize,
    height: u64,
    round: u64,
    proof_height: u64,
    proof_round: u64,
    rng: &mut R,
) -> ProposalFixture {
    let signer = KeyPair::generate(rng);
    let valid = quorum(num_proofs);
    let state = random_state(rng);

    let mut proof = Vec::with_capacity(num_proofs);
    let mut proof_keys = Vec::with_capacity(num_proofs);
    for i in 0..num_proofs {
        let (proof_state, key) = if i >= valid {
            (random_state(rng), KeyPair::generate(rng))
        } else if i == 0 {
            (state.clone(), signer.clone())
        } else {
            (state.clone(), KeyPair::generate(rng))
        };
        let (_, packet) = commit_signed(proof_height, proof_round, Some(proof_state), &key);
        proof.push(packet);
        proof_keys.push(key);
    }

    let message = Message::Decide {
        height,
        round,
        state: Some(state),
        proof,
    };
    let packet = SignedPacket::sign(&message, &signer);
    ProposalFixture {
        message,
        packet,
        signer,
        proof_keys,
    }
}

/// A `<lock-release>` wrapping a freshly built `<lock>`.
pub fn lock_release_message<R: Rng + ?Sized>(
    num_proofs: usize,
    height: u64,
    round: u64,
    proof_height: u64,
    proof_round: u64,
    rng: &mut R,
) -> ProposalFixture {
    let lock = lock_message(num_proofs, height, round, proof_height, proof_round, rng);
    let message = Message::LockRelease {
        lock: Some(Box::new(lock.packet)),
    };
    let packet = SignedPacket::sign(&message, &lock.signer);
    ProposalFixture {
        message,
        packet,
        signer: lock.signer,
        proof_keys: lock.proof_keys,
    }
}
