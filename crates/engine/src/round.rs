//! Per-round message containers and the ordered round book.

use lockstep_types::{Hash, Identity, State};
use lockstep_wire::{Message, SignedPacket};
use std::collections::{BTreeMap, HashMap};

/// Sub-phase within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Collecting `<roundchange>` votes for the round.
    RoundChanging,
    /// Quorum reached; waiting for the leader's `<lock>` or `<select>`.
    Lock,
    /// A state is locked; collecting `<commit>` votes.
    Commit,
    /// The round failed to decide; draining before moving up a round.
    LockRelease,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::RoundChanging => "round-changing",
            Stage::Lock => "lock",
            Stage::Commit => "commit",
            Stage::LockRelease => "lock-release",
        }
    }
}

/// A validated message together with its signed envelope.
///
/// The envelope is kept verbatim so it can be re-emitted as proof material
/// without re-encoding.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    pub packet: SignedPacket,
}

/// Per-round container.
///
/// Both maps are keyed by signer identity, which caps storage at one entry
/// per participant per message kind.
#[derive(Debug)]
pub struct ConsensusRound {
    pub round: u64,
    pub stage: Stage,
    pub round_changes: HashMap<Identity, StoredMessage>,
    pub commits: HashMap<Identity, StoredMessage>,
    /// State locked in by the leader's `<lock>`/`<select>` for this round.
    pub locked_state: Option<State>,
    pub locked_state_hash: Option<Hash>,
    /// Envelope that locked the state, kept for lock carrying.
    pub locked_packet: Option<SignedPacket>,
}

impl ConsensusRound {
    fn new(round: u64) -> Self {
        ConsensusRound {
            round,
            stage: Stage::RoundChanging,
            round_changes: HashMap::new(),
            commits: HashMap::new(),
            locked_state: None,
            locked_state_hash: None,
            locked_packet: None,
        }
    }

    /// Record the locked state for this round.
    pub fn lock(&mut self, state: State, packet: SignedPacket) {
        self.locked_state_hash = Some(Hash::digest(&state));
        self.locked_state = Some(state);
        self.locked_packet = Some(packet);
    }

    /// Drop the locked state for this round.
    pub fn unlock(&mut self) {
        self.locked_state = None;
        self.locked_state_hash = None;
        self.locked_packet = None;
    }
}

/// Ordered collection of rounds, created lazily on first use.
///
/// Backed by a `BTreeMap`, which gives the strict `RoundNumber` ordering and
/// logarithmic lookup the round book needs. A per-signer index enforces the
/// global `<roundchange>` dedup rule: one retained message per signer across
/// the whole book, keeping the highest round observed. This is the memory
/// bound against floods of valid-looking `<roundchange>` at random rounds.
#[derive(Debug, Default)]
pub struct RoundBook {
    rounds: BTreeMap<u64, ConsensusRound>,
    round_change_index: HashMap<Identity, u64>,
}

impl RoundBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a round container, creating it if absent.
    pub fn get_or_create(&mut self, round: u64) -> &mut ConsensusRound {
        self.rounds
            .entry(round)
            .or_insert_with(|| ConsensusRound::new(round))
    }

    pub fn get(&self, round: u64) -> Option<&ConsensusRound> {
        self.rounds.get(&round)
    }

    pub fn get_mut(&mut self, round: u64) -> Option<&mut ConsensusRound> {
        self.rounds.get_mut(&round)
    }

    /// Insert a `<roundchange>`, applying the keep-highest-round dedup.
    ///
    /// Returns `false` when the signer already has a retained message at
    /// this or a higher round (the new one is discarded).
    pub fn insert_round_change(
        &mut self,
        signer: Identity,
        round: u64,
        message: Message,
        packet: SignedPacket,
    ) -> bool {
        if let Some(&existing) = self.round_change_index.get(&signer) {
            if existing >= round {
                return false;
            }
            self.remove_round_change(signer, existing);
        }
        self.round_change_index.insert(signer, round);
        self.get_or_create(round)
            .round_changes
            .insert(signer, StoredMessage { message, packet });
        true
    }

    fn remove_round_change(&mut self, signer: Identity, round: u64) {
        let emptied = if let Some(container) = self.rounds.get_mut(&round) {
            container.round_changes.remove(&signer);
            container.round_changes.is_empty()
                && container.commits.is_empty()
                && container.locked_state.is_none()
        } else {
            false
        };
        if emptied {
            self.rounds.remove(&round);
        }
    }

    /// Number of distinct `<roundchange>` signers at a round.
    pub fn round_change_count(&self, round: u64) -> usize {
        self.rounds
            .get(&round)
            .map_or(0, |container| container.round_changes.len())
    }

    /// The highest round strictly above `current` holding at least
    /// `threshold` `<roundchange>` signers.
    pub fn quorum_round_above(&self, current: u64, threshold: usize) -> Option<u64> {
        self.rounds
            .range(current + 1..)
            .rev()
            .find(|(_, container)| container.round_changes.len() >= threshold)
            .map(|(&round, _)| round)
    }

    /// Drop every round strictly below `round`.
    pub fn prune_below(&mut self, round: u64) {
        self.rounds = self.rounds.split_off(&round);
        self.round_change_index.retain(|_, r| *r >= round);
    }

    /// Drop everything (height advance).
    pub fn clear(&mut self) {
        self.rounds.clear();
        self.round_change_index.clear();
    }

    /// Total retained `<roundchange>` messages across all rounds.
    #[cfg(test)]
    pub fn total_round_changes(&self) -> usize {
        self.round_change_index.len()
    }

    /// Iterate rounds in ascending order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ConsensusRound> {
        self.rounds.values()
    }
}
