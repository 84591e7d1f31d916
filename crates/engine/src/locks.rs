//! The set of supported `<lock>` observations carried across rounds.

use lockstep_types::{Hash, State, StateCompare};
use lockstep_wire::SignedPacket;

/// One supported lock: the state, its hash, the round it was observed at,
/// and the envelope that proposed it.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub state: State,
    pub state_hash: Hash,
    pub round: u64,
    pub packet: SignedPacket,
}

impl LockEntry {
    pub fn new(state: State, round: u64, packet: SignedPacket) -> Self {
        let state_hash = Hash::digest(&state);
        LockEntry {
            state,
            state_hash,
            round,
            packet,
        }
    }
}

/// Lock observations, keyed by state.
///
/// Inserting a lock whose state matches an existing entry replaces it, so
/// the set holds one entry per distinct state. The maximal entry under the
/// injected comparator is the candidate a leader must re-propose.
#[derive(Debug, Default)]
pub struct LockSet {
    entries: Vec<LockEntry>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by state.
    pub fn insert(&mut self, entry: LockEntry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.state_hash == entry.state_hash)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// The entry with the greatest state under `compare`.
    pub fn maximal(&self, compare: &StateCompare) -> Option<&LockEntry> {
        self.entries
            .iter()
            .reduce(|best, entry| match compare(&entry.state, &best.state) {
                std::cmp::Ordering::Greater => entry,
                _ => best,
            })
    }

    /// Keep only the maximal entry.
    pub fn retain_maximal(&mut self, compare: &StateCompare) {
        if let Some(max_hash) = self.maximal(compare).map(|entry| entry.state_hash) {
            self.entries.retain(|entry| entry.state_hash == max_hash);
        }
    }

    /// Drop entries observed at rounds up to and including `round`.
    pub fn release_through(&mut self, round: u64) {
        self.entries.retain(|entry| entry.round > round);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
