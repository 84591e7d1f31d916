//! Engine configuration.

use lockstep_types::{Identity, KeyPair, PubKeyToIdentity, StateCompare, StateValidate};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::ConsensusError;

/// Smallest participant set the engine accepts (`n >= 3t + 1` with `t = 1`).
pub const MINIMUM_PARTICIPANTS: usize = 4;

/// Default initial round-trip estimate before any samples arrive.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(500);

/// Default cap on the exponential round-change back-off.
pub const DEFAULT_ROUND_CHANGE_CAP: Duration = Duration::from_secs(30);

/// Consensus engine configuration.
///
/// Required fields are `Option` so [`verify_config`] can report exactly which
/// one is missing; `Consensus::new` runs the same check.
#[derive(Clone)]
pub struct Config {
    /// Wall-time origin for all timers. Required.
    pub epoch: Option<Instant>,

    /// Height already decided; the engine works on `current_height + 1`.
    pub current_height: u64,

    /// This node's ECDSA signing key. Required.
    pub private_key: Option<KeyPair>,

    /// Ordered participant identities; drives quorum counting and leader
    /// rotation. Required, length >= [`MINIMUM_PARTICIPANTS`].
    pub participants: Vec<Identity>,

    /// Total-order comparator over candidate states. Required.
    pub state_compare: Option<StateCompare>,

    /// Application validity predicate for candidate states. Required.
    pub state_validate: Option<StateValidate>,

    /// Public-key-to-identity mapping; defaults to the canonical one.
    pub pubkey_to_identity: Option<PubKeyToIdentity>,

    /// Fixed leader override for tests and emulation.
    pub fixed_leader: Option<Identity>,

    /// Seed for the latency estimator.
    pub initial_latency: Duration,

    /// Upper bound for the round-change back-off.
    pub round_change_cap: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            epoch: None,
            current_height: 0,
            private_key: None,
            participants: Vec::new(),
            state_compare: None,
            state_validate: None,
            pubkey_to_identity: None,
            fixed_leader: None,
            initial_latency: DEFAULT_LATENCY,
            round_change_cap: DEFAULT_ROUND_CHANGE_CAP,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epoch(mut self, epoch: Instant) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_current_height(mut self, height: u64) -> Self {
        self.current_height = height;
        self
    }

    pub fn with_private_key(mut self, key: KeyPair) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_participants(mut self, participants: Vec<Identity>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_state_compare(mut self, compare: StateCompare) -> Self {
        self.state_compare = Some(compare);
        self
    }

    pub fn with_state_validate(mut self, validate: StateValidate) -> Self {
        self.state_validate = Some(validate);
        self
    }

    pub fn with_initial_latency(mut self, latency: Duration) -> Self {
        self.initial_latency = latency;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("current_height", &self.current_height)
            .field("participants", &self.participants.len())
            .field("fixed_leader", &self.fixed_leader)
            .field("initial_latency", &self.initial_latency)
            .field("round_change_cap", &self.round_change_cap)
            .finish_non_exhaustive()
    }
}

/// Check a configuration for completeness.
///
/// Fields are checked in a fixed order so a given incomplete configuration
/// always reports the same error.
pub fn verify_config(config: &Config) -> Result<(), ConsensusError> {
    if config.epoch.is_none() {
        return Err(ConsensusError::ConfigEpoch);
    }
    if config.state_compare.is_none() {
        return Err(ConsensusError::ConfigStateCompare);
    }
    if config.state_validate.is_none() {
        return Err(ConsensusError::ConfigStateValidate);
    }
    if config.private_key.is_none() {
        return Err(ConsensusError::ConfigPrivateKey);
    }
    if config.participants.len() < MINIMUM_PARTICIPANTS {
        return Err(ConsensusError::ConfigParticipants);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::default_pubkey_to_identity;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::sync::Arc;

    #[test]
    fn verify_config_reports_missing_fields_in_order() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let mut config = Config::new();
        assert_eq!(verify_config(&config), Err(ConsensusError::ConfigEpoch));

        config.epoch = Some(Instant::now());
        assert_eq!(
            verify_config(&config),
            Err(ConsensusError::ConfigStateCompare)
        );

        config.state_compare = Some(Arc::new(|a, b| a.cmp(b)));
        assert_eq!(
            verify_config(&config),
            Err(ConsensusError::ConfigStateValidate)
        );

        config.state_validate = Some(Arc::new(|_| true));
        assert_eq!(
            verify_config(&config),
            Err(ConsensusError::ConfigPrivateKey)
        );

        config.private_key = Some(KeyPair::generate(&mut rng));
        assert_eq!(
            verify_config(&config),
            Err(ConsensusError::ConfigParticipants)
        );

        for _ in 0..MINIMUM_PARTICIPANTS {
            let key = KeyPair::generate(&mut rng);
            config
                .participants
                .push(default_pubkey_to_identity(&key.public_key()));
        }
        assert_eq!(verify_config(&config), Ok(()));
    }
}
