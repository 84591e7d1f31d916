//! The consensus state machine.
//!
//! One [`Consensus`] instance per logical node. The engine is advanced by
//! [`Consensus::receive_message`] and [`Consensus::update`]; everything else
//! is observation ([`Consensus::current_state`]) or input
//! ([`Consensus::propose`]). No call blocks, suspends, or reads a clock;
//! callers serialize calls and thread `now` through them.
//!
//! # State Machine Flow
//!
//! 1. **Proposal** → the candidate state rides this node's `<roundchange>`
//! 2. **Round-change quorum** → enter the Lock stage, arm the lock timer
//! 3. **Leader lock timer** → broadcast `<lock>` (quorum-backed state) or
//!    `<select>` (maximal state), followers lock it and `<commit>`
//! 4. **Commit quorum** → the leader broadcasts `<decide>`, height advances
//! 5. **Any stall** → the timeout ladder walks the round into LockRelease
//!    and up to the next round, carrying held locks

use lockstep_types::{
    default_pubkey_to_identity, quorum, Hash, Identity, KeyPair, PubKeyToIdentity, PublicKey,
    State, StateCompare, StateValidate,
};
use lockstep_wire::{Message, MessageKind, SignedPacket, WireError, PROTOCOL_VERSION};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{verify_config, Config};
use crate::error::ConsensusError;
use crate::latency::LatencyEstimator;
use crate::locks::{LockEntry, LockSet};
use crate::outbound::OutboundMessage;
use crate::round::{RoundBook, Stage, StoredMessage};

/// Stage timeout multipliers over the latency estimate.
const LOCK_TIMEOUT_FACTOR: u32 = 2;
const COMMIT_TIMEOUT_FACTOR: u32 = 4;
const LOCK_RELEASE_TIMEOUT_FACTOR: u32 = 2;

/// Maximum exponent for the round-change back-off (2^6 = 64x the estimate).
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// The last installed decision.
#[derive(Debug, Clone)]
struct Decision {
    height: u64,
    round: u64,
    state: State,
    certificate: Vec<u8>,
}

/// Snapshot of the latest decided `(height, round, state)` plus the sealed
/// decision certificate (the encoded signed `<decide>` envelope).
///
/// Before the first decision, `height` is the configured current height and
/// `state`/`certificate` are empty.
#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    pub height: u64,
    pub round: u64,
    pub state: Option<State>,
    pub certificate: Option<Vec<u8>>,
}

/// Deterministic BFT consensus engine for one node.
pub struct Consensus {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    /// This node's identity, derived from its public key.
    identity: Identity,

    /// Signing key for every outgoing envelope.
    keypair: KeyPair,

    /// Ordered participant identities; quorum counting and leader rotation
    /// run over this list.
    participants: Vec<Identity>,

    /// Fixed leader override for tests and emulation.
    fixed_leader: Option<Identity>,

    // ═══════════════════════════════════════════════════════════════════════
    // Application hooks
    // ═══════════════════════════════════════════════════════════════════════
    state_compare: StateCompare,
    state_validate: StateValidate,
    pubkey_to_identity: PubKeyToIdentity,

    // ═══════════════════════════════════════════════════════════════════════
    // Chain state
    // ═══════════════════════════════════════════════════════════════════════
    /// Timer origin; also the initial round entry time.
    epoch: Instant,

    /// Last decided height. In-flight messages carry `current_height + 1`.
    current_height: u64,

    /// Round in progress at the current height.
    current_round: u64,

    /// Ordered per-round message containers.
    rounds: RoundBook,

    /// Lock observations carried across rounds.
    locks: LockSet,

    /// Candidate state submitted via [`Consensus::propose`].
    proposal: Option<State>,

    /// Last installed decision.
    decided: Option<Decision>,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers (absolute deadlines)
    // ═══════════════════════════════════════════════════════════════════════
    lock_timeout: Option<Instant>,
    commit_timeout: Option<Instant>,
    lock_release_timeout: Option<Instant>,
    round_change_timeout: Option<Instant>,

    // ═══════════════════════════════════════════════════════════════════════
    // Pacing
    // ═══════════════════════════════════════════════════════════════════════
    latency: LatencyEstimator,

    /// Round switches at the current height; exponent for the back-off.
    round_changes_at_height: u32,

    /// When the current round was entered; the quorum-assembly latency
    /// sample is measured from here.
    round_entered_at: Instant,

    /// Whether this node's `<roundchange>` went out for the current round.
    round_change_sent: bool,

    /// Upper bound for the round-change back-off.
    round_change_cap: Duration,

    // ═══════════════════════════════════════════════════════════════════════
    // Outbox
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcasts awaiting the transport. Drained by
    /// [`Consensus::take_outbound`].
    outbox: Vec<OutboundMessage>,
}

impl fmt::Debug for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consensus")
            .field("identity", &self.identity)
            .field("participants", &self.participants.len())
            .field("height", &self.current_height)
            .field("round", &self.current_round)
            .field("stage", &self.stage())
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl Consensus {
    /// Build an engine from a verified configuration.
    pub fn new(config: Config) -> Result<Self, ConsensusError> {
        verify_config(&config)?;
        let Config {
            epoch,
            current_height,
            private_key,
            participants,
            state_compare,
            state_validate,
            pubkey_to_identity,
            fixed_leader,
            initial_latency,
            round_change_cap,
        } = config;

        let epoch = epoch.ok_or(ConsensusError::ConfigEpoch)?;
        let keypair = private_key.ok_or(ConsensusError::ConfigPrivateKey)?;
        let state_compare = state_compare.ok_or(ConsensusError::ConfigStateCompare)?;
        let state_validate = state_validate.ok_or(ConsensusError::ConfigStateValidate)?;
        let pubkey_to_identity: PubKeyToIdentity =
            pubkey_to_identity.unwrap_or_else(|| Arc::new(default_pubkey_to_identity));
        let identity = pubkey_to_identity(&keypair.public_key());

        let mut rounds = RoundBook::new();
        rounds.get_or_create(0);

        info!(
            identity = ?identity,
            participants = participants.len(),
            height = current_height,
            "consensus engine initialized"
        );

        Ok(Consensus {
            identity,
            keypair,
            participants,
            fixed_leader,
            state_compare,
            state_validate,
            pubkey_to_identity,
            epoch,
            current_height,
            current_round: 0,
            rounds,
            locks: LockSet::new(),
            proposal: None,
            decided: None,
            lock_timeout: None,
            commit_timeout: None,
            lock_release_timeout: None,
            round_change_timeout: None,
            latency: LatencyEstimator::new(initial_latency),
            round_changes_at_height: 0,
            round_entered_at: epoch,
            round_change_sent: false,
            round_change_cap,
            outbox: Vec::new(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// This node's identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The configured timer origin.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Last decided height.
    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    /// Round in progress.
    pub fn current_round(&self) -> u64 {
        self.current_round
    }

    /// Stage of the round in progress.
    pub fn stage(&self) -> Stage {
        self.rounds
            .get(self.current_round)
            .map_or(Stage::RoundChanging, |container| container.stage)
    }

    /// The latest decided `(height, round, state)` and decision certificate.
    pub fn current_state(&self) -> CurrentState {
        match &self.decided {
            Some(decision) => CurrentState {
                height: decision.height,
                round: decision.round,
                state: Some(decision.state.clone()),
                certificate: Some(decision.certificate.clone()),
            },
            None => CurrentState {
                height: self.current_height,
                ..CurrentState::default()
            },
        }
    }

    /// Drain the outbox. The transport broadcasts every drained packet.
    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Override the latency estimate.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency.set(latency);
    }

    fn quorum(&self) -> usize {
        quorum(self.participants.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader Election
    // ═══════════════════════════════════════════════════════════════════════

    /// Leader for a `(height, round)` pair: the configured override, or the
    /// deterministic rotation over the participant list.
    fn leader_for(&self, height: u64, round: u64) -> Identity {
        if let Some(fixed) = self.fixed_leader {
            return fixed;
        }
        let index = height.wrapping_add(round) % self.participants.len() as u64;
        self.participants[index as usize]
    }

    fn is_leader(&self) -> bool {
        self.leader_for(self.current_height, self.current_round) == self.identity
    }

    /// Identity of a packet's signer. The signature must already have been
    /// verified; this only re-derives the identity from the coordinates.
    fn packet_identity(&self, packet: &SignedPacket) -> Option<Identity> {
        let key = PublicKey::from_coordinates(&packet.x, &packet.y).ok()?;
        Some((self.pubkey_to_identity)(&key))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Public Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Submit a candidate state for the next height.
    ///
    /// The candidate rides this node's `<roundchange>` messages until a lock
    /// takes precedence. Invalid candidates are dropped.
    pub fn propose(&mut self, state: State) {
        if !(self.state_validate)(&state) {
            warn!(identity = ?self.identity, "rejecting invalid proposal");
            return;
        }
        debug!(
            identity = ?self.identity,
            height = self.current_height + 1,
            state_hash = ?Hash::digest(&state),
            "proposal recorded"
        );
        self.proposal = Some(state);
    }

    /// Validate and absorb one wire message.
    ///
    /// Validation failures are returned to the caller and leave the engine
    /// unchanged; `now` is used for any timer armed by the message.
    #[instrument(skip_all, fields(identity = ?self.identity, height = self.current_height, round = self.current_round))]
    pub fn receive_message(&mut self, bytes: &[u8], now: Instant) -> Result<(), ConsensusError> {
        if bytes.is_empty() {
            return Err(ConsensusError::MessageIsEmpty);
        }
        let packet = SignedPacket::decode(bytes)?;
        let (message, signer) = self.verify_packet(&packet)?;
        trace!(kind = %message.kind(), signer = ?signer, "message verified");

        match message.kind() {
            MessageKind::RoundChange => {
                self.verify_round_change(&message)?;
                self.on_round_change(signer, message, packet, now);
            }
            MessageKind::Lock => {
                self.verify_lock(&message, &packet)?;
                self.on_lock_or_select(message, packet, now);
            }
            MessageKind::Select => {
                self.verify_select(&message, &packet)?;
                self.on_lock_or_select(message, packet, now);
            }
            MessageKind::LockRelease => {
                let (inner, inner_packet) = self.verify_lock_release(&message)?;
                self.on_lock_release(inner, inner_packet, now);
            }
            MessageKind::Commit => {
                self.verify_commit(&message)?;
                self.on_commit(signer, message, packet, now);
            }
            MessageKind::Decide => {
                self.verify_decide(&message, &packet)?;
                self.on_decide(message, packet, now);
            }
        }
        Ok(())
    }

    /// Fire expired timers and advance stages.
    ///
    /// Transition order within one call is fixed: decide first, then upward
    /// round switches, then stage-forward transitions.
    pub fn update(&mut self, now: Instant) -> Result<(), ConsensusError> {
        self.try_decide(now);
        self.try_advance_rounds(now);

        match self.stage() {
            Stage::RoundChanging => {
                let due = self
                    .round_change_timeout
                    .is_some_and(|deadline| now >= deadline);
                let has_data = self.proposal.is_some() || !self.locks.is_empty();
                if (!self.round_change_sent && has_data) || (self.round_change_sent && due) {
                    self.broadcast_round_change(now);
                }
            }
            Stage::Lock => {
                if self.lock_timeout.is_some_and(|deadline| now >= deadline) {
                    self.lock_timeout = None;
                    if self.is_leader() {
                        self.leader_propose(now);
                    } else {
                        debug!(
                            identity = ?self.identity,
                            round = self.current_round,
                            "lock stage timed out, moving to commit"
                        );
                        self.rounds.get_or_create(self.current_round).stage = Stage::Commit;
                        self.commit_timeout =
                            Some(now + self.latency.get() * COMMIT_TIMEOUT_FACTOR);
                    }
                }
            }
            Stage::Commit => {
                if self.commit_timeout.is_some_and(|deadline| now >= deadline) {
                    self.commit_timeout = None;
                    self.enter_lock_release(now);
                }
            }
            Stage::LockRelease => {
                if self
                    .lock_release_timeout
                    .is_some_and(|deadline| now >= deadline)
                {
                    self.lock_release_timeout = None;
                    let next = self.current_round + 1;
                    self.switch_round(next, now);
                }
            }
        }
        Ok(())
    }

    /// Standalone `<decide>` verification for external consumers.
    ///
    /// Runs the full envelope and proof validation and additionally requires
    /// the decided state to equal `expected_state`. Never installs.
    pub fn validate_decide_message(
        &self,
        bytes: &[u8],
        expected_state: &[u8],
    ) -> Result<(), ConsensusError> {
        if bytes.is_empty() {
            return Err(ConsensusError::MessageIsEmpty);
        }
        let packet = SignedPacket::decode(bytes)?;
        let (message, _) = self.verify_packet(&packet)?;
        if message.kind() != MessageKind::Decide {
            return Err(ConsensusError::MessageUnknownMessageType);
        }
        self.verify_decide(&message, &packet)?;
        if message.state() != Some(expected_state) {
            return Err(ConsensusError::DecideStateMismatch);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Envelope Verification
    // ═══════════════════════════════════════════════════════════════════════

    /// Verify an envelope and decode its inner message.
    ///
    /// Steps run in a fixed order, each with its own error: version,
    /// signature, participant membership, inner decode with a known kind.
    fn verify_packet(
        &self,
        packet: &SignedPacket,
    ) -> Result<(Message, Identity), ConsensusError> {
        if packet.version != PROTOCOL_VERSION {
            return Err(ConsensusError::MessageVersion);
        }
        let key = packet
            .verify_signature()
            .ok_or(ConsensusError::MessageSignature)?;
        let identity = (self.pubkey_to_identity)(&key);
        if !self.participants.contains(&identity) {
            return Err(ConsensusError::MessageUnknownParticipant);
        }
        let message = packet.message().map_err(|err| match err {
            WireError::UnknownMessageType(_) => ConsensusError::MessageUnknownMessageType,
            other => ConsensusError::Wire(other),
        })?;
        Ok((message, identity))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Per-Type Validation
    // ═══════════════════════════════════════════════════════════════════════

    fn verify_round_change(&self, message: &Message) -> Result<(), ConsensusError> {
        if message.height() != self.current_height + 1 {
            return Err(ConsensusError::RoundChangeHeightMismatch);
        }
        if message.round() < self.current_round {
            return Err(ConsensusError::RoundChangeRoundLower);
        }
        Ok(())
    }

    fn verify_lock(
        &self,
        message: &Message,
        packet: &SignedPacket,
    ) -> Result<(), ConsensusError> {
        self.verify_lock_fields(
            message.height(),
            message.round(),
            message.state(),
            message.proof(),
            packet,
        )
    }

    /// `<lock>` validation over raw fields.
    ///
    /// Shared with `<lock-release>`, whose embedded envelope is held to the
    /// same rules regardless of its decoded kind.
    fn verify_lock_fields(
        &self,
        height: u64,
        round: u64,
        state: Option<&[u8]>,
        proof: &[SignedPacket],
        packet: &SignedPacket,
    ) -> Result<(), ConsensusError> {
        let leader = self.leader_for(self.current_height, round);
        if self.packet_identity(packet) != Some(leader) {
            return Err(ConsensusError::LockNotSignedByLeader);
        }
        if height != self.current_height + 1 {
            return Err(ConsensusError::LockHeightMismatch);
        }
        if round < self.current_round {
            return Err(ConsensusError::LockRoundLower);
        }
        let state = state.ok_or(ConsensusError::LockEmptyState)?;
        if !(self.state_validate)(state) {
            return Err(ConsensusError::LockEmptyState);
        }

        let mut supporting: HashSet<Identity> = HashSet::new();
        for proof_packet in proof {
            let (proof_message, proof_signer) =
                self.verify_packet(proof_packet).map_err(|err| match err {
                    ConsensusError::MessageUnknownParticipant => {
                        ConsensusError::LockProofUnknownParticipant
                    }
                    other => other,
                })?;
            if proof_message.kind() != MessageKind::RoundChange {
                return Err(ConsensusError::LockProofTypeMismatch);
            }
            if proof_message.height() != height {
                return Err(ConsensusError::LockProofHeightMismatch);
            }
            if proof_message.round() != round {
                return Err(ConsensusError::LockProofRoundMismatch);
            }
            if let Some(proof_state) = proof_message.state() {
                if (self.state_compare)(proof_state, state) == Ordering::Equal {
                    supporting.insert(proof_signer);
                }
            }
        }
        if supporting.len() < self.quorum() {
            return Err(ConsensusError::LockProofInsufficient);
        }
        Ok(())
    }

    fn verify_select(
        &self,
        message: &Message,
        packet: &SignedPacket,
    ) -> Result<(), ConsensusError> {
        let round = message.round();
        let leader = self.leader_for(self.current_height, round);
        if self.packet_identity(packet) != Some(leader) {
            return Err(ConsensusError::SelectNotSignedByLeader);
        }
        if message.height() != self.current_height + 1 {
            return Err(ConsensusError::SelectHeightMismatch);
        }
        if round < self.current_round {
            return Err(ConsensusError::SelectRoundLower);
        }

        // One state observation per distinct proof signer.
        let mut observed: HashMap<Identity, Option<State>> = HashMap::new();
        for proof_packet in message.proof() {
            let (proof_message, proof_signer) =
                self.verify_packet(proof_packet).map_err(|err| match err {
                    ConsensusError::MessageUnknownParticipant => {
                        ConsensusError::SelectProofUnknownParticipant
                    }
                    other => other,
                })?;
            if proof_message.kind() != MessageKind::RoundChange {
                return Err(ConsensusError::SelectProofTypeMismatch);
            }
            if proof_message.height() != message.height() {
                return Err(ConsensusError::SelectProofHeightMismatch);
            }
            if proof_message.round() != round {
                return Err(ConsensusError::SelectProofRoundMismatch);
            }
            observed.insert(proof_signer, proof_message.state().map(<[u8]>::to_vec));
        }
        if observed.len() < self.quorum() {
            return Err(ConsensusError::SelectProofInsufficient);
        }

        // Quorum support for one identical state obligates a <lock>; a
        // <select> carrying it is rejected.
        let mut support: HashMap<Hash, usize> = HashMap::new();
        for state in observed.values().flatten() {
            *support.entry(Hash::digest(state)).or_insert(0) += 1;
        }
        if support.values().any(|&count| count >= self.quorum()) {
            return Err(ConsensusError::SelectProofExceeded);
        }

        // The message state must be the maximal observed state; all-null
        // proofs require a null message state.
        let mut max_state: Option<&[u8]> = None;
        for state in observed.values().flatten() {
            let state: &[u8] = state;
            let greater = max_state
                .is_none_or(|max| (self.state_compare)(state, max) == Ordering::Greater);
            if greater {
                max_state = Some(state);
            }
        }
        match (message.state(), max_state) {
            (None, None) => Ok(()),
            (None, Some(_)) | (Some(_), None) => Err(ConsensusError::SelectStateMismatch),
            (Some(state), Some(max)) => {
                if (self.state_compare)(state, max) != Ordering::Equal {
                    Err(ConsensusError::SelectProofNotTheMaximal)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn verify_lock_release(
        &self,
        message: &Message,
    ) -> Result<(Message, SignedPacket), ConsensusError> {
        if self.stage() != Stage::LockRelease {
            return Err(ConsensusError::LockReleaseStatus);
        }
        let inner_packet = match message {
            Message::LockRelease { lock: Some(lock) } => lock.as_ref(),
            _ => return Err(ConsensusError::MessageIsEmpty),
        };
        let (inner, _) = self.verify_packet(inner_packet)?;
        self.verify_lock_fields(
            inner.height(),
            inner.round(),
            inner.state(),
            inner.proof(),
            inner_packet,
        )?;
        Ok((inner, inner_packet.clone()))
    }

    fn verify_commit(&self, message: &Message) -> Result<(), ConsensusError> {
        if self.stage() != Stage::Commit {
            return Err(ConsensusError::CommitStatus);
        }
        if message.height() != self.current_height + 1 {
            return Err(ConsensusError::CommitHeightMismatch);
        }
        if message.round() != self.current_round {
            return Err(ConsensusError::CommitRoundMismatch);
        }
        let state = message.state().ok_or(ConsensusError::CommitEmptyState)?;
        let locked_hash = self
            .rounds
            .get(self.current_round)
            .and_then(|container| container.locked_state_hash);
        if locked_hash != Some(Hash::digest(state)) {
            return Err(ConsensusError::CommitStateMismatch);
        }
        Ok(())
    }

    fn verify_decide(
        &self,
        message: &Message,
        packet: &SignedPacket,
    ) -> Result<(), ConsensusError> {
        let height = message.height();
        // A <decide> at height h finalizes the work of (h - 1, round). The
        // saturation only matters for height 0, which the height check below
        // rejects anyway.
        let leader = self.leader_for(height.saturating_sub(1), message.round());
        if self.packet_identity(packet) != Some(leader) {
            return Err(ConsensusError::DecideNotSignedByLeader);
        }
        if height <= self.current_height {
            return Err(ConsensusError::DecideHeightLower);
        }
        let state = message.state().ok_or(ConsensusError::DecideEmptyState)?;

        let mut supporting: HashSet<Identity> = HashSet::new();
        for proof_packet in message.proof() {
            let (proof_message, proof_signer) =
                self.verify_packet(proof_packet).map_err(|err| match err {
                    ConsensusError::MessageUnknownParticipant => {
                        ConsensusError::DecideProofUnknownParticipant
                    }
                    other => other,
                })?;
            if proof_message.kind() != MessageKind::Commit {
                return Err(ConsensusError::DecideProofTypeMismatch);
            }
            if proof_message.height() != height {
                return Err(ConsensusError::DecideProofHeightMismatch);
            }
            if proof_message.round() != message.round() {
                return Err(ConsensusError::DecideProofRoundMismatch);
            }
            if proof_message.state() == Some(state) {
                supporting.insert(proof_signer);
            }
        }
        if supporting.len() < self.quorum() {
            return Err(ConsensusError::DecideProofInsufficient);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message Handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_round_change(
        &mut self,
        signer: Identity,
        message: Message,
        packet: SignedPacket,
        now: Instant,
    ) {
        let round = message.round();
        if !self
            .rounds
            .insert_round_change(signer, round, message, packet)
        {
            trace!(signer = ?signer, round, "duplicate <roundchange> discarded");
            return;
        }
        debug!(
            signer = ?signer,
            round,
            count = self.rounds.round_change_count(round),
            "<roundchange> recorded"
        );
        self.try_advance_rounds(now);
    }

    fn on_lock_or_select(&mut self, message: Message, packet: SignedPacket, now: Instant) {
        let kind = message.kind();
        let round = message.round();
        if round > self.current_round {
            self.switch_round(round, now);
        }
        let state = message.state().map(<[u8]>::to_vec);

        if kind == MessageKind::Lock {
            if let Some(state) = &state {
                self.locks
                    .insert(LockEntry::new(state.clone(), round, packet.clone()));
            }
        }

        {
            let container = self.rounds.get_or_create(self.current_round);
            match &state {
                Some(state) => container.lock(state.clone(), packet),
                None => container.unlock(),
            }
            container.stage = Stage::Commit;
        }
        self.lock_timeout = None;
        self.commit_timeout = Some(now + self.latency.get() * COMMIT_TIMEOUT_FACTOR);

        info!(
            identity = ?self.identity,
            kind = %kind,
            round = self.current_round,
            state_hash = ?state.as_deref().map(Hash::digest),
            "leader proposal accepted, entering commit stage"
        );

        if let Some(state) = state {
            self.broadcast_commit(state);
        }
        self.try_decide(now);
    }

    fn on_lock_release(&mut self, inner: Message, inner_packet: SignedPacket, now: Instant) {
        let round = inner.round();
        if round > self.current_round {
            self.switch_round(round, now);
        }

        // The release authorises dropping every lock at or below its round;
        // the embedded lock itself becomes the surviving evidence.
        self.locks.release_through(round);
        if let Some(state) = inner.state() {
            self.locks
                .insert(LockEntry::new(state.to_vec(), round, inner_packet));
        }
        {
            let container = self.rounds.get_or_create(self.current_round);
            container.unlock();
            container.stage = Stage::LockRelease;
        }
        if self.lock_release_timeout.is_none() {
            self.lock_release_timeout =
                Some(now + self.latency.get() * LOCK_RELEASE_TIMEOUT_FACTOR);
        }
        debug!(
            identity = ?self.identity,
            released_through = round,
            locks = self.locks.len(),
            "<lock-release> applied"
        );
    }

    fn on_commit(&mut self, signer: Identity, message: Message, packet: SignedPacket, now: Instant) {
        let container = self.rounds.get_or_create(self.current_round);
        container
            .commits
            .entry(signer)
            .or_insert(StoredMessage { message, packet });
        debug!(
            signer = ?signer,
            round = self.current_round,
            count = container.commits.len(),
            "<commit> recorded"
        );
        self.try_decide(now);
    }

    fn on_decide(&mut self, message: Message, packet: SignedPacket, now: Instant) {
        let Some(state) = message.state().map(<[u8]>::to_vec) else {
            return;
        };
        self.install_decision(message.height(), message.round(), state, packet, now);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage Machine
    // ═══════════════════════════════════════════════════════════════════════

    /// Upward round switches and the round-change quorum transition, in the
    /// fixed order: switch to the highest quorum round above the current
    /// one, then move RoundChanging → Lock if the current round has quorum.
    fn try_advance_rounds(&mut self, now: Instant) {
        if let Some(target) = self
            .rounds
            .quorum_round_above(self.current_round, self.quorum())
        {
            info!(
                identity = ?self.identity,
                from = self.current_round,
                to = target,
                "round-change quorum observed at a higher round"
            );
            self.switch_round(target, now);
        }
        self.try_enter_lock_stage(now);
    }

    fn try_enter_lock_stage(&mut self, now: Instant) {
        if self.stage() != Stage::RoundChanging {
            return;
        }
        if self.rounds.round_change_count(self.current_round) < self.quorum() {
            return;
        }
        self.latency
            .observe(now.saturating_duration_since(self.round_entered_at));
        self.rounds.get_or_create(self.current_round).stage = Stage::Lock;
        self.lock_timeout = Some(now + self.latency.get() * LOCK_TIMEOUT_FACTOR);
        debug!(
            identity = ?self.identity,
            round = self.current_round,
            "round-change quorum reached, entering lock stage"
        );
    }

    /// Move to a strictly higher round, carrying the local lock.
    fn switch_round(&mut self, new_round: u64, now: Instant) {
        debug_assert!(new_round > self.current_round);
        info!(
            identity = ?self.identity,
            from = self.current_round,
            to = new_round,
            "switching round"
        );

        let carried = self.rounds.get_mut(self.current_round).and_then(|container| {
            let state = container.locked_state.take();
            let packet = container.locked_packet.take();
            container.locked_state_hash = None;
            state.zip(packet)
        });
        if let Some((state, packet)) = carried {
            self.locks
                .insert(LockEntry::new(state, self.current_round, packet));
        }

        self.rounds.prune_below(new_round);
        self.current_round = new_round;
        self.rounds.get_or_create(new_round);
        self.round_changes_at_height = self.round_changes_at_height.saturating_add(1);
        self.round_entered_at = now;
        self.round_change_sent = false;
        self.lock_timeout = None;
        self.commit_timeout = None;
        self.lock_release_timeout = None;

        self.broadcast_round_change(now);
    }

    /// Leader action at lock timeout: a quorum-backed identical state turns
    /// into a `<lock>`; anything else becomes a `<select>` carrying the
    /// maximal observed state.
    #[instrument(skip_all, fields(identity = ?self.identity, round = self.current_round))]
    fn leader_propose(&mut self, now: Instant) {
        let height = self.current_height + 1;
        let round = self.current_round;
        let threshold = self.quorum();

        let mut grouped: HashMap<Hash, (State, Vec<SignedPacket>)> = HashMap::new();
        let mut all_proofs: Vec<SignedPacket> = Vec::new();
        let mut max_state: Option<State> = None;
        if let Some(container) = self.rounds.get(round) {
            for stored in container.round_changes.values() {
                all_proofs.push(stored.packet.clone());
                if let Some(state) = stored.message.state() {
                    grouped
                        .entry(Hash::digest(state))
                        .or_insert_with(|| (state.to_vec(), Vec::new()))
                        .1
                        .push(stored.packet.clone());
                    let greater = max_state.as_deref().is_none_or(|max| {
                        (self.state_compare)(state, max) == Ordering::Greater
                    });
                    if greater {
                        max_state = Some(state.to_vec());
                    }
                }
            }
        }

        let lockable = grouped
            .into_values()
            .find(|(state, packets)| packets.len() >= threshold && (self.state_validate)(state));

        if let Some((state, proof)) = lockable {
            let message = Message::Lock {
                height,
                round,
                state: Some(state.clone()),
                proof,
            };
            let packet = SignedPacket::sign(&message, &self.keypair);
            info!(state_hash = ?Hash::digest(&state), "broadcasting <lock>");
            self.outbox
                .push(OutboundMessage::new(MessageKind::Lock, packet.clone()));

            self.locks
                .insert(LockEntry::new(state.clone(), round, packet.clone()));
            {
                let container = self.rounds.get_or_create(round);
                container.lock(state.clone(), packet);
                container.stage = Stage::Commit;
            }
            self.commit_timeout = Some(now + self.latency.get() * COMMIT_TIMEOUT_FACTOR);
            self.broadcast_commit(state);
            self.try_decide(now);
        } else {
            let message = Message::Select {
                height,
                round,
                state: max_state.clone(),
                proof: all_proofs,
            };
            let packet = SignedPacket::sign(&message, &self.keypair);
            info!(
                state_hash = ?max_state.as_deref().map(Hash::digest),
                "no quorum-backed state, broadcasting <select>"
            );
            self.outbox
                .push(OutboundMessage::new(MessageKind::Select, packet.clone()));

            {
                let container = self.rounds.get_or_create(round);
                match &max_state {
                    Some(state) => container.lock(state.clone(), packet),
                    None => container.unlock(),
                }
                container.stage = Stage::LockRelease;
            }
            self.lock_release_timeout =
                Some(now + self.latency.get() * LOCK_RELEASE_TIMEOUT_FACTOR);
        }
    }

    /// Commit stage timed out without a quorum of commits.
    fn enter_lock_release(&mut self, now: Instant) {
        let compare = self.state_compare.clone();
        self.locks.retain_maximal(&compare);
        self.rounds.get_or_create(self.current_round).stage = Stage::LockRelease;
        self.lock_release_timeout = Some(now + self.latency.get() * LOCK_RELEASE_TIMEOUT_FACTOR);
        debug!(
            identity = ?self.identity,
            round = self.current_round,
            locks = self.locks.len(),
            "commit stage timed out, entering lock-release"
        );

        // Re-broadcast the held <lock> so peers may release theirs too.
        let held = self
            .locks
            .maximal(&compare)
            .map(|entry| entry.packet.clone());
        if let Some(packet) = held {
            if matches!(Message::decode(&packet.message), Ok(Message::Lock { .. })) {
                let message = Message::LockRelease {
                    lock: Some(Box::new(packet)),
                };
                let signed = SignedPacket::sign(&message, &self.keypair);
                self.outbox
                    .push(OutboundMessage::new(MessageKind::LockRelease, signed));
            }
        }
    }

    /// Leader-only: turn a quorum of commits into a `<decide>`.
    fn try_decide(&mut self, now: Instant) {
        if self.stage() != Stage::Commit || !self.is_leader() {
            return;
        }
        let threshold = self.quorum();
        let Some(container) = self.rounds.get(self.current_round) else {
            return;
        };
        let Some(state) = container.locked_state.clone() else {
            return;
        };
        if container.commits.len() < threshold {
            return;
        }
        let proof: Vec<SignedPacket> = container
            .commits
            .values()
            .map(|stored| stored.packet.clone())
            .collect();

        let height = self.current_height + 1;
        let round = self.current_round;
        let message = Message::Decide {
            height,
            round,
            state: Some(state.clone()),
            proof,
        };
        let packet = SignedPacket::sign(&message, &self.keypair);
        info!(
            identity = ?self.identity,
            height,
            round,
            commits = threshold,
            "commit quorum reached, broadcasting <decide>"
        );
        self.outbox
            .push(OutboundMessage::new(MessageKind::Decide, packet.clone()));
        self.install_decision(height, round, state, packet, now);
    }

    /// Install a decision: the height becomes terminal and all per-height
    /// state resets.
    fn install_decision(
        &mut self,
        height: u64,
        round: u64,
        state: State,
        packet: SignedPacket,
        now: Instant,
    ) {
        info!(
            identity = ?self.identity,
            height,
            round,
            state_hash = ?Hash::digest(&state),
            "height decided"
        );
        self.decided = Some(Decision {
            height,
            round,
            state,
            certificate: packet.encode(),
        });
        self.current_height = height;
        self.current_round = 0;
        self.rounds.clear();
        self.rounds.get_or_create(0);
        self.locks.clear();
        self.proposal = None;
        self.round_changes_at_height = 0;
        self.lock_timeout = None;
        self.commit_timeout = None;
        self.lock_release_timeout = None;
        self.round_change_timeout = None;
        self.round_entered_at = now;
        self.round_change_sent = false;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Broadcasts
    // ═══════════════════════════════════════════════════════════════════════

    /// Broadcast this node's `<roundchange>` for the current round.
    ///
    /// The carried state is the maximal held lock, falling back to the local
    /// proposal. The node's own message counts toward the quorum.
    fn broadcast_round_change(&mut self, now: Instant) {
        let state = self
            .locks
            .maximal(&self.state_compare)
            .map(|entry| entry.state.clone())
            .or_else(|| self.proposal.clone());
        let message = Message::RoundChange {
            height: self.current_height + 1,
            round: self.current_round,
            state,
        };
        let packet = SignedPacket::sign(&message, &self.keypair);
        debug!(
            identity = ?self.identity,
            round = self.current_round,
            "broadcasting <roundchange>"
        );
        self.rounds.insert_round_change(
            self.identity,
            self.current_round,
            message,
            packet.clone(),
        );
        self.outbox
            .push(OutboundMessage::new(MessageKind::RoundChange, packet));
        self.round_change_sent = true;
        self.round_change_timeout = Some(now + self.round_change_backoff());
        self.try_enter_lock_stage(now);
    }

    /// Broadcast and self-record a `<commit>` over the locked state.
    fn broadcast_commit(&mut self, state: State) {
        let message = Message::Commit {
            height: self.current_height + 1,
            round: self.current_round,
            state: Some(state),
        };
        let packet = SignedPacket::sign(&message, &self.keypair);
        debug!(
            identity = ?self.identity,
            round = self.current_round,
            "broadcasting <commit>"
        );
        self.rounds
            .get_or_create(self.current_round)
            .commits
            .insert(
                self.identity,
                StoredMessage {
                    message,
                    packet: packet.clone(),
                },
            );
        self.outbox
            .push(OutboundMessage::new(MessageKind::Commit, packet));
    }

    /// Round-change rebroadcast interval: `min(2^k * latency, cap)` with `k`
    /// the number of round switches at the current height.
    fn round_change_backoff(&self) -> Duration {
        let exponent = self.round_changes_at_height.min(MAX_BACKOFF_EXPONENT);
        let backoff = self.latency.get() * 2u32.pow(exponent);
        backoff.min(self.round_change_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MINIMUM_PARTICIPANTS;
    use lockstep_wire::test_utils::{self, ProposalFixture};
    use rand::{Rng, RngCore};
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    const HOUR: Duration = Duration::from_secs(3600);

    fn rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    fn identity_of(key: &KeyPair) -> Identity {
        default_pubkey_to_identity(&key.public_key())
    }

    fn pubkeys(keys: &[KeyPair]) -> Vec<PublicKey> {
        keys.iter().map(KeyPair::public_key).collect()
    }

    /// Engine at the given height and round. The participant list is this
    /// node followed by `keys`, padded with random identities up to the
    /// configured minimum.
    fn consensus_at(
        height: u64,
        round: u64,
        keys: &[PublicKey],
        rng: &mut ChaCha20Rng,
    ) -> Consensus {
        let own = KeyPair::generate(rng);
        let mut participants = vec![default_pubkey_to_identity(&own.public_key())];
        participants.extend(keys.iter().map(default_pubkey_to_identity));
        while participants.len() < MINIMUM_PARTICIPANTS {
            let filler = KeyPair::generate(rng);
            participants.push(default_pubkey_to_identity(&filler.public_key()));
        }
        let config = Config::new()
            .with_epoch(Instant::now())
            .with_current_height(height)
            .with_private_key(own)
            .with_participants(participants)
            .with_state_compare(Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)))
            .with_state_validate(Arc::new(|_: &[u8]| true));
        let mut consensus = Consensus::new(config).expect("valid config");
        if round > 0 {
            consensus.current_round = round;
            consensus.rounds.get_or_create(round);
        }
        consensus
    }

    fn set_leader(consensus: &mut Consensus, key: &KeyPair) {
        consensus.fixed_leader = Some(identity_of(key));
    }

    fn add_participant(consensus: &mut Consensus, key: &KeyPair) {
        let id = identity_of(key);
        if !consensus.participants.contains(&id) {
            consensus.participants.push(id);
        }
    }

    fn resign_packet(packet: &mut SignedPacket, key: &KeyPair) {
        let signature = key.sign(&packet.signing_digest());
        packet.r = signature.r;
        packet.s = signature.s;
    }

    fn lock_proofs(fixture: &mut ProposalFixture) -> &mut Vec<SignedPacket> {
        match &mut fixture.message {
            Message::Lock { proof, .. }
            | Message::Select { proof, .. }
            | Message::Decide { proof, .. } => proof,
            _ => panic!("fixture has no proofs"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Envelope verification
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn empty_input_is_rejected() {
        let mut rng = rng(100);
        let mut consensus = consensus_at(0, 0, &[], &mut rng);
        let now = consensus.epoch;
        assert_eq!(
            consensus.receive_message(&[], now),
            Err(ConsensusError::MessageIsEmpty)
        );
    }

    #[test]
    fn well_signed_participant_message_verifies() {
        let mut rng = rng(101);
        let key = KeyPair::generate(&mut rng);
        let consensus = consensus_at(0, 0, &[key.public_key()], &mut rng);
        let message = Message::RoundChange {
            height: 0,
            round: 0,
            state: None,
        };
        let packet = SignedPacket::sign(&message, &key);
        let (decoded, signer) = consensus.verify_packet(&packet).expect("verifies");
        assert_eq!(decoded, message);
        assert_eq!(signer, identity_of(&key));
    }

    #[test]
    fn corrupted_signature_is_rejected() {
        let mut rng = rng(102);
        let key = KeyPair::generate(&mut rng);
        let consensus = consensus_at(0, 0, &[key.public_key()], &mut rng);
        let message = Message::RoundChange {
            height: 1,
            round: 0,
            state: Some(vec![1]),
        };
        let mut packet = SignedPacket::sign(&message, &key);
        rng.fill_bytes(&mut packet.r);
        rng.fill_bytes(&mut packet.s);
        assert_eq!(
            consensus.verify_packet(&packet).map(|_| ()),
            Err(ConsensusError::MessageSignature)
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut rng = rng(103);
        let key = KeyPair::generate(&mut rng);
        let mut consensus = consensus_at(0, 0, &[key.public_key()], &mut rng);
        let now = consensus.epoch;
        let message = Message::RoundChange {
            height: 1,
            round: 0,
            state: Some(vec![1]),
        };
        let mut packet = SignedPacket::sign(&message, &key);
        packet.version = 42;
        resign_packet(&mut packet, &key);
        assert_eq!(
            consensus.receive_message(&packet.encode(), now),
            Err(ConsensusError::MessageVersion)
        );
    }

    #[test]
    fn unknown_message_kind_is_rejected() {
        let mut rng = rng(104);
        let key = KeyPair::generate(&mut rng);
        let mut consensus = consensus_at(0, 0, &[key.public_key()], &mut rng);
        let now = consensus.epoch;

        let mut inner = Message::Commit {
            height: 1,
            round: 0,
            state: Some(vec![9]),
        }
        .encode();
        assert_eq!(inner[0], 0x08);
        inner[1] = 42;

        let mut packet = SignedPacket::sign(
            &Message::RoundChange {
                height: 0,
                round: 0,
                state: None,
            },
            &key,
        );
        packet.message = inner;
        resign_packet(&mut packet, &key);
        assert_eq!(
            consensus.receive_message(&packet.encode(), now),
            Err(ConsensusError::MessageUnknownMessageType)
        );
    }

    #[test]
    fn unknown_participant_is_rejected() {
        let mut rng = rng(105);
        let outsider = KeyPair::generate(&mut rng);
        let consensus = consensus_at(0, 0, &[], &mut rng);
        let message = Message::RoundChange {
            height: 1,
            round: 0,
            state: Some(vec![1]),
        };
        let packet = SignedPacket::sign(&message, &outsider);
        assert_eq!(
            consensus.verify_packet(&packet).map(|_| ()),
            Err(ConsensusError::MessageUnknownParticipant)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <roundchange> validation
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn round_change_accepted_at_next_height() {
        let mut rng = rng(110);
        let consensus = consensus_at(9, 10, &[], &mut rng);
        let message = Message::RoundChange {
            height: 10,
            round: 10,
            state: Some(test_utils::random_state(&mut rng)),
        };
        assert_eq!(consensus.verify_round_change(&message), Ok(()));
    }

    #[test]
    fn round_change_height_mismatch() {
        let mut rng = rng(111);
        let consensus = consensus_at(10, 10, &[], &mut rng);
        let message = Message::RoundChange {
            height: 20,
            round: 10,
            state: None,
        };
        assert_eq!(
            consensus.verify_round_change(&message),
            Err(ConsensusError::RoundChangeHeightMismatch)
        );
    }

    #[test]
    fn round_change_round_lower() {
        let mut rng = rng(112);
        let consensus = consensus_at(19, 10, &[], &mut rng);
        let message = Message::RoundChange {
            height: 20,
            round: 9,
            state: None,
        };
        assert_eq!(
            consensus.verify_round_change(&message),
            Err(ConsensusError::RoundChangeRoundLower)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <lock> validation
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn lock_message_valid() {
        let mut rng = rng(120);
        let fixture = test_utils::lock_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Ok(())
        );
    }

    #[test]
    fn lock_height_mismatch() {
        let mut rng = rng(121);
        let fixture = test_utils::lock_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(10, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockHeightMismatch)
        );
    }

    #[test]
    fn lock_round_lower() {
        let mut rng = rng(122);
        let fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 1, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockRoundLower)
        );
    }

    #[test]
    fn lock_empty_state() {
        let mut rng = rng(123);
        let fixture = test_utils::lock_message_state(20, None, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockEmptyState)
        );
    }

    #[test]
    fn lock_state_failing_the_predicate_is_rejected() {
        let mut rng = rng(124);
        let fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        consensus.state_validate = Arc::new(|_: &[u8]| false);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockEmptyState)
        );
    }

    #[test]
    fn lock_not_signed_by_leader() {
        let mut rng = rng(125);
        let fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        let other = KeyPair::generate(&mut rng);
        set_leader(&mut consensus, &other);
        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockNotSignedByLeader)
        );
    }

    #[test]
    fn lock_proof_bad_signature_surfaces_as_message_signature() {
        let mut rng = rng(126);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let proofs = lock_proofs(&mut fixture);
        rng.fill_bytes(&mut proofs[7].r);
        rng.fill_bytes(&mut proofs[7].s);
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::MessageSignature)
        );
    }

    #[test]
    fn lock_proof_type_mismatch() {
        let mut rng = rng(127);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let bad = SignedPacket::sign(
            &Message::Lock {
                height: 1,
                round: 0,
                state,
                proof: vec![],
            },
            &intruder,
        );
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockProofTypeMismatch)
        );
    }

    #[test]
    fn lock_proof_height_mismatch() {
        let mut rng = rng(128);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::round_change_signed(999, 0, state, &intruder);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockProofHeightMismatch)
        );
    }

    #[test]
    fn lock_proof_round_mismatch() {
        let mut rng = rng(129);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::round_change_signed(1, 999, state, &intruder);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockProofRoundMismatch)
        );
    }

    #[test]
    fn lock_proof_unknown_participant() {
        let mut rng = rng(130);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let outsider = KeyPair::generate(&mut rng);
        let (_, bad) = test_utils::round_change_signed(1, 0, state, &outsider);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockProofUnknownParticipant)
        );
    }

    #[test]
    fn lock_proof_insufficient() {
        let mut rng = rng(131);
        let mut fixture = test_utils::lock_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        // Drop one of the quorum-supporting proofs (the first 13 of 20).
        lock_proofs(&mut fixture).remove(2);
        fixture.resign();

        assert_eq!(
            consensus.verify_lock(&fixture.message, &fixture.packet),
            Err(ConsensusError::LockProofInsufficient)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <select> validation
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn select_message_valid() {
        let mut rng = rng(140);
        let fixture = test_utils::select_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Ok(())
        );
    }

    #[test]
    fn select_height_mismatch() {
        let mut rng = rng(141);
        let fixture = test_utils::select_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(10, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectHeightMismatch)
        );
    }

    #[test]
    fn select_round_lower() {
        let mut rng = rng(142);
        let fixture = test_utils::select_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 11, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectRoundLower)
        );
    }

    #[test]
    fn select_not_signed_by_leader() {
        let mut rng = rng(143);
        let fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        let other = KeyPair::generate(&mut rng);
        set_leader(&mut consensus, &other);
        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectNotSignedByLeader)
        );
    }

    #[test]
    fn select_proof_bad_signature_surfaces_as_message_signature() {
        let mut rng = rng(144);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let proofs = lock_proofs(&mut fixture);
        rng.fill_bytes(&mut proofs[11].r);
        rng.fill_bytes(&mut proofs[11].s);
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::MessageSignature)
        );
    }

    #[test]
    fn select_proof_type_mismatch() {
        let mut rng = rng(145);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let bad = SignedPacket::sign(
            &Message::Lock {
                height: 1,
                round: 0,
                state,
                proof: vec![],
            },
            &intruder,
        );
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofTypeMismatch)
        );
    }

    #[test]
    fn select_proof_height_mismatch() {
        let mut rng = rng(146);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::round_change_signed(
            999,
            0,
            Some(test_utils::random_state(&mut rng)),
            &intruder,
        );
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofHeightMismatch)
        );
    }

    #[test]
    fn select_proof_round_mismatch() {
        let mut rng = rng(147);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::round_change_signed(
            1,
            999,
            Some(test_utils::random_state(&mut rng)),
            &intruder,
        );
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofRoundMismatch)
        );
    }

    #[test]
    fn select_proof_unknown_participant() {
        let mut rng = rng(148);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let outsider = KeyPair::generate(&mut rng);
        let (_, bad) = test_utils::round_change_signed(
            1,
            0,
            Some(test_utils::random_state(&mut rng)),
            &outsider,
        );
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofUnknownParticipant)
        );
    }

    #[test]
    fn select_proof_insufficient() {
        let mut rng = rng(149);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        // 12 distinct signers is one short of the quorum of 13.
        lock_proofs(&mut fixture).truncate(12);
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofInsufficient)
        );
    }

    #[test]
    fn select_state_not_the_maximal() {
        let mut rng = rng(150);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        if let Message::Select { state, .. } = &mut fixture.message {
            *state = Some(vec![0u8; 1024]);
        }
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofNotTheMaximal)
        );
    }

    #[test]
    fn select_null_state_with_stateful_proofs_is_rejected() {
        let mut rng = rng(151);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        if let Message::Select { state, .. } = &mut fixture.message {
            *state = None;
        }
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectStateMismatch)
        );
    }

    #[test]
    fn select_with_quorum_backed_state_is_exceeded() {
        let mut rng = rng(152);
        let mut fixture = test_utils::select_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let max_state = fixture.message.state().map(<[u8]>::to_vec);
        let threshold = consensus.quorum();
        assert_eq!(threshold, 13);

        // Replace the first 13 proofs (and their participant slots) with
        // fresh signers all supporting the maximal state: quorum support for
        // one state obligates a <lock>, so this <select> must be rejected.
        consensus.participants.drain(..threshold);
        for slot in 0..threshold {
            let replacement = KeyPair::generate(&mut rng);
            add_participant(&mut consensus, &replacement);
            let (_, packet) =
                test_utils::round_change_signed(1, 0, max_state.clone(), &replacement);
            lock_proofs(&mut fixture)[slot] = packet;
        }
        fixture.resign();

        assert_eq!(
            consensus.verify_select(&fixture.message, &fixture.packet),
            Err(ConsensusError::SelectProofExceeded)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <lock-release> validation
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn lock_release_valid() {
        let mut rng = rng(160);
        let fixture = test_utils::lock_release_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);

        // Leader rotation over the proof signers alone puts the lock's
        // signer first.
        consensus.participants.remove(0);
        consensus.rounds.get_or_create(0).stage = Stage::LockRelease;

        let (inner, _) = consensus
            .verify_lock_release(&fixture.message)
            .expect("valid lock-release");
        assert_eq!(inner.kind(), MessageKind::Lock);
    }

    #[test]
    fn lock_release_outside_stage_is_rejected() {
        let mut rng = rng(161);
        let fixture = test_utils::lock_release_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        consensus.participants.remove(0);

        assert_eq!(
            consensus.verify_lock_release(&fixture.message).map(|_| ()),
            Err(ConsensusError::LockReleaseStatus)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <commit> validation
    // ═══════════════════════════════════════════════════════════════════════

    fn commit_consensus(
        state: &[u8],
        key: &KeyPair,
        rng: &mut ChaCha20Rng,
    ) -> Consensus {
        let mut consensus = consensus_at(9, 10, &[key.public_key()], rng);
        let container = consensus.rounds.get_or_create(10);
        container.stage = Stage::Commit;
        container.locked_state = Some(state.to_vec());
        container.locked_state_hash = Some(Hash::digest(state));
        consensus
    }

    #[test]
    fn commit_valid() {
        let mut rng = rng(170);
        let key = KeyPair::generate(&mut rng);
        let state = test_utils::random_state(&mut rng);
        let consensus = commit_consensus(&state, &key, &mut rng);
        let (message, _) = test_utils::commit_signed(10, 10, Some(state), &key);
        assert_eq!(consensus.verify_commit(&message), Ok(()));
    }

    #[test]
    fn commit_empty_state() {
        let mut rng = rng(171);
        let key = KeyPair::generate(&mut rng);
        let mut consensus = consensus_at(9, 10, &[key.public_key()], &mut rng);
        consensus.rounds.get_or_create(10).stage = Stage::Commit;
        let (message, _) = test_utils::commit_signed(10, 10, None, &key);
        assert_eq!(
            consensus.verify_commit(&message),
            Err(ConsensusError::CommitEmptyState)
        );
    }

    #[test]
    fn commit_height_mismatch() {
        let mut rng = rng(172);
        let key = KeyPair::generate(&mut rng);
        let state = test_utils::random_state(&mut rng);
        let consensus = commit_consensus(&state, &key, &mut rng);
        let (message, _) = test_utils::commit_signed(1, 10, Some(state), &key);
        assert_eq!(
            consensus.verify_commit(&message),
            Err(ConsensusError::CommitHeightMismatch)
        );
    }

    #[test]
    fn commit_round_mismatch() {
        let mut rng = rng(173);
        let key = KeyPair::generate(&mut rng);
        let state = test_utils::random_state(&mut rng);
        let consensus = commit_consensus(&state, &key, &mut rng);
        let (message, _) = test_utils::commit_signed(10, 1, Some(state), &key);
        assert_eq!(
            consensus.verify_commit(&message),
            Err(ConsensusError::CommitRoundMismatch)
        );
    }

    #[test]
    fn commit_state_mismatch() {
        let mut rng = rng(174);
        let key = KeyPair::generate(&mut rng);
        let locked = test_utils::random_state(&mut rng);
        let consensus = commit_consensus(&locked, &key, &mut rng);
        let other = test_utils::random_state(&mut rng);
        let (message, _) = test_utils::commit_signed(10, 10, Some(other), &key);
        assert_eq!(
            consensus.verify_commit(&message),
            Err(ConsensusError::CommitStateMismatch)
        );
    }

    #[test]
    fn commit_outside_stage_is_rejected() {
        let mut rng = rng(175);
        let key = KeyPair::generate(&mut rng);
        let state = test_utils::random_state(&mut rng);
        let consensus = consensus_at(9, 10, &[key.public_key()], &mut rng);
        let (message, _) = test_utils::commit_signed(10, 10, Some(state), &key);
        assert_eq!(
            consensus.verify_commit(&message),
            Err(ConsensusError::CommitStatus)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // <decide> validation
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn decide_valid() {
        let mut rng = rng(180);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Ok(())
        );
    }

    #[test]
    fn validate_decide_message_accepts_matching_state() {
        let mut rng = rng(181);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        let expected = fixture.message.state().expect("decide carries a state");
        assert_eq!(
            consensus.validate_decide_message(&fixture.packet.encode(), expected),
            Ok(())
        );
    }

    #[test]
    fn validate_decide_message_rejects_unknown_signers() {
        let mut rng = rng(182);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let expected = fixture.message.state().expect("decide carries a state");
        let stranger = consensus_at(9, 10, &[], &mut rng);
        assert!(stranger
            .validate_decide_message(&fixture.packet.encode(), expected)
            .is_err());
    }

    #[test]
    fn validate_decide_message_rejects_wrong_expected_state() {
        let mut rng = rng(183);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.validate_decide_message(&fixture.packet.encode(), b"different"),
            Err(ConsensusError::DecideStateMismatch)
        );
    }

    #[test]
    fn decide_empty_state() {
        let mut rng = rng(184);
        let mut fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        if let Message::Decide { state, .. } = &mut fixture.message {
            *state = None;
        }
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideEmptyState)
        );
    }

    #[test]
    fn decide_height_lower() {
        let mut rng = rng(185);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(10, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);
        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideHeightLower)
        );
    }

    #[test]
    fn decide_not_signed_by_leader() {
        let mut rng = rng(186);
        let fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        let other = KeyPair::generate(&mut rng);
        set_leader(&mut consensus, &other);
        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideNotSignedByLeader)
        );
    }

    #[test]
    fn decide_proof_type_mismatch() {
        let mut rng = rng(187);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::round_change_signed(1, 0, state, &intruder);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideProofTypeMismatch)
        );
    }

    #[test]
    fn decide_proof_height_mismatch() {
        let mut rng = rng(188);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::commit_signed(999, 0, state, &intruder);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideProofHeightMismatch)
        );
    }

    #[test]
    fn decide_proof_round_mismatch() {
        let mut rng = rng(189);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let intruder = KeyPair::generate(&mut rng);
        add_participant(&mut consensus, &intruder);
        let (_, bad) = test_utils::commit_signed(1, 999, state, &intruder);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideProofRoundMismatch)
        );
    }

    #[test]
    fn decide_proof_unknown_participant() {
        let mut rng = rng(190);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let state = fixture.message.state().map(<[u8]>::to_vec);
        let outsider = KeyPair::generate(&mut rng);
        let (_, bad) = test_utils::commit_signed(1, 0, state, &outsider);
        lock_proofs(&mut fixture)[5] = bad;
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideProofUnknownParticipant)
        );
    }

    #[test]
    fn decide_proof_bad_signature_surfaces_as_message_signature() {
        let mut rng = rng(191);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        let proofs = lock_proofs(&mut fixture);
        rng.fill_bytes(&mut proofs[9].r);
        rng.fill_bytes(&mut proofs[9].s);
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::MessageSignature)
        );
    }

    #[test]
    fn decide_proof_insufficient() {
        let mut rng = rng(192);
        let mut fixture = test_utils::decide_message(20, 1, 0, 1, 0, &mut rng);
        let mut consensus = consensus_at(0, 0, &pubkeys(&fixture.proof_keys), &mut rng);
        set_leader(&mut consensus, &fixture.signer);

        lock_proofs(&mut fixture).remove(4);
        fixture.resign();

        assert_eq!(
            consensus.verify_decide(&fixture.message, &fixture.packet),
            Err(ConsensusError::DecideProofInsufficient)
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Engine behavior
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn round_change_flood_from_one_signer_keeps_one_message() {
        let mut rng = rng(200);
        let signer = KeyPair::generate(&mut rng);
        let mut consensus = consensus_at(1, 0, &[signer.public_key()], &mut rng);
        let now = consensus.epoch;
        let state = test_utils::random_state(&mut rng);

        let mut highest = 0u64;
        for _ in 0..10_000 {
            let round: u64 = rng.gen();
            highest = highest.max(round);
            let (_, packet) =
                test_utils::round_change_signed(2, round, Some(state.clone()), &signer);
            let _ = consensus.receive_message(&packet.encode(), now);
        }

        assert_eq!(consensus.rounds.total_round_changes(), 1);
        let retained: Vec<u64> = consensus
            .rounds
            .iter()
            .flat_map(|round| round.round_changes.values())
            .map(|stored| stored.message.round())
            .collect();
        assert_eq!(retained, vec![highest]);
    }

    #[test]
    fn duplicate_commits_keep_one_entry() {
        let mut rng = rng(201);
        let signer = KeyPair::generate(&mut rng);
        let mut consensus = consensus_at(0, 0, &[signer.public_key()], &mut rng);
        let now = consensus.epoch;
        for _ in 0..20 {
            let filler = KeyPair::generate(&mut rng);
            add_participant(&mut consensus, &filler);
        }
        let state = test_utils::random_state(&mut rng);
        {
            let container = consensus.rounds.get_or_create(0);
            container.stage = Stage::Commit;
            container.locked_state = Some(state.clone());
            container.locked_state_hash = Some(Hash::digest(&state));
        }

        let (_, packet) = test_utils::commit_signed(1, 0, Some(state), &signer);
        let bytes = packet.encode();
        for _ in 0..10_000 {
            consensus
                .receive_message(&bytes, now)
                .expect("commit accepted");
        }

        let total: usize = consensus.rounds.iter().map(|round| round.commits.len()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn lock_at_higher_rounds_switches_and_carries_locks() {
        let mut rng = rng(202);
        let first = test_utils::lock_message(20, 1, 10, 1, 10, &mut rng);
        let mut consensus = consensus_at(0, 1, &pubkeys(&first.proof_keys), &mut rng);
        let now = consensus.epoch;
        set_leader(&mut consensus, &first.signer);

        consensus
            .receive_message(&first.packet.encode(), now)
            .expect("first lock accepted");
        assert_eq!(consensus.current_round, 10);
        assert_eq!(consensus.stage(), Stage::Commit);
        assert_eq!(consensus.locks.len(), 1);

        // A different state locks at round 11: both survive.
        let second = test_utils::lock_message(20, 1, 11, 1, 11, &mut rng);
        consensus.participants = second.proof_keys.iter().map(identity_of).collect();
        set_leader(&mut consensus, &second.signer);
        consensus
            .receive_message(&second.packet.encode(), now)
            .expect("second lock accepted");
        assert_eq!(consensus.current_round, 11);
        assert_eq!(consensus.locks.len(), 2);

        // Round 12 re-locks the round-11 state: replaced, not duplicated.
        let second_state = second.message.state().map(<[u8]>::to_vec);
        let third = test_utils::lock_message_state(20, second_state, 1, 12, 1, 12, &mut rng);
        consensus.participants = third.proof_keys.iter().map(identity_of).collect();
        set_leader(&mut consensus, &third.signer);
        consensus
            .receive_message(&third.packet.encode(), now)
            .expect("third lock accepted");
        assert_eq!(consensus.current_round, 12);
        assert_eq!(consensus.locks.len(), 2);
    }

    #[test]
    fn lock_release_at_higher_rounds_replaces_locks() {
        let mut rng = rng(203);
        let first = test_utils::lock_release_message(20, 1, 10, 1, 10, &mut rng);
        let mut consensus = consensus_at(0, 1, &pubkeys(&first.proof_keys), &mut rng);
        let now = consensus.epoch;
        set_leader(&mut consensus, &first.signer);
        consensus.rounds.get_or_create(1).stage = Stage::LockRelease;

        consensus
            .receive_message(&first.packet.encode(), now)
            .expect("first lock-release accepted");
        assert_eq!(consensus.current_round, 10);
        assert_eq!(consensus.stage(), Stage::LockRelease);
        assert_eq!(consensus.locks.len(), 1);

        let second = test_utils::lock_release_message(20, 1, 11, 1, 11, &mut rng);
        consensus.participants = second.proof_keys.iter().map(identity_of).collect();
        set_leader(&mut consensus, &second.signer);
        consensus
            .receive_message(&second.packet.encode(), now)
            .expect("second lock-release accepted");
        assert_eq!(consensus.current_round, 11);
        assert_eq!(consensus.locks.len(), 1);
    }

    fn stage_walk(leader: bool) {
        let mut rng = rng(if leader { 204 } else { 205 });
        let mut keys = Vec::new();
        for _ in 0..20 {
            keys.push(KeyPair::generate(&mut rng));
        }
        let mut consensus = consensus_at(0, 0, &pubkeys(&keys), &mut rng);
        let epoch = consensus.epoch;
        if leader {
            consensus.fixed_leader = Some(consensus.identity);
        }

        for key in &keys {
            let state = test_utils::random_state(&mut rng);
            let (_, packet) = test_utils::round_change_signed(1, 1, Some(state), key);
            consensus
                .receive_message(&packet.encode(), epoch)
                .expect("roundchange accepted");
        }

        // Quorum observed at round 1: switched up and waiting on the leader.
        assert_eq!(consensus.current_round, 1);
        assert_eq!(consensus.stage(), Stage::Lock);
        assert!(consensus.lock_timeout.is_some());

        consensus.update(epoch + HOUR).expect("update");
        if leader {
            // Divergent states cannot form a <lock>; the leader selects and
            // moves straight to lock-release.
            assert_eq!(consensus.stage(), Stage::LockRelease);
            let kinds: Vec<&str> = consensus
                .take_outbound()
                .iter()
                .map(OutboundMessage::type_name)
                .collect();
            assert!(kinds.contains(&"select"));
        } else {
            assert_eq!(consensus.stage(), Stage::Commit);
            consensus.update(epoch + 2 * HOUR).expect("update");
            assert_eq!(consensus.stage(), Stage::LockRelease);
        }

        consensus.update(epoch + 3 * HOUR).expect("update");
        assert_eq!(consensus.stage(), Stage::RoundChanging);
        assert_eq!(consensus.current_round, 2);
    }

    #[test]
    fn stage_walk_for_leader() {
        stage_walk(true);
    }

    #[test]
    fn stage_walk_for_non_leader() {
        stage_walk(false);
    }

    #[test]
    fn commit_timeout_prunes_locks_to_the_maximal() {
        let mut rng = rng(206);
        let mut consensus = consensus_at(0, 0, &[], &mut rng);
        let epoch = consensus.epoch;
        consensus.rounds.get_or_create(0).stage = Stage::Commit;

        for round in 0..20u64 {
            let key = KeyPair::generate(&mut rng);
            let state = test_utils::random_state(&mut rng);
            let (_, packet) =
                test_utils::round_change_signed(1, round, Some(state.clone()), &key);
            consensus.locks.insert(LockEntry::new(state, round, packet));
        }
        consensus.commit_timeout = Some(epoch);

        consensus.update(epoch + HOUR).expect("update");
        assert_eq!(consensus.stage(), Stage::LockRelease);
        assert_eq!(consensus.locks.len(), 1);
    }

    #[test]
    fn proposal_rides_the_round_change() {
        let mut rng = rng(207);
        let mut consensus = consensus_at(0, 0, &[], &mut rng);
        let epoch = consensus.epoch;
        consensus.propose(vec![1, 2, 3]);
        consensus.update(epoch).expect("update");

        let outbound = consensus.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].type_name(), "roundchange");
        let message = outbound[0].packet.message().expect("decodes");
        assert_eq!(message.height(), 1);
        assert_eq!(message.state(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn round_change_rebroadcast_backs_off() {
        let mut rng = rng(208);
        let mut consensus = consensus_at(0, 0, &[], &mut rng);
        let epoch = consensus.epoch;
        consensus.set_latency(Duration::from_millis(100));
        consensus.propose(vec![7]);

        consensus.update(epoch).expect("update");
        assert_eq!(consensus.take_outbound().len(), 1);

        // Inside the back-off window nothing goes out.
        consensus
            .update(epoch + Duration::from_millis(50))
            .expect("update");
        assert!(consensus.take_outbound().is_empty());

        // Past the deadline the <roundchange> is re-broadcast.
        consensus
            .update(epoch + Duration::from_millis(150))
            .expect("update");
        let outbound = consensus.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].type_name(), "roundchange");
    }

    #[test]
    fn valid_decide_installs_the_height() {
        let mut rng = rng(209);
        let fixture = test_utils::decide_message(20, 10, 10, 10, 10, &mut rng);
        let mut consensus = consensus_at(9, 10, &pubkeys(&fixture.proof_keys), &mut rng);
        let now = consensus.epoch;
        set_leader(&mut consensus, &fixture.signer);

        consensus
            .receive_message(&fixture.packet.encode(), now)
            .expect("decide accepted");

        assert_eq!(consensus.current_height, 10);
        assert_eq!(consensus.current_round, 0);
        assert_eq!(consensus.stage(), Stage::RoundChanging);
        assert_eq!(consensus.locks.len(), 0);

        let snapshot = consensus.current_state();
        assert_eq!(snapshot.height, 10);
        assert_eq!(snapshot.round, 10);
        assert_eq!(snapshot.state.as_deref(), fixture.message.state());
        assert!(snapshot.certificate.is_some());
    }

    #[test]
    fn invalid_proposals_are_dropped() {
        let mut rng = rng(210);
        let mut consensus = consensus_at(0, 0, &[], &mut rng);
        consensus.state_validate = Arc::new(|state: &[u8]| !state.is_empty());
        consensus.propose(vec![]);
        assert!(consensus.proposal.is_none());
        consensus.propose(vec![1]);
        assert_eq!(consensus.proposal.as_deref(), Some(&[1u8][..]));
    }
}
