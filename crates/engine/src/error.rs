//! The closed error taxonomy.
//!
//! One code per distinguishable fault. Validation errors are returned to the
//! caller and never mutate engine state; undecodable input surfaces the wire
//! error unchanged.

use lockstep_wire::WireError;
use thiserror::Error;

/// Every way the engine can reject input or configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    // ═══════════════════════════════════════════════════════════════════════
    // Envelope
    // ═══════════════════════════════════════════════════════════════════════
    #[error("message is empty")]
    MessageIsEmpty,

    #[error("unsupported message version")]
    MessageVersion,

    #[error("message signature does not verify")]
    MessageSignature,

    #[error("unknown message type")]
    MessageUnknownMessageType,

    #[error("message signer is not a participant")]
    MessageUnknownParticipant,

    // ═══════════════════════════════════════════════════════════════════════
    // <roundchange>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<roundchange> height does not match the next height")]
    RoundChangeHeightMismatch,

    #[error("<roundchange> round is lower than the current round")]
    RoundChangeRoundLower,

    // ═══════════════════════════════════════════════════════════════════════
    // <lock>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<lock> height does not match the next height")]
    LockHeightMismatch,

    #[error("<lock> round is lower than the current round")]
    LockRoundLower,

    #[error("<lock> is not signed by the round leader")]
    LockNotSignedByLeader,

    #[error("<lock> state is empty or invalid")]
    LockEmptyState,

    #[error("<lock> proof is not a <roundchange>")]
    LockProofTypeMismatch,

    #[error("<lock> proof height does not match the message height")]
    LockProofHeightMismatch,

    #[error("<lock> proof round does not match the message round")]
    LockProofRoundMismatch,

    #[error("<lock> proof signer is not a participant")]
    LockProofUnknownParticipant,

    #[error("<lock> proofs do not reach a quorum for the state")]
    LockProofInsufficient,

    // ═══════════════════════════════════════════════════════════════════════
    // <select>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<select> height does not match the next height")]
    SelectHeightMismatch,

    #[error("<select> round is lower than the current round")]
    SelectRoundLower,

    #[error("<select> is not signed by the round leader")]
    SelectNotSignedByLeader,

    #[error("<select> proof is not a <roundchange>")]
    SelectProofTypeMismatch,

    #[error("<select> proof height does not match the message height")]
    SelectProofHeightMismatch,

    #[error("<select> proof round does not match the message round")]
    SelectProofRoundMismatch,

    #[error("<select> proof signer is not a participant")]
    SelectProofUnknownParticipant,

    #[error("<select> proofs do not reach a quorum of distinct signers")]
    SelectProofInsufficient,

    #[error("<select> state is not the maximal proof state")]
    SelectProofNotTheMaximal,

    #[error("<select> state presence does not match its proofs")]
    SelectStateMismatch,

    #[error("<select> proofs contain quorum support for a single state")]
    SelectProofExceeded,

    // ═══════════════════════════════════════════════════════════════════════
    // <lock-release>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<lock-release> received outside the lock-release stage")]
    LockReleaseStatus,

    // ═══════════════════════════════════════════════════════════════════════
    // <commit>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<commit> received outside the commit stage")]
    CommitStatus,

    #[error("<commit> height does not match the next height")]
    CommitHeightMismatch,

    #[error("<commit> round does not match the current round")]
    CommitRoundMismatch,

    #[error("<commit> state is empty")]
    CommitEmptyState,

    #[error("<commit> state does not hash to the locked state")]
    CommitStateMismatch,

    // ═══════════════════════════════════════════════════════════════════════
    // <decide>
    // ═══════════════════════════════════════════════════════════════════════
    #[error("<decide> is not signed by the deciding round's leader")]
    DecideNotSignedByLeader,

    #[error("<decide> height is not above the current height")]
    DecideHeightLower,

    #[error("<decide> state is empty")]
    DecideEmptyState,

    #[error("<decide> state does not match the expected state")]
    DecideStateMismatch,

    #[error("<decide> proof is not a <commit>")]
    DecideProofTypeMismatch,

    #[error("<decide> proof height does not match the message height")]
    DecideProofHeightMismatch,

    #[error("<decide> proof round does not match the message round")]
    DecideProofRoundMismatch,

    #[error("<decide> proof signer is not a participant")]
    DecideProofUnknownParticipant,

    #[error("<decide> proofs do not reach a quorum for the state")]
    DecideProofInsufficient,

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration
    // ═══════════════════════════════════════════════════════════════════════
    #[error("config: epoch is not set")]
    ConfigEpoch,

    #[error("config: state comparator is not set")]
    ConfigStateCompare,

    #[error("config: state validator is not set")]
    ConfigStateValidate,

    #[error("config: private key is not set")]
    ConfigPrivateKey,

    #[error("config: participant list is too small")]
    ConfigParticipants,

    // ═══════════════════════════════════════════════════════════════════════
    // Transport
    // ═══════════════════════════════════════════════════════════════════════
    #[error(transparent)]
    Wire(#[from] WireError),
}
