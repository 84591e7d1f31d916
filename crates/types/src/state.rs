//! Application state and injected predicates.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::crypto::PublicKey;
use crate::identity::Identity;

/// Opaque application state agreed on at each height.
///
/// The engine never interprets the bytes. Validity and ordering come from
/// the injected [`StateValidate`] and [`StateCompare`] hooks.
pub type State = Vec<u8>;

/// Total-order comparator over candidate states.
///
/// Drives the maximal-lock selection and the `<select>` maximality rule.
pub type StateCompare = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Application-level validity predicate for candidate states.
pub type StateValidate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Mapping from a participant public key to its short identity.
///
/// Defaults to [`crate::default_pubkey_to_identity`]; overridable for
/// deployments with an established addressing scheme.
pub type PubKeyToIdentity = Arc<dyn Fn(&PublicKey) -> Identity + Send + Sync>;
