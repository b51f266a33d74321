//! Core capability errors (parsing, validation of identity atoms).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identity atom.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("did `{raw}` is invalid: {reason}")]
    Did { raw: String, reason: String },
    #[error("event hash `{raw}` is invalid: {reason}")]
    EventHash { raw: String, reason: String },
    #[error("event type `{raw}` is invalid: {reason}")]
    EventType { raw: String, reason: String },
    #[error("peer id `{raw}` is invalid: {reason}")]
    Peer { raw: String, reason: String },
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    Crypto(#[from] super::crypto::CryptoError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
