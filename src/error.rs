use thiserror::Error;

use crate::core::{CoreError, EnvelopeError, KeystoreError};
use crate::p2p::{AdmissionError, TransportError};
use crate::pipeline::RejectReason;
use crate::snapshot::SnapshotError;
use crate::store::{KvError, LogError};
use crate::wire::WireError;

/// Whether a failed operation is worth retrying.
///
/// Validation and crypto failures are deterministic: the same envelope will
/// fail the same way forever. Storage and transport failures may pass on the
/// next attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retrying cannot help; the envelope, artifact, or local state must
    /// change first.
    Permanent,
    /// Retrying may succeed, e.g. a peer timeout or storage contention.
    Retryable,
    /// Cannot tell from the error alone.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What is known about side effects at the point an error surfaced.
///
/// The pipeline's contract is all-or-nothing per event, so most failures
/// report [`Effect::None`]; only the storage engine and transport can leave
/// the question open.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// The log, indices, and sinks are untouched.
    None,
    /// State changed locally or at a peer before the failure.
    Some,
    /// Callers must re-check (duplicate append is safe; the log dedupes).
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Top-level error: a thin wrapper over the subsystem errors (envelope,
/// store, wire, p2p), plus pipeline rejections surfaced at API boundaries.
/// Each subsystem keeps its own canonical error type; nothing is flattened.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("event rejected: {0}")]
    Rejected(RejectReason),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Envelope(_) => Transience::Permanent,
            Error::Keystore(e) => e.transience(),
            Error::Kv(e) => e.transience(),
            Error::Log(e) => e.transience(),
            Error::Snapshot(_) => Transience::Permanent,
            Error::Wire(e) => e.transience(),
            Error::Admission(_) => Transience::Permanent,
            Error::Transport(_) => Transience::Retryable,
            Error::Rejected(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // Validation-path failures leave no partial state by contract.
            Error::Core(_)
            | Error::Envelope(_)
            | Error::Rejected(_)
            | Error::Admission(_)
            | Error::Wire(_) => Effect::None,
            Error::Kv(_) | Error::Log(_) | Error::Transport(_) => Effect::Unknown,
            Error::Snapshot(_) => Effect::None,
            Error::Keystore(_) => Effect::None,
            Error::Config(_) => Effect::None,
        }
    }
}
