//! Signed state snapshots and the snapshot chain.
//!
//! A snapshot captures the full exported state of every module at a log
//! position, hashed over its canonical bytes and signed by peers that have
//! independently replayed to the same state. Snapshots chain through `prev`;
//! a node only accepts a snapshot whose predecessor it has already accepted
//! (or which starts the chain) and whose state matches its own replay.
//! Verification is never skipped, whatever the source claims about trust.

pub mod policy;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::core::canon::{self, CanonError};
use crate::core::{crypto, CryptoError, Did, EventHash, KeyHandle, KeystoreError};
use crate::store::kv::{keys, KvError, KvStore};

pub use policy::SnapshotPolicy;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("canonicalization failed: {0}")]
    Canon(#[from] CanonError),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot hash does not match canonical bytes")]
    HashMismatch,
    #[error("snapshot prev {0} has not been accepted here")]
    UnknownPrev(EventHash),
    #[error("snapshot state disagrees with local replay")]
    StateMismatch,
    #[error("snapshot has {got} valid signatures, quorum is {need}")]
    QuorumNotMet { got: usize, need: usize },
    #[error(transparent)]
    BadSignature(#[from] CryptoError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Engine(#[from] KvError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSig {
    pub signer: Did,
    pub sig: String,
}

/// A signed snapshot of all module state at a log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub v: u32,
    /// Hash of the last event the state covers.
    pub at: EventHash,
    /// Previous snapshot in the chain; `None` starts it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prev: Option<EventHash>,
    /// Exported state per module, keyed by module name.
    pub state: BTreeMap<String, Value>,
    pub hash: EventHash,
    /// Peer attestations over the snapshot hash. Not covered by `hash`, so
    /// signatures can accrue without changing the snapshot's identity.
    #[serde(default)]
    pub signatures: Vec<SnapshotSig>,
}

/// The portion covered by `hash` and by every signature.
#[derive(Serialize)]
struct SignedView<'a> {
    v: u32,
    at: &'a EventHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: &'a Option<EventHash>,
    state: &'a BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn build(
        at: EventHash,
        prev: Option<EventHash>,
        state: BTreeMap<String, Value>,
    ) -> Result<Self, SnapshotError> {
        let bytes = canon::to_canon_bytes(&SignedView {
            v: SNAPSHOT_VERSION,
            at: &at,
            prev: &prev,
            state: &state,
        })?;
        let hash = EventHash::from_bytes(crypto::sha256(&bytes));
        Ok(Self {
            v: SNAPSHOT_VERSION,
            at,
            prev,
            state,
            hash,
            signatures: Vec::new(),
        })
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(canon::to_canon_bytes(&SignedView {
            v: self.v,
            at: &self.at,
            prev: &self.prev,
            state: &self.state,
        })?)
    }

    /// Attest to this snapshot. Replaces any existing signature from the
    /// same signer.
    pub fn sign(&mut self, key: &mut KeyHandle) -> Result<(), SnapshotError> {
        let bytes = self.signed_bytes()?;
        let sig = key.sign(crypto::SNAPSHOT_DOMAIN, &bytes)?;
        let signer = key.did();
        self.signatures.retain(|s| s.signer != signer);
        self.signatures.push(SnapshotSig {
            signer,
            sig: hex::encode(sig.to_bytes()),
        });
        Ok(())
    }

    /// Re-derive the hash and count valid signatures from distinct signers.
    pub fn verify(&self, quorum: usize) -> Result<(), SnapshotError> {
        if self.v != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.v));
        }
        let bytes = self.signed_bytes()?;
        if EventHash::from_bytes(crypto::sha256(&bytes)) != self.hash {
            return Err(SnapshotError::HashMismatch);
        }

        let mut valid: BTreeSet<&Did> = BTreeSet::new();
        for entry in &self.signatures {
            crypto::verify_hex(
                crypto::SNAPSHOT_DOMAIN,
                &bytes,
                &entry.sig,
                entry.signer.public_key_hex(),
            )?;
            valid.insert(&entry.signer);
        }
        if valid.len() < quorum {
            return Err(SnapshotError::QuorumNotMet {
                got: valid.len(),
                need: quorum,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(canon::to_canon_bytes(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Persisted snapshot chain.
pub struct SnapshotStore<S: KvStore> {
    kv: S,
}

impl<S: KvStore> SnapshotStore<S> {
    pub fn open(kv: S) -> Self {
        Self { kv }
    }

    /// Accept a snapshot into the chain. `local_state` is this node's own
    /// replay output at the snapshot's position; any disagreement rejects
    /// the snapshot, no matter how many signatures it carries.
    pub fn accept(
        &mut self,
        snapshot: &Snapshot,
        local_state: &BTreeMap<String, Value>,
        quorum: usize,
    ) -> Result<(), SnapshotError> {
        snapshot.verify(quorum)?;
        if let Some(prev) = snapshot.prev {
            if self.get(&prev)?.is_none() {
                return Err(SnapshotError::UnknownPrev(prev));
            }
        }
        if &snapshot.state != local_state {
            return Err(SnapshotError::StateMismatch);
        }

        let bytes = snapshot.to_bytes()?;
        self.kv.put(&keys::snapshot(&snapshot.hash), &bytes)?;
        self.kv
            .put(keys::SNAPSHOT_LATEST, snapshot.hash.as_bytes())?;
        info!(hash = %snapshot.hash, at = %snapshot.at, "snapshot accepted");
        Ok(())
    }

    pub fn get(&self, hash: &EventHash) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(bytes) = self.kv.get(&keys::snapshot(hash))? else {
            return Ok(None);
        };
        Ok(Some(Snapshot::from_bytes(&bytes)?))
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(raw) = self.kv.get(keys::SNAPSHOT_LATEST)? else {
            return Ok(None);
        };
        let hash: [u8; 32] = match raw.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        self.get(&EventHash::from_bytes(hash))
    }

    /// Drop all snapshots before the latest, keeping the chain tip only.
    /// Light nodes call this together with log pruning.
    pub fn prune_history(&mut self) -> Result<u64, SnapshotError> {
        let Some(latest) = self.latest()? else {
            return Ok(0);
        };
        let mut dropped = 0;
        for (key, _) in self.kv.prefix_iter(keys::SNAPSHOT_PREFIX)? {
            if key != keys::snapshot(&latest.hash) {
                self.kv.delete(&key)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}
