//! The event envelope: the signed, hashed, versioned unit of state change.
//!
//! `hash` is computed over the canonical bytes of the envelope with the `sig`
//! and `hash` fields removed; `sig` is computed over those same bytes under
//! the event domain. Hashing therefore always precedes signing, and neither
//! field covers the other.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::canon::{self, CanonError};
use super::crypto::{self, CryptoError};
use super::error::InvalidId;
use super::identity::{Did, EventHash, EventType};
use super::keystore::{KeyHandle, KeystoreError};
use super::limits::Limits;

/// Current envelope protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("canonicalization failed: {0}")]
    Canon(#[from] CanonError),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("envelope hash does not match canonical bytes")]
    HashMismatch,
    #[error(transparent)]
    InvalidSignature(#[from] CryptoError),
    #[error("issuer did does not match the attached public key")]
    IssuerKeyMismatch,
    #[error("envelope is {got} bytes, cap is {max}")]
    TooLarge { got: usize, max: usize },
    #[error("payload field `{field}` is malformed: {reason}")]
    MalformedPayload { field: &'static str, reason: String },
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

/// A fully signed envelope as it travels the network and sits in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub issuer: Did,
    pub ts: u64,
    pub nonce: u64,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prev: Option<EventHash>,
    #[serde(rename = "pub")]
    pub public_key: String,
    pub hash: EventHash,
    pub sig: String,
}

/// The envelope view that hashing and signing cover: everything except
/// `sig` and `hash`.
#[derive(Serialize)]
struct SigningView<'a> {
    v: u32,
    #[serde(rename = "type")]
    event_type: &'a EventType,
    issuer: &'a Did,
    ts: u64,
    nonce: u64,
    payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: &'a Option<EventHash>,
    #[serde(rename = "pub")]
    public_key: &'a str,
}

/// An unsigned envelope under construction.
#[derive(Clone, Debug)]
pub struct EnvelopeDraft {
    pub event_type: EventType,
    pub issuer: Did,
    pub ts: u64,
    pub nonce: u64,
    pub payload: Value,
    pub prev: Option<EventHash>,
}

impl EnvelopeDraft {
    pub fn new(
        event_type: EventType,
        issuer: Did,
        payload: Value,
        ts: u64,
        nonce: u64,
        prev: Option<EventHash>,
    ) -> Self {
        Self {
            event_type,
            issuer,
            ts,
            nonce,
            payload,
            prev,
        }
    }

    /// Hash, then sign. Fails if the key does not belong to the draft's
    /// issuer, if the key is retired, or if the result exceeds the size cap.
    pub fn finalize(
        self,
        key: &mut KeyHandle,
        limits: &Limits,
    ) -> Result<Envelope, EnvelopeError> {
        if key.did() != self.issuer {
            return Err(EnvelopeError::IssuerKeyMismatch);
        }
        let public_key = hex::encode(key.public_key());
        let bytes = canon::to_canon_bytes(&SigningView {
            v: PROTOCOL_VERSION,
            event_type: &self.event_type,
            issuer: &self.issuer,
            ts: self.ts,
            nonce: self.nonce,
            payload: &self.payload,
            prev: &self.prev,
            public_key: &public_key,
        })?;
        if bytes.len() > limits.max_envelope_bytes {
            return Err(EnvelopeError::TooLarge {
                got: bytes.len(),
                max: limits.max_envelope_bytes,
            });
        }

        let hash = EventHash::from_bytes(crypto::sha256(&bytes));
        let sig = key.sign(crypto::EVENT_DOMAIN, &bytes)?;

        Ok(Envelope {
            v: PROTOCOL_VERSION,
            event_type: self.event_type,
            issuer: self.issuer,
            ts: self.ts,
            nonce: self.nonce,
            payload: self.payload,
            prev: self.prev,
            public_key,
            hash,
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

impl Envelope {
    fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(canon::to_canon_bytes(&SigningView {
            v: self.v,
            event_type: &self.event_type,
            issuer: &self.issuer,
            ts: self.ts,
            nonce: self.nonce,
            payload: &self.payload,
            prev: &self.prev,
            public_key: &self.public_key,
        })?)
    }

    /// Full verification: version, size, hash re-derivation, signature, and
    /// issuer/public-key binding. Any mismatch fails closed.
    pub fn verify(&self, limits: &Limits) -> Result<(), EnvelopeError> {
        if self.v != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.v));
        }
        let bytes = self.signing_bytes()?;
        if bytes.len() > limits.max_envelope_bytes {
            return Err(EnvelopeError::TooLarge {
                got: bytes.len(),
                max: limits.max_envelope_bytes,
            });
        }
        if EventHash::from_bytes(crypto::sha256(&bytes)) != self.hash {
            return Err(EnvelopeError::HashMismatch);
        }
        crypto::verify_hex(crypto::EVENT_DOMAIN, &bytes, &self.sig, &self.public_key)?;
        if self.issuer.public_key_hex() != self.public_key {
            return Err(EnvelopeError::IssuerKeyMismatch);
        }
        Ok(())
    }

    /// Canonical bytes of the full signed envelope, the form stored in the
    /// log and carried by gossip.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(canon::to_canon_bytes(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Identified resource this event mutates, if any.
    pub fn resource_id(&self) -> Option<&str> {
        self.payload.get("resourceId").and_then(Value::as_str)
    }

    /// Optimistic-concurrency token: the hash of the last accepted event for
    /// the resource. `Ok(None)` when absent or null (resource creation).
    pub fn resource_prev(&self) -> Result<Option<EventHash>, EnvelopeError> {
        match self.payload.get("resourcePrev") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => {
                EventHash::from_hex(s)
                    .map(Some)
                    .map_err(|e: InvalidId| EnvelopeError::MalformedPayload {
                        field: "resourcePrev",
                        reason: e.to_string(),
                    })
            }
            Some(_) => Err(EnvelopeError::MalformedPayload {
                field: "resourcePrev",
                reason: "must be a hash string or null".into(),
            }),
        }
    }

    /// Transfer amount, used by finality tiering. Absent for amount-less
    /// event types.
    pub fn amount(&self) -> Option<u64> {
        self.payload.get("amount").and_then(Value::as_u64)
    }
}
