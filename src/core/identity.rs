//! Identity atoms.
//!
//! Did: issuer identity derived from an Ed25519 public key
//! EventHash: content-derived event identity (dedup key, tie-break order)
//! EventType: dotted namespace tag for payload dispatch
//! PeerId: network peer identity, distinct from the controller Did

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::InvalidId;

const DID_PREFIX: &str = "did:claw:";

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Issuer identity: `did:claw:` followed by the 64-char lowercase hex of the
/// issuer's Ed25519 public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        let Some(rest) = s.strip_prefix(DID_PREFIX) else {
            return Err(InvalidId::Did {
                raw: s,
                reason: format!("must start with '{DID_PREFIX}'"),
            });
        };
        if rest.len() != 64 || !is_lower_hex(rest) {
            return Err(InvalidId::Did {
                raw: s,
                reason: "suffix must be 64 lowercase hex chars".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(format!("{DID_PREFIX}{}", hex::encode(public_key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex form of the public key the DID was derived from.
    pub fn public_key_hex(&self) -> &str {
        &self.0[DID_PREFIX.len()..]
    }

    pub fn public_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Infallible by construction: parse/from_public_key enforce the form.
        if let Ok(bytes) = hex::decode(self.public_key_hex()) {
            out.copy_from_slice(&bytes);
        }
        out
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Did {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Did::parse(s)
    }
}

impl From<Did> for String {
    fn from(d: Did) -> String {
        d.0
    }
}

/// SHA-256 event identity.
///
/// Lexicographic order over the raw bytes matches lexicographic order over
/// the lowercase-hex form, which is what the conflict tie-break relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHash([u8; 32]);

impl EventHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from lowercase hex. Uppercase digits are rejected so that the
    /// textual form is canonical.
    pub fn from_hex(s: &str) -> Result<Self, InvalidId> {
        if s.len() != 64 || !is_lower_hex(s) {
            return Err(InvalidId::EventHash {
                raw: s.to_string(),
                reason: "must be 64 lowercase hex chars".into(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| InvalidId::EventHash {
            raw: s.to_string(),
            reason: e.to_string(),
        })?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({})", self.to_hex())
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for EventHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Event type tag: dotted lowercase segments, e.g. `wallet.escrow.release`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() || s.len() > 64 {
            return Err(InvalidId::EventType {
                raw: s,
                reason: "must be 1..=64 chars".into(),
            });
        }
        let valid = s.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        });
        if !valid {
            return Err(InvalidId::EventType {
                raw: s,
                reason: "segments must be non-empty lowercase alphanumeric".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading segment, used for module routing (`wallet`, `market`, ...).
    pub fn module(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventType({})", self.0)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EventType {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        EventType::parse(s)
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> String {
        t.0
    }
}

/// Network peer identity: 64-char lowercase hex of the peer's Ed25519 key.
///
/// Peers sign transport-level artifacts (tickets, rotation records) with this
/// key; it is bound to a controller [`Did`] only through a stake proof.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.len() != 64 || !is_lower_hex(&s) {
            return Err(InvalidId::Peer {
                raw: s,
                reason: "must be 64 lowercase hex chars".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(hex::encode(public_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn public_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        if let Ok(bytes) = hex::decode(&self.0) {
            out.copy_from_slice(&bytes);
        }
        out
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        PeerId::parse(s)
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> String {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_roundtrips_through_public_key() {
        let pk = [0xabu8; 32];
        let did = Did::from_public_key(&pk);
        assert_eq!(did.public_key(), pk);
        let parsed = Did::parse(did.as_str()).unwrap();
        assert_eq!(parsed, did);
    }

    #[test]
    fn did_rejects_bad_forms() {
        assert!(Did::parse("did:web:example").is_err());
        assert!(Did::parse("did:claw:abc").is_err());
        let upper = format!("did:claw:{}", "AB".repeat(32));
        assert!(Did::parse(upper).is_err());
    }

    #[test]
    fn event_hash_rejects_uppercase_hex() {
        let lower = "ab".repeat(32);
        assert!(EventHash::from_hex(&lower).is_ok());
        assert!(EventHash::from_hex(&lower.to_uppercase()).is_err());
        assert!(EventHash::from_hex("ab").is_err());
    }

    #[test]
    fn event_hash_order_matches_hex_order() {
        let a = EventHash::from_bytes([0x01; 32]);
        let b = EventHash::from_bytes([0x02; 32]);
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn peer_id_parsing() {
        let hex64 = "ab".repeat(32);
        let parsed = PeerId::parse(hex64.clone()).unwrap();
        assert_eq!(parsed.as_str(), hex64);
        assert_eq!(parsed, PeerId::from_public_key(&[0xab; 32]));
        assert!(PeerId::parse(hex64.to_uppercase()).is_err());
        assert!(PeerId::parse("ab").is_err());
        assert!(PeerId::parse(format!("{hex64}cd")).is_err());
    }

    #[test]
    fn event_type_parsing() {
        assert!(EventType::parse("wallet.transfer").is_ok());
        assert!(EventType::parse("wallet.escrow.release").is_ok());
        assert!(EventType::parse("did.update").is_ok());
        assert!(EventType::parse("").is_err());
        assert!(EventType::parse("Wallet.Transfer").is_err());
        assert!(EventType::parse("wallet..transfer").is_err());
        assert_eq!(EventType::parse("wallet.stake").unwrap().module(), "wallet");
    }
}
