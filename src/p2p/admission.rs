//! Peer admission: proof-of-work tickets, stake proofs, and key rotation.
//!
//! A peer earns a connection either by burning work (open networks) or by
//! proving a controller's stake (sybil-resistant networks). Both artifacts
//! are canonical JSON signed under their own domains, so neither can be
//! replayed as the other. Digest comparison is exact string equality over
//! lowercase hex; a digest that differs only in case is a forgery attempt,
//! not an alternate spelling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::canon::{self, CanonError};
use crate::core::{crypto, CryptoError, Did, EventHash, KeyHandle, KeystoreError, Limits, PeerId};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("canonicalization failed: {0}")]
    Canon(#[from] CanonError),
    #[error("artifact decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("ticket digest does not match the challenge")]
    DigestMismatch,
    #[error("ticket difficulty {got} below required {need}")]
    InsufficientDifficulty { got: u32, need: u32 },
    #[error("ticket expired")]
    Expired,
    #[error(transparent)]
    BadSignature(#[from] CryptoError),
    #[error("stake event unknown or not a stake")]
    UnknownStake,
    #[error("staked amount {got} below required {need}")]
    InsufficientStake { got: u64, need: u64 },
    #[error("peer is not admitted")]
    NotAdmitted,
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

fn leading_zero_hex_chars(digest: &str) -> u32 {
    digest.bytes().take_while(|&b| b == b'0').count() as u32
}

/// Proof-of-work admission ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowTicket {
    pub peer: PeerId,
    pub ts: u64,
    pub nonce: u64,
    pub difficulty: u32,
    /// Lowercase hex of the domain-prefixed challenge digest.
    pub hash: String,
    pub sig: String,
}

#[derive(Serialize)]
struct PowChallenge<'a> {
    peer: &'a PeerId,
    ts: u64,
    nonce: u64,
    difficulty: u32,
}

impl PowTicket {
    fn challenge_bytes(
        peer: &PeerId,
        ts: u64,
        nonce: u64,
        difficulty: u32,
    ) -> Result<Vec<u8>, AdmissionError> {
        Ok(canon::to_canon_bytes(&PowChallenge {
            peer,
            ts,
            nonce,
            difficulty,
        })?)
    }

    /// Grind nonces until the domain digest has `difficulty` leading zero
    /// hex chars, then sign the winning challenge.
    pub fn mine(
        key: &mut KeyHandle,
        ts: u64,
        difficulty: u32,
    ) -> Result<Self, AdmissionError> {
        let peer = PeerId::from_public_key(&key.public_key());
        let mut nonce = 0u64;
        loop {
            let bytes = Self::challenge_bytes(&peer, ts, nonce, difficulty)?;
            let digest = crypto::domain_sha256_hex(crypto::POW_DOMAIN, &bytes);
            if leading_zero_hex_chars(&digest) >= difficulty {
                let sig = key.sign(crypto::POW_DOMAIN, &bytes)?;
                return Ok(Self {
                    peer,
                    ts,
                    nonce,
                    difficulty,
                    hash: digest,
                    sig: hex::encode(sig.to_bytes()),
                });
            }
            nonce += 1;
        }
    }

    pub fn verify(
        &self,
        now_ms: u64,
        min_difficulty: u32,
        limits: &Limits,
    ) -> Result<(), AdmissionError> {
        if self.difficulty < min_difficulty {
            return Err(AdmissionError::InsufficientDifficulty {
                got: self.difficulty,
                need: min_difficulty,
            });
        }
        if now_ms.saturating_sub(self.ts) > limits.pow_ticket_ttl_ms {
            return Err(AdmissionError::Expired);
        }

        let bytes = Self::challenge_bytes(&self.peer, self.ts, self.nonce, self.difficulty)?;
        let digest = crypto::domain_sha256_hex(crypto::POW_DOMAIN, &bytes);
        if self.hash != digest {
            return Err(AdmissionError::DigestMismatch);
        }
        if leading_zero_hex_chars(&digest) < self.difficulty {
            return Err(AdmissionError::InsufficientDifficulty {
                got: leading_zero_hex_chars(&digest),
                need: self.difficulty,
            });
        }
        crypto::verify_hex(crypto::POW_DOMAIN, &bytes, &self.sig, self.peer.as_str())?;
        Ok(())
    }
}

/// Resolves a claimed stake event to the amount it locked.
pub trait StakeLookup {
    fn staked_amount(&self, controller: &Did, stake_event: &EventHash) -> Option<u64>;
}

/// Proof that a controller identity backs this peer with locked stake.
/// Double-signed: the peer proves key possession, the controller proves
/// sponsorship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeProof {
    pub peer: PeerId,
    pub controller: Did,
    pub stake_event: EventHash,
    pub min_stake: u64,
    pub sig_peer: String,
    pub sig_controller: String,
}

#[derive(Serialize)]
struct StakeClaim<'a> {
    peer: &'a PeerId,
    controller: &'a Did,
    stake_event: &'a EventHash,
    min_stake: u64,
}

impl StakeProof {
    fn claim_bytes(&self) -> Result<Vec<u8>, AdmissionError> {
        Ok(canon::to_canon_bytes(&StakeClaim {
            peer: &self.peer,
            controller: &self.controller,
            stake_event: &self.stake_event,
            min_stake: self.min_stake,
        })?)
    }

    pub fn build(
        peer_key: &mut KeyHandle,
        controller_key: &mut KeyHandle,
        stake_event: EventHash,
        min_stake: u64,
    ) -> Result<Self, AdmissionError> {
        let mut proof = Self {
            peer: PeerId::from_public_key(&peer_key.public_key()),
            controller: controller_key.did(),
            stake_event,
            min_stake,
            sig_peer: String::new(),
            sig_controller: String::new(),
        };
        let bytes = proof.claim_bytes()?;
        proof.sig_peer = hex::encode(peer_key.sign(crypto::STAKE_DOMAIN, &bytes)?.to_bytes());
        proof.sig_controller =
            hex::encode(controller_key.sign(crypto::STAKE_DOMAIN, &bytes)?.to_bytes());
        Ok(proof)
    }

    pub fn verify(&self, lookup: &dyn StakeLookup, min_stake: u64) -> Result<(), AdmissionError> {
        let bytes = self.claim_bytes()?;
        crypto::verify_hex(crypto::STAKE_DOMAIN, &bytes, &self.sig_peer, self.peer.as_str())?;
        crypto::verify_hex(
            crypto::STAKE_DOMAIN,
            &bytes,
            &self.sig_controller,
            self.controller.public_key_hex(),
        )?;

        let need = min_stake.max(self.min_stake);
        let got = lookup
            .staked_amount(&self.controller, &self.stake_event)
            .ok_or(AdmissionError::UnknownStake)?;
        if got < need {
            return Err(AdmissionError::InsufficientStake { got, need });
        }
        Ok(())
    }
}

/// Peer key rotation record: the old key hands its standing to the new key.
/// Both keys sign, so neither side can rotate unilaterally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRotation {
    pub old: PeerId,
    pub new: PeerId,
    pub ts: u64,
    pub sig_old: String,
    pub sig_new: String,
}

#[derive(Serialize)]
struct RotationClaim<'a> {
    old: &'a PeerId,
    new: &'a PeerId,
    ts: u64,
}

impl PeerRotation {
    fn claim_bytes(&self) -> Result<Vec<u8>, AdmissionError> {
        Ok(canon::to_canon_bytes(&RotationClaim {
            old: &self.old,
            new: &self.new,
            ts: self.ts,
        })?)
    }

    pub fn build(
        old_key: &mut KeyHandle,
        new_key: &mut KeyHandle,
        ts: u64,
    ) -> Result<Self, AdmissionError> {
        let mut record = Self {
            old: PeerId::from_public_key(&old_key.public_key()),
            new: PeerId::from_public_key(&new_key.public_key()),
            ts,
            sig_old: String::new(),
            sig_new: String::new(),
        };
        let bytes = record.claim_bytes()?;
        record.sig_old = hex::encode(old_key.sign(crypto::ROTATE_DOMAIN, &bytes)?.to_bytes());
        record.sig_new = hex::encode(new_key.sign(crypto::ROTATE_DOMAIN, &bytes)?.to_bytes());
        Ok(record)
    }

    pub fn verify(&self) -> Result<(), AdmissionError> {
        let bytes = self.claim_bytes()?;
        crypto::verify_hex(crypto::ROTATE_DOMAIN, &bytes, &self.sig_old, self.old.as_str())?;
        crypto::verify_hex(crypto::ROTATE_DOMAIN, &bytes, &self.sig_new, self.new.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keystore::RotationPolicy;
    use crate::core::sha256;
    use ed25519_dalek::SigningKey;
    use std::collections::HashMap;

    fn key(seed: u8) -> KeyHandle {
        KeyHandle::new(
            SigningKey::from_bytes(&[seed; 32]),
            RotationPolicy::default(),
            0,
        )
    }

    #[test]
    fn mined_ticket_verifies() {
        let mut k = key(1);
        // Difficulty 1 keeps the grind short in tests.
        let ticket = PowTicket::mine(&mut k, 1_000, 1).unwrap();
        ticket.verify(1_500, 1, &Limits::default()).unwrap();
    }

    #[test]
    fn uppercase_digest_rejected() {
        let mut k = key(1);
        let mut ticket = PowTicket::mine(&mut k, 1_000, 1).unwrap();
        ticket.hash = ticket.hash.to_uppercase();
        assert!(matches!(
            ticket.verify(1_500, 1, &Limits::default()),
            Err(AdmissionError::DigestMismatch)
        ));
    }

    #[test]
    fn expired_ticket_rejected() {
        let limits = Limits::default();
        let mut k = key(1);
        let ticket = PowTicket::mine(&mut k, 1_000, 1).unwrap();
        let too_late = 1_000 + limits.pow_ticket_ttl_ms + 1;
        assert!(matches!(
            ticket.verify(too_late, 1, &limits),
            Err(AdmissionError::Expired)
        ));
    }

    #[test]
    fn tampered_nonce_breaks_digest() {
        let mut k = key(1);
        let mut ticket = PowTicket::mine(&mut k, 1_000, 1).unwrap();
        ticket.nonce += 1;
        assert!(matches!(
            ticket.verify(1_500, 1, &Limits::default()),
            Err(AdmissionError::DigestMismatch)
        ));
    }

    #[test]
    fn claimed_difficulty_below_floor_rejected() {
        let mut k = key(1);
        let ticket = PowTicket::mine(&mut k, 1_000, 1).unwrap();
        assert!(matches!(
            ticket.verify(1_500, 3, &Limits::default()),
            Err(AdmissionError::InsufficientDifficulty { need: 3, .. })
        ));
    }

    struct Ledger(HashMap<(Did, EventHash), u64>);

    impl StakeLookup for Ledger {
        fn staked_amount(&self, controller: &Did, stake_event: &EventHash) -> Option<u64> {
            self.0.get(&(controller.clone(), *stake_event)).copied()
        }
    }

    #[test]
    fn stake_proof_checks_both_signatures_and_amount() {
        let mut peer_key = key(1);
        let mut controller_key = key(2);
        let stake_event = EventHash::from_bytes(sha256(b"stake"));
        let proof =
            StakeProof::build(&mut peer_key, &mut controller_key, stake_event, 500).unwrap();

        let mut book = HashMap::new();
        book.insert((controller_key.did(), stake_event), 750u64);
        let ledger = Ledger(book);
        proof.verify(&ledger, 500).unwrap();

        // Not enough locked.
        assert!(matches!(
            proof.verify(&ledger, 1_000),
            Err(AdmissionError::InsufficientStake { got: 750, need: 1_000 })
        ));

        // Unknown stake event.
        let empty = Ledger(HashMap::new());
        assert!(matches!(
            proof.verify(&empty, 100),
            Err(AdmissionError::UnknownStake)
        ));

        // Forged controller signature.
        let mut forged = proof.clone();
        forged.sig_controller = forged.sig_peer.clone();
        assert!(forged.verify(&ledger, 500).is_err());
    }

    #[test]
    fn rotation_needs_both_keys() {
        let mut old = key(1);
        let mut new = key(2);
        let record = PeerRotation::build(&mut old, &mut new, 9_000).unwrap();
        record.verify().unwrap();

        let mut forged = record.clone();
        forged.sig_new = forged.sig_old.clone();
        assert!(forged.verify().is_err());

        let mut redirected = record;
        redirected.new = PeerId::from_public_key(&key(3).public_key());
        assert!(redirected.verify().is_err());
    }
}
