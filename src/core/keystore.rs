//! Keys at rest, key rotation, and guardian recovery.
//!
//! Private keys are never written in plaintext: the Ed25519 seed is sealed
//! with XChaCha20-Poly1305 under a key derived from a passphrase via Argon2id.
//! Rotation is enforced at the signing boundary: a retired key still verifies
//! history, but refuses to produce new signatures. A lost key is recovered
//! socially: enough pre-chosen guardians co-sign a claim binding the subject
//! to a replacement key.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use super::canon::{self, CanonError};
use super::crypto;
use super::identity::Did;

/// Minimum passphrase length accepted at encryption time.
pub const MIN_PASSPHRASE_LEN: usize = 12;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("passphrase too short: need at least {MIN_PASSPHRASE_LEN} chars")]
    PassphraseTooShort,
    #[error("decryption failed: wrong passphrase or corrupted record")]
    DecryptionFailed,
    #[error("key derivation failed")]
    KdfFailed,
    #[error("key record `{field}` is malformed")]
    MalformedRecord { field: &'static str },
    #[error("key has been rotated out and must not sign")]
    KeyRetired,
    #[error("recovery claim has {got} valid guardian approvals, need {need}")]
    NotEnoughGuardians { got: usize, need: usize },
    #[error("recovery claim encode: {0}")]
    Canon(#[from] CanonError),
    #[error("key record io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key record encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl KeystoreError {
    pub fn transience(&self) -> crate::Transience {
        match self {
            KeystoreError::Io(_) => crate::Transience::Unknown,
            _ => crate::Transience::Permanent,
        }
    }
}

/// Rotation policy carried by every signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    pub max_age_ms: u64,
    pub max_signatures: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            // 30 days
            max_age_ms: 30 * 24 * 60 * 60 * 1000,
            max_signatures: 1_000_000,
        }
    }
}

/// Encrypted key record, persisted as an individual JSON file named by the
/// public key it protects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub v: u32,
    pub kdf: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub public_key: String,
    pub created_ms: u64,
    #[serde(default)]
    pub policy: RotationPolicy,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], KeystoreError> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|_| KeystoreError::KdfFailed)?;
    Ok(key)
}

/// Seal an Ed25519 seed under a passphrase.
pub fn encrypt_key(
    seed: &[u8; 32],
    passphrase: &str,
    policy: RotationPolicy,
    now_ms: u64,
) -> Result<EncryptedKeyRecord, KeystoreError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(KeystoreError::PassphraseTooShort);
    }

    let mut rng = rand::rng();
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let mut key = derive_key(passphrase, &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), seed.as_slice())
        .map_err(|_| KeystoreError::KdfFailed)?;
    key.zeroize();

    let public_key = SigningKey::from_bytes(seed).verifying_key().to_bytes();
    Ok(EncryptedKeyRecord {
        v: 1,
        kdf: "argon2id".to_string(),
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
        public_key: hex::encode(public_key),
        created_ms: now_ms,
        policy,
    })
}

/// Open an encrypted record. A wrong passphrase and a tampered record are
/// indistinguishable by design.
pub fn decrypt_key(
    record: &EncryptedKeyRecord,
    passphrase: &str,
) -> Result<SigningKey, KeystoreError> {
    let salt = hex::decode(&record.salt)
        .map_err(|_| KeystoreError::MalformedRecord { field: "salt" })?;
    let nonce: [u8; NONCE_LEN] = hex::decode(&record.nonce)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(KeystoreError::MalformedRecord { field: "nonce" })?;
    let ciphertext = hex::decode(&record.ciphertext)
        .map_err(|_| KeystoreError::MalformedRecord { field: "ciphertext" })?;

    let mut key = derive_key(passphrase, &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| KeystoreError::DecryptionFailed);
    key.zeroize();

    let mut seed: [u8; 32] = plaintext?
        .try_into()
        .map_err(|_| KeystoreError::DecryptionFailed)?;
    let signing = SigningKey::from_bytes(&seed);
    seed.zeroize();
    Ok(signing)
}

/// A live signing key plus rotation bookkeeping.
pub struct KeyHandle {
    signing: SigningKey,
    created_ms: u64,
    signatures_issued: u64,
    retired: bool,
    policy: RotationPolicy,
}

impl KeyHandle {
    pub fn new(signing: SigningKey, policy: RotationPolicy, created_ms: u64) -> Self {
        Self {
            signing,
            created_ms,
            signatures_issued: 0,
            retired: false,
            policy,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn did(&self) -> Did {
        Did::from_public_key(&self.public_key())
    }

    /// Produce a domain-separated signature, or refuse if rotated out.
    pub fn sign(&mut self, domain: &str, message: &[u8]) -> Result<Signature, KeystoreError> {
        if self.retired {
            return Err(KeystoreError::KeyRetired);
        }
        self.signatures_issued += 1;
        Ok(crypto::sign(domain, message, &self.signing))
    }

    pub fn signatures_issued(&self) -> u64 {
        self.signatures_issued
    }

    /// True once the key exceeds its age or signature budget. The owner is
    /// expected to publish a rotation event and then call [`retire`].
    ///
    /// [`retire`]: KeyHandle::retire
    pub fn needs_rotation(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) >= self.policy.max_age_ms
            || self.signatures_issued >= self.policy.max_signatures
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// M-of-N guardian policy for recovering a DID whose signing key is lost.
/// Guardians are ordinary DIDs chosen by the subject ahead of time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub guardians: Vec<Did>,
    pub threshold: usize,
}

/// One guardian's endorsement of a [`RecoveryClaim`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryApproval {
    pub guardian: Did,
    pub sig: String,
}

/// Request to rebind `subject` to a replacement key, endorsed by guardians
/// under their own signing domain. Verification is offline: any node holding
/// the subject's policy can check the claim without the lost key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryClaim {
    pub subject: Did,
    pub new_key: String,
    pub ts: u64,
    #[serde(default)]
    pub approvals: Vec<RecoveryApproval>,
}

impl RecoveryClaim {
    pub fn new(subject: Did, new_public_key: &[u8; 32], ts: u64) -> Self {
        Self {
            subject,
            new_key: hex::encode(new_public_key),
            ts,
            approvals: Vec::new(),
        }
    }

    /// Canonical bytes guardians sign: the claim without its approvals, so
    /// every endorsement covers the same statement.
    fn signing_bytes(&self) -> Result<Vec<u8>, KeystoreError> {
        Ok(canon::to_canon_bytes(&serde_json::json!({
            "subject": self.subject.as_str(),
            "newKey": self.new_key,
            "ts": self.ts,
        }))?)
    }

    /// Endorse the claim. A guardian approving twice replaces its earlier
    /// approval rather than counting double.
    pub fn approve(&mut self, guardian: &mut KeyHandle) -> Result<(), KeystoreError> {
        let bytes = self.signing_bytes()?;
        let sig = guardian.sign(crypto::RECOVERY_DOMAIN, &bytes)?;
        let did = guardian.did();
        self.approvals.retain(|a| a.guardian != did);
        self.approvals.push(RecoveryApproval {
            guardian: did,
            sig: hex::encode(sig.to_bytes()),
        });
        Ok(())
    }

    /// Check the claim against the subject's guardian policy. Approvals from
    /// outside the policy and bad signatures do not count. Returns the DID
    /// the replacement key derives to.
    pub fn verify(&self, policy: &RecoveryPolicy) -> Result<Did, KeystoreError> {
        if policy.threshold == 0 || policy.threshold > policy.guardians.len() {
            return Err(KeystoreError::MalformedRecord { field: "threshold" });
        }
        let bytes = self.signing_bytes()?;
        let mut endorsed = BTreeSet::new();
        for approval in &self.approvals {
            if !policy.guardians.contains(&approval.guardian) {
                continue;
            }
            if crypto::verify_hex(
                crypto::RECOVERY_DOMAIN,
                &bytes,
                &approval.sig,
                approval.guardian.public_key_hex(),
            )
            .is_ok()
            {
                endorsed.insert(approval.guardian.clone());
            }
        }
        if endorsed.len() < policy.threshold {
            return Err(KeystoreError::NotEnoughGuardians {
                got: endorsed.len(),
                need: policy.threshold,
            });
        }
        let new_key: [u8; 32] = hex::decode(&self.new_key)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(KeystoreError::MalformedRecord { field: "new_key" })?;
        Ok(Did::from_public_key(&new_key))
    }
}

/// Path for a record inside a keystore directory: `<dir>/<public_key>.json`.
pub fn record_path(dir: &Path, record: &EncryptedKeyRecord) -> PathBuf {
    dir.join(format!("{}.json", record.public_key))
}

pub fn save_record(dir: &Path, record: &EncryptedKeyRecord) -> Result<(), KeystoreError> {
    fs::create_dir_all(dir)?;
    let path = record_path(dir, record);
    let contents = serde_json::to_vec_pretty(record)?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), contents)?;
    temp.persist(&path).map_err(|e| KeystoreError::Io(e.error))?;
    Ok(())
}

pub fn load_record(dir: &Path, public_key_hex: &str) -> Result<EncryptedKeyRecord, KeystoreError> {
    let path = dir.join(format!("{public_key_hex}.json"));
    let contents = fs::read(&path)?;
    Ok(serde_json::from_slice(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &str = "correct horse battery";

    #[test]
    fn encrypt_then_decrypt_recovers_key() {
        let seed = [3u8; 32];
        let record = encrypt_key(&seed, PASS, RotationPolicy::default(), 1_000).unwrap();
        let signing = decrypt_key(&record, PASS).unwrap();
        assert_eq!(signing.to_bytes(), seed);
        assert_eq!(
            record.public_key,
            hex::encode(SigningKey::from_bytes(&seed).verifying_key().to_bytes())
        );
    }

    #[test]
    fn short_passphrase_rejected() {
        let err = encrypt_key(&[3u8; 32], "short", RotationPolicy::default(), 0).unwrap_err();
        assert!(matches!(err, KeystoreError::PassphraseTooShort));
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let record = encrypt_key(&[3u8; 32], PASS, RotationPolicy::default(), 0).unwrap();
        let err = decrypt_key(&record, "incorrect staple battery").unwrap_err();
        assert!(matches!(err, KeystoreError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let mut record = encrypt_key(&[3u8; 32], PASS, RotationPolicy::default(), 0).unwrap();
        let mut raw = hex::decode(&record.ciphertext).unwrap();
        raw[0] ^= 0xff;
        record.ciphertext = hex::encode(raw);
        let err = decrypt_key(&record, PASS).unwrap_err();
        assert!(matches!(err, KeystoreError::DecryptionFailed));
    }

    #[test]
    fn retired_key_refuses_to_sign() {
        let mut handle = KeyHandle::new(
            SigningKey::from_bytes(&[5u8; 32]),
            RotationPolicy::default(),
            0,
        );
        handle.sign(crypto::EVENT_DOMAIN, b"ok").unwrap();
        handle.retire();
        let err = handle.sign(crypto::EVENT_DOMAIN, b"no").unwrap_err();
        assert!(matches!(err, KeystoreError::KeyRetired));
    }

    #[test]
    fn rotation_triggers_on_age_and_count() {
        let policy = RotationPolicy {
            max_age_ms: 100,
            max_signatures: 2,
        };
        let mut handle = KeyHandle::new(SigningKey::from_bytes(&[5u8; 32]), policy, 1_000);
        assert!(!handle.needs_rotation(1_050));
        assert!(handle.needs_rotation(1_100));
        handle.sign(crypto::EVENT_DOMAIN, b"a").unwrap();
        handle.sign(crypto::EVENT_DOMAIN, b"b").unwrap();
        assert!(handle.needs_rotation(1_050));
    }

    fn handle(seed: u8) -> KeyHandle {
        KeyHandle::new(
            SigningKey::from_bytes(&[seed; 32]),
            RotationPolicy::default(),
            0,
        )
    }

    #[test]
    fn guardian_quorum_recovers_a_lost_did() {
        let mut g1 = handle(1);
        let mut g2 = handle(2);
        let g3 = handle(3).did();
        let subject = handle(7).did();
        let replacement = SigningKey::from_bytes(&[8u8; 32]).verifying_key().to_bytes();
        let policy = RecoveryPolicy {
            guardians: vec![g1.did(), g2.did(), g3],
            threshold: 2,
        };

        let mut claim = RecoveryClaim::new(subject, &replacement, 1_000);
        claim.approve(&mut g1).unwrap();
        assert!(matches!(
            claim.verify(&policy),
            Err(KeystoreError::NotEnoughGuardians { got: 1, need: 2 })
        ));

        // The same guardian again is one voice, not two.
        claim.approve(&mut g1).unwrap();
        assert!(claim.verify(&policy).is_err());

        claim.approve(&mut g2).unwrap();
        assert_eq!(
            claim.verify(&policy).unwrap(),
            Did::from_public_key(&replacement)
        );
    }

    #[test]
    fn outsider_approvals_do_not_count() {
        let mut g1 = handle(1);
        let g2 = handle(2).did();
        let mut outsider = handle(9);
        let policy = RecoveryPolicy {
            guardians: vec![g1.did(), g2],
            threshold: 2,
        };

        let mut claim = RecoveryClaim::new(handle(7).did(), &[8u8; 32], 1_000);
        claim.approve(&mut g1).unwrap();
        claim.approve(&mut outsider).unwrap();
        assert!(matches!(
            claim.verify(&policy),
            Err(KeystoreError::NotEnoughGuardians { got: 1, need: 2 })
        ));
    }

    #[test]
    fn tampered_claim_invalidates_approvals() {
        let mut g1 = handle(1);
        let policy = RecoveryPolicy {
            guardians: vec![g1.did()],
            threshold: 1,
        };

        let mut claim = RecoveryClaim::new(handle(7).did(), &[8u8; 32], 1_000);
        claim.approve(&mut g1).unwrap();
        assert!(claim.verify(&policy).is_ok());

        // Swapping in a different replacement key voids every endorsement.
        claim.new_key = hex::encode([9u8; 32]);
        assert!(matches!(
            claim.verify(&policy),
            Err(KeystoreError::NotEnoughGuardians { got: 0, need: 1 })
        ));
    }

    #[test]
    fn records_persist_as_individual_files() {
        let dir = tempfile::tempdir().unwrap();
        let record = encrypt_key(&[9u8; 32], PASS, RotationPolicy::default(), 42).unwrap();
        save_record(dir.path(), &record).unwrap();
        let loaded = load_record(dir.path(), &record.public_key).unwrap();
        assert_eq!(loaded.ciphertext, record.ciphertext);
        assert_eq!(loaded.created_ms, 42);
    }
}
