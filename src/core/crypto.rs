//! Domain-separated hashing and Ed25519 signing.
//!
//! Every signature and proof-of-work digest in the protocol is computed over
//! `domain || message` with a fixed ASCII domain prefix, so a signature minted
//! for one context can never be replayed in another.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Signing domain for event envelopes.
pub const EVENT_DOMAIN: &str = "clawnet:event:v1:";
/// Signing domain for snapshot checkpoints.
pub const SNAPSHOT_DOMAIN: &str = "clawnet:snapshot:v1:";
/// Signing domain for peer-to-peer control messages.
pub const P2P_DOMAIN: &str = "clawnet:p2p:v1:";
/// Signing domain for proof-of-work admission tickets.
pub const POW_DOMAIN: &str = "clawnet:pow:v1:";
/// Signing domain for stake proofs.
pub const STAKE_DOMAIN: &str = "clawnet:stake:v1:";
/// Signing domain for peer-key rotation records.
pub const ROTATE_DOMAIN: &str = "clawnet:rotate:v1:";
/// Signing domain for guardian approvals on recovery claims.
pub const RECOVERY_DOMAIN: &str = "clawnet:recover:v1:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("public key bytes are not a valid Ed25519 point")]
    InvalidPublicKey,
    #[error("signature must be 64 bytes, got {0}")]
    InvalidSignatureLength(usize),
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

fn domain_message(domain: &str, message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + message.len());
    buf.extend_from_slice(domain.as_bytes());
    buf.extend_from_slice(message);
    buf
}

/// Domain-prefixed digest, as lowercase hex. Used by proof-of-work tickets.
pub fn domain_sha256_hex(domain: &str, message: &[u8]) -> String {
    sha256_hex(&domain_message(domain, message))
}

pub fn sign(domain: &str, message: &[u8], key: &SigningKey) -> Signature {
    key.sign(&domain_message(domain, message))
}

pub fn verify(
    domain: &str,
    message: &[u8],
    signature: &[u8],
    public_key: &[u8; 32],
) -> Result<(), CryptoError> {
    let signature: &[u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignatureLength(signature.len()))?;
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    key.verify(
        &domain_message(domain, message),
        &Signature::from_bytes(signature),
    )
    .map_err(|_| CryptoError::InvalidSignature)
}

/// Verify against a hex-encoded signature and public key, the form used on
/// the wire and in envelopes.
pub fn verify_hex(
    domain: &str,
    message: &[u8],
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<(), CryptoError> {
    let signature = hex::decode(signature_hex)
        .map_err(|_| CryptoError::InvalidSignatureLength(signature_hex.len()))?;
    let public_key: [u8; 32] = hex::decode(public_key_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(CryptoError::InvalidPublicKey)?;
    verify(domain, message, &signature, &public_key)
}
