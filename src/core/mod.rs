//! Core: canonicalization, crypto, identity atoms, keys, and the envelope.

pub mod canon;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod limits;

pub use canon::{to_canon_bytes, CanonError};
pub use crypto::{
    domain_sha256_hex, sha256, sha256_hex, CryptoError, EVENT_DOMAIN, P2P_DOMAIN, POW_DOMAIN,
    RECOVERY_DOMAIN, ROTATE_DOMAIN, SNAPSHOT_DOMAIN, STAKE_DOMAIN,
};
pub use envelope::{Envelope, EnvelopeDraft, EnvelopeError, PROTOCOL_VERSION};
pub use error::{CoreError, InvalidId};
pub use identity::{Did, EventHash, EventType, PeerId};
pub use keystore::{
    decrypt_key, encrypt_key, EncryptedKeyRecord, KeyHandle, KeystoreError, RecoveryApproval,
    RecoveryClaim, RecoveryPolicy, RotationPolicy, MIN_PASSPHRASE_LEN,
};
pub use limits::Limits;
