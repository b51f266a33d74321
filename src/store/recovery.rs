//! Startup recovery for the event log.
//!
//! A crashed process can leave a torn or stale tail. Recovery walks the log
//! in sequence order, re-derives each envelope's hash, and quarantines the
//! first bad record plus everything after it (later events may depend on the
//! bad one through `prev` or nonces). Indices are then rebuilt from the
//! surviving prefix so the hash index and committed nonces always agree with
//! the records actually retained.

use std::collections::BTreeMap;

use tracing::warn;

use crate::core::{Did, Envelope, EventHash, Limits};

use super::kv::{keys, KvStore};
use super::log::{decode_record, EventLog, LogError};

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// First sequence whose record failed verification, if any.
    pub first_bad_seq: Option<u64>,
    /// Records moved aside under the quarantine prefix.
    pub quarantined: u64,
    /// Live records whose indices were rebuilt.
    pub rebuilt: u64,
}

/// Verify every record, quarantine the tail from the first failure, and
/// rebuild the hash and nonce indices from what survives.
pub fn recover<S: KvStore>(
    log: &mut EventLog<S>,
    limits: &Limits,
) -> Result<RecoveryReport, LogError> {
    let mut report = RecoveryReport::default();

    let entries = log.kv().prefix_iter(keys::LOG_SEQ_PREFIX)?;
    let mut live: Vec<(u64, EventHash, Vec<u8>)> = Vec::with_capacity(entries.len());
    let mut bad_tail: Vec<(u64, Vec<u8>)> = Vec::new();

    for (key, record) in entries {
        let Some(seq) = keys::parse_log_seq(&key) else {
            continue;
        };
        if report.first_bad_seq.is_some() {
            bad_tail.push((seq, record));
            continue;
        }
        match verify_record(seq, &record, limits) {
            Ok((hash, _)) => {
                let bytes = record[32..].to_vec();
                live.push((seq, hash, bytes));
            }
            Err(reason) => {
                warn!(seq, %reason, "quarantining log tail");
                report.first_bad_seq = Some(seq);
                bad_tail.push((seq, record));
            }
        }
    }

    for (seq, record) in bad_tail {
        log.kv_mut().put(&keys::quarantine_seq(seq), &record)?;
        log.kv_mut().delete(&keys::log_seq(seq))?;
        report.quarantined += 1;
    }

    rebuild_indices(log, &live)?;
    report.rebuilt = live.len() as u64;

    let next_seq = live.last().map(|(seq, _, _)| seq + 1).unwrap_or(1);
    log.set_next_seq(next_seq);

    Ok(report)
}

/// Drop and re-derive the hash index and committed nonces from the live
/// records. Run after quarantine so stale entries never point at removed
/// sequences.
fn rebuild_indices<S: KvStore>(
    log: &mut EventLog<S>,
    live: &[(u64, EventHash, Vec<u8>)],
) -> Result<(), LogError> {
    for prefix in [keys::LOG_HASH_PREFIX, keys::NONCE_PREFIX] {
        let stale: Vec<Vec<u8>> = log
            .kv()
            .prefix_iter(prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in stale {
            log.kv_mut().delete(&key)?;
        }
    }

    let mut nonces: BTreeMap<Did, u64> = BTreeMap::new();
    for (seq, hash, bytes) in live {
        log.kv_mut().put(&keys::log_hash(hash), &seq.to_be_bytes())?;
        if let Ok(env) = Envelope::from_bytes(bytes) {
            let committed = nonces.entry(env.issuer.clone()).or_insert(0);
            if env.nonce > *committed {
                *committed = env.nonce;
            }
        }
    }
    for (issuer, nonce) in nonces {
        log.set_committed_nonce(&issuer, nonce)?;
    }
    Ok(())
}

fn verify_record(
    seq: u64,
    record: &[u8],
    limits: &Limits,
) -> Result<(EventHash, Envelope), String> {
    let (stored_hash, bytes) = decode_record(seq, record).map_err(|e| e.to_string())?;
    let env = Envelope::from_bytes(&bytes).map_err(|e| format!("undecodable envelope: {e}"))?;
    if env.hash != stored_hash {
        return Err("stored hash disagrees with envelope hash".to_string());
    }
    env.verify(limits).map_err(|e| e.to_string())?;
    Ok((stored_hash, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keystore::RotationPolicy;
    use crate::core::{EnvelopeDraft, EventType, KeyHandle};
    use crate::store::kv::MemoryKv;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn signed_log(n: u64) -> (EventLog<MemoryKv>, KeyHandle) {
        let mut key = KeyHandle::new(
            SigningKey::from_bytes(&[7u8; 32]),
            RotationPolicy::default(),
            0,
        );
        let mut log = EventLog::open(MemoryKv::new()).unwrap();
        for nonce in 1..=n {
            let env = EnvelopeDraft::new(
                EventType::parse("wallet.transfer").unwrap(),
                key.did(),
                json!({"amount": nonce}),
                1_700_000_000_000 + nonce,
                nonce,
                None,
            )
            .finalize(&mut key, &Limits::default())
            .unwrap();
            let bytes = env.to_bytes().unwrap();
            assert!(log.append(&env.hash, &bytes).unwrap());
        }
        (log, key)
    }

    #[test]
    fn clean_log_recovers_fully() {
        let (mut log, key) = signed_log(4);
        let report = recover(&mut log, &Limits::default()).unwrap();
        assert_eq!(report.first_bad_seq, None);
        assert_eq!(report.quarantined, 0);
        assert_eq!(report.rebuilt, 4);
        assert_eq!(log.committed_nonce(&key.did()).unwrap(), 4);
    }

    #[test]
    fn torn_record_quarantines_the_tail() {
        let (mut log, _key) = signed_log(5);
        // Corrupt record 3 by truncating its envelope bytes.
        let record = log.kv().get(&keys::log_seq(3)).unwrap().unwrap();
        log.kv_mut()
            .put(&keys::log_seq(3), &record[..40])
            .unwrap();

        let report = recover(&mut log, &Limits::default()).unwrap();
        assert_eq!(report.first_bad_seq, Some(3));
        assert_eq!(report.quarantined, 3);
        assert_eq!(report.rebuilt, 2);

        assert!(log.get_by_seq(3).unwrap().is_none());
        assert!(log.get_by_seq(2).unwrap().is_some());
        assert!(log
            .kv()
            .get(&keys::quarantine_seq(4))
            .unwrap()
            .is_some());
    }

    #[test]
    fn indices_rebuilt_match_surviving_prefix() {
        let (mut log, key) = signed_log(5);
        let (h5, _) = log.get_by_seq(5).unwrap().unwrap();
        let record = log.kv().get(&keys::log_seq(4)).unwrap().unwrap();
        let mut tampered = record.clone();
        // Flip a byte inside the envelope body.
        let last = tampered.len() - 10;
        tampered[last] ^= 0xff;
        log.kv_mut().put(&keys::log_seq(4), &tampered).unwrap();

        let report = recover(&mut log, &Limits::default()).unwrap();
        assert_eq!(report.first_bad_seq, Some(4));
        // The hash index no longer knows the quarantined events.
        assert!(!log.contains(&h5).unwrap());
        // Committed nonce rewinds to the surviving prefix.
        assert_eq!(log.committed_nonce(&key.did()).unwrap(), 3);
        // Appending resumes after the quarantined region's sequences are gone.
        assert_eq!(log.head_seq(), 3);
    }
}
