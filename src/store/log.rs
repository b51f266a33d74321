//! Append-only event log with monotonic local sequence numbers.
//!
//! Sequence numbers are a local arrival order, used only as a cursor for
//! range sync; they are never shared as ground truth. The log stores the raw
//! envelope bytes and two indices: `seq -> (hash, bytes)` and `hash -> seq`.
//! No crypto and no network happen here.

use thiserror::Error;

use crate::core::{Did, EventHash};

use super::kv::{keys, KvError, KvStore};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("range cursor {0} is not in the log")]
    UnknownCursor(EventHash),
    #[error("log corrupt at seq {seq}: {reason}")]
    Corrupt { seq: u64, reason: String },
    #[error(transparent)]
    Engine(#[from] KvError),
}

impl LogError {
    pub fn transience(&self) -> crate::Transience {
        match self {
            LogError::Engine(e) => e.transience(),
            _ => crate::Transience::Permanent,
        }
    }
}

/// One page of a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePage {
    /// Raw envelope bytes, in local sequence order.
    pub events: Vec<Vec<u8>>,
    /// Resume cursor: hash of the last event returned (or the request's
    /// `from` when the page is empty).
    pub cursor: Option<EventHash>,
    pub has_more: bool,
}

pub struct EventLog<S: KvStore> {
    kv: S,
    next_seq: u64,
}

impl<S: KvStore> EventLog<S> {
    /// Open over an existing store, recovering the next sequence number from
    /// the highest persisted entry.
    pub fn open(kv: S) -> Result<Self, LogError> {
        let entries = kv.prefix_iter(keys::LOG_SEQ_PREFIX)?;
        let max_seq = entries
            .last()
            .and_then(|(k, _)| keys::parse_log_seq(k))
            .unwrap_or(0);
        Ok(Self {
            kv,
            next_seq: max_seq + 1,
        })
    }

    /// Append an event. Returns `false` (and changes nothing) when the hash
    /// is already present; duplicate delivery is a no-op, not an error.
    pub fn append(&mut self, hash: &EventHash, bytes: &[u8]) -> Result<bool, LogError> {
        if self.kv.get(&keys::log_hash(hash))?.is_some() {
            return Ok(false);
        }
        let seq = self.next_seq;

        let mut record = Vec::with_capacity(32 + bytes.len());
        record.extend_from_slice(hash.as_bytes());
        record.extend_from_slice(bytes);
        self.kv.put(&keys::log_seq(seq), &record)?;
        self.kv.put(&keys::log_hash(hash), &seq.to_be_bytes())?;

        self.next_seq = seq + 1;
        Ok(true)
    }

    pub fn contains(&self, hash: &EventHash) -> Result<bool, LogError> {
        Ok(self.kv.get(&keys::log_hash(hash))?.is_some())
    }

    pub fn seq_of(&self, hash: &EventHash) -> Result<Option<u64>, LogError> {
        let Some(raw) = self.kv.get(&keys::log_hash(hash))? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw.try_into().map_err(|_| LogError::Corrupt {
            seq: 0,
            reason: format!("hash index entry for {hash} is not 8 bytes"),
        })?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    /// Envelope bytes by local sequence, if present.
    pub fn get_by_seq(&self, seq: u64) -> Result<Option<(EventHash, Vec<u8>)>, LogError> {
        let Some(record) = self.kv.get(&keys::log_seq(seq))? else {
            return Ok(None);
        };
        decode_record(seq, &record).map(Some)
    }

    pub fn get_by_hash(&self, hash: &EventHash) -> Result<Option<Vec<u8>>, LogError> {
        let Some(seq) = self.seq_of(hash)? else {
            return Ok(None);
        };
        Ok(self.get_by_seq(seq)?.map(|(_, bytes)| bytes))
    }

    /// Hash of the most recently appended event.
    pub fn latest_hash(&self) -> Result<Option<EventHash>, LogError> {
        if self.next_seq <= 1 {
            return Ok(None);
        }
        let mut seq = self.next_seq - 1;
        // Pruned light nodes may have holes below next_seq; walk back only
        // past deleted prefixes, not gaps inside retained data.
        while seq > 0 {
            if let Some((hash, _)) = self.get_by_seq(seq)? {
                return Ok(Some(hash));
            }
            seq -= 1;
        }
        Ok(None)
    }

    /// Events strictly after `from` (or from the beginning when `None`),
    /// bounded by count and byte budget.
    pub fn get_range(
        &self,
        from: Option<&EventHash>,
        limit: usize,
        max_bytes: usize,
    ) -> Result<RangePage, LogError> {
        let start_seq = match from {
            None => 1,
            Some(hash) => match self.seq_of(hash)? {
                Some(seq) => seq + 1,
                None => return Err(LogError::UnknownCursor(*hash)),
            },
        };

        let mut events = Vec::new();
        let mut cursor = from.copied();
        let mut used_bytes = 0usize;
        let mut seq = start_seq;
        let mut has_more = false;
        while seq < self.next_seq {
            let Some((hash, bytes)) = self.get_by_seq(seq)? else {
                seq += 1;
                continue;
            };
            if events.len() >= limit {
                has_more = true;
                break;
            }
            // A record above the byte budget still ships alone; an empty
            // page marked has_more would stall cursor-resume sync forever.
            if !events.is_empty() && used_bytes + bytes.len() > max_bytes {
                has_more = true;
                break;
            }
            used_bytes += bytes.len();
            cursor = Some(hash);
            events.push(bytes);
            seq += 1;
        }

        Ok(RangePage {
            events,
            cursor,
            has_more,
        })
    }

    /// Number of live entries is at most `next_seq - 1`; this is the cursor
    /// ceiling, not a count of retained records.
    pub fn head_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn committed_nonce(&self, issuer: &Did) -> Result<u64, LogError> {
        let Some(raw) = self.kv.get(&keys::nonce(issuer))? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = raw.try_into().map_err(|_| LogError::Corrupt {
            seq: 0,
            reason: format!("nonce index entry for {issuer} is not 8 bytes"),
        })?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn set_committed_nonce(&mut self, issuer: &Did, nonce: u64) -> Result<(), LogError> {
        Ok(self.kv.put(&keys::nonce(issuer), &nonce.to_be_bytes())?)
    }

    /// Drop entries at or below `cutoff_seq`, keeping the most recent
    /// `retain` of them for proof continuity (light-node pruning). Returns
    /// the hashes removed so derived trackers can drop them too.
    pub fn prune_through(&mut self, cutoff_seq: u64, retain: u64) -> Result<Vec<EventHash>, LogError> {
        let drop_through = cutoff_seq.saturating_sub(retain);
        let mut dropped = Vec::new();
        for seq in 1..=drop_through.min(self.head_seq()) {
            let Some((hash, _)) = self.get_by_seq(seq)? else {
                continue;
            };
            self.kv.delete(&keys::log_seq(seq))?;
            self.kv.delete(&keys::log_hash(&hash))?;
            dropped.push(hash);
        }
        Ok(dropped)
    }

    /// Direct read access to the underlying engine.
    pub fn kv(&self) -> &S {
        &self.kv
    }

    pub(super) fn kv_mut(&mut self) -> &mut S {
        &mut self.kv
    }

    pub(super) fn set_next_seq(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }
}

pub(super) fn decode_record(seq: u64, record: &[u8]) -> Result<(EventHash, Vec<u8>), LogError> {
    if record.len() < 32 {
        return Err(LogError::Corrupt {
            seq,
            reason: format!("record is {} bytes, need at least 32", record.len()),
        });
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&record[..32]);
    Ok((EventHash::from_bytes(hash), record[32..].to_vec()))
}
