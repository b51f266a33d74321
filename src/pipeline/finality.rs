//! Finality tracking: when is an accepted event safe to act on.
//!
//! Acceptance is local; finality is social. An event becomes final once
//! enough distinct peers have acknowledged holding it (required count tiered
//! by transfer amount), or once the finality window passes with no conflicting
//! sibling, whichever comes first. Ack counts only carry weight under
//! sybil-resistant admission, because peer counts mean nothing when peers
//! are free to mint.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::{Envelope, EventHash, Limits, PeerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalityConfig {
    /// Whether admission requires stake proofs. Only then do peer
    /// acknowledgement counts carry weight.
    pub sybil_resistant: bool,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            sybil_resistant: false,
        }
    }
}

/// Peer acknowledgements required for an amount.
pub fn required_acks(amount: Option<u64>, limits: &Limits) -> usize {
    match amount {
        None => limits.finality_default_peers,
        Some(a) if a < 100 => 3,
        Some(a) if a < 10_000 => 5,
        Some(_) => 7,
    }
}

#[derive(Debug)]
struct Pending {
    first_seen_ms: u64,
    acks: BTreeSet<PeerId>,
    required: usize,
}

#[derive(Debug)]
pub struct FinalityTracker {
    config: FinalityConfig,
    pending: HashMap<EventHash, Pending>,
    finalized: BTreeSet<EventHash>,
}

impl FinalityTracker {
    pub fn new(config: FinalityConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            finalized: BTreeSet::new(),
        }
    }

    /// Start tracking an accepted event.
    pub fn observe(&mut self, env: &Envelope, now_ms: u64, limits: &Limits) {
        if self.finalized.contains(&env.hash) {
            return;
        }
        self.pending.entry(env.hash).or_insert_with(|| Pending {
            first_seen_ms: now_ms,
            acks: BTreeSet::new(),
            required: required_acks(env.amount(), limits),
        });
    }

    /// Record that `peer` holds the event. Duplicate acks from the same peer
    /// do not count twice.
    pub fn record_ack(&mut self, hash: &EventHash, peer: PeerId) {
        if let Some(p) = self.pending.get_mut(hash) {
            p.acks.insert(peer);
        }
    }

    /// Check (and cache) finality at `now_ms`.
    pub fn is_final(&mut self, hash: &EventHash, now_ms: u64, limits: &Limits) -> bool {
        if self.finalized.contains(hash) {
            return true;
        }
        let Some(p) = self.pending.get(hash) else {
            return false;
        };
        // Ack counts only carry weight when peers are costly to mint. The
        // window closes finality in either mode: a staked event that never
        // gathers its quorum still settles once nothing conflicted with it.
        let by_acks = self.config.sybil_resistant && p.acks.len() >= p.required;
        let by_window = now_ms.saturating_sub(p.first_seen_ms) >= limits.finality_window_ms;
        if by_acks || by_window {
            self.pending.remove(hash);
            self.finalized.insert(*hash);
            return true;
        }
        false
    }

    /// Drop all record of `hash`. Called when a smaller sibling displaces it
    /// and when the log prunes past it; a displaced event must never read as
    /// final.
    pub fn forget(&mut self, hash: &EventHash) {
        self.pending.remove(hash);
        self.finalized.remove(hash);
    }

    pub fn ack_count(&self, hash: &EventHash) -> usize {
        self.pending.get(hash).map_or(0, |p| p.acks.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.len()
    }
}
