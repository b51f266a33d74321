//! Peer scoring and rate limiting.
//!
//! Scores start at zero and go negative on misbehavior. Crossing the
//! throttle threshold sheds the peer's non-essential traffic; crossing the
//! disconnect threshold drops the connection. Scores decay back toward zero
//! so a peer with one bad afternoon is not banned forever.

use std::collections::HashMap;

use tracing::debug;

use crate::core::{Limits, PeerId};

/// Score deltas per observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Delivered an event we accepted.
    UsefulEvent,
    /// Sent an event the pipeline rejected.
    RejectedEvent,
    /// Sent bytes that failed to decode.
    MalformedMessage,
    /// Sent an artifact with a bad signature.
    InvalidSignature,
    /// Exceeded the per-window message budget.
    Flood,
}

impl Observation {
    fn delta(self) -> i32 {
        match self {
            Observation::UsefulEvent => 1,
            Observation::RejectedEvent => -2,
            Observation::MalformedMessage => -10,
            Observation::InvalidSignature => -20,
            Observation::Flood => -5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Ok,
    /// Still connected, but only protocol-essential messages are served.
    Throttled,
    Disconnect,
}

#[derive(Debug, Default)]
struct PeerRecord {
    score: i32,
    window_start_ms: u64,
    msgs_in_window: usize,
}

/// Scores for every peer this node has heard from.
#[derive(Debug, Default)]
pub struct ScoreBook {
    peers: HashMap<PeerId, PeerRecord>,
}

impl ScoreBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, peer: &PeerId) -> i32 {
        self.peers.get(peer).map(|r| r.score).unwrap_or(0)
    }

    pub fn standing(&self, peer: &PeerId, limits: &Limits) -> Standing {
        let score = self.score(peer);
        if score <= limits.score_disconnect_at {
            Standing::Disconnect
        } else if score <= limits.score_throttle_at {
            Standing::Throttled
        } else {
            Standing::Ok
        }
    }

    /// Count one inbound message against the peer's sliding budget. Returns
    /// the peer's standing after any flood penalty.
    pub fn on_message(&mut self, peer: &PeerId, now_ms: u64, limits: &Limits) -> Standing {
        let record = self.peers.entry(peer.clone()).or_default();
        if now_ms.saturating_sub(record.window_start_ms) >= limits.peer_budget_window_ms {
            record.window_start_ms = now_ms;
            record.msgs_in_window = 0;
        }
        record.msgs_in_window += 1;
        if record.msgs_in_window > limits.peer_msg_budget {
            record.score += Observation::Flood.delta();
            debug!(peer = %peer, score = record.score, "peer over message budget");
        }
        self.standing(peer, limits)
    }

    pub fn observe(&mut self, peer: &PeerId, obs: Observation) {
        let record = self.peers.entry(peer.clone()).or_default();
        // Good behavior never builds up a credit to spend on abuse.
        record.score = (record.score + obs.delta()).min(0);
    }

    /// One decay tick: every score steps toward zero.
    pub fn decay(&mut self, limits: &Limits) {
        for record in self.peers.values_mut() {
            if record.score < 0 {
                record.score = (record.score + limits.score_decay_step).min(0);
            }
        }
        self.peers.retain(|_, r| r.score < 0 || r.msgs_in_window > 0);
    }

    /// Transfer a peer's record to a rotated identity.
    pub fn reassign(&mut self, old: &PeerId, new: PeerId) {
        if let Some(record) = self.peers.remove(old) {
            self.peers.insert(new, record);
        }
    }
}
