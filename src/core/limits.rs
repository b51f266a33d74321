//! Protocol safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Hard caps and windows applied by the validation pipeline, the wire layer,
/// and the sync protocol. Field names carry their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Hard cap on a single envelope's canonical byte size. Larger payloads
    /// must be referenced out-of-band by content hash.
    pub max_envelope_bytes: usize,
    /// Out-of-order nonce buffering window per issuer.
    pub nonce_window: u64,
    /// Buffered out-of-order events allowed per issuer stream.
    pub max_buffered_per_issuer: usize,

    pub max_frame_bytes: usize,
    pub max_range_events: usize,
    pub max_range_bytes: usize,
    pub snapshot_chunk_bytes: usize,

    pub finality_window_ms: u64,
    pub finality_default_peers: usize,

    pub pow_ticket_ttl_ms: u64,
    pub peer_msg_budget: usize,
    pub peer_budget_window_ms: u64,
    pub score_throttle_at: i32,
    pub score_disconnect_at: i32,
    pub score_decay_step: i32,

    /// Log entries retained below the latest verified snapshot on light nodes.
    pub prune_retain_events: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_envelope_bytes: 1024 * 1024,
            nonce_window: 5,
            max_buffered_per_issuer: 64,

            max_frame_bytes: 2 * 1024 * 1024,
            max_range_events: 512,
            max_range_bytes: 1024 * 1024,
            snapshot_chunk_bytes: 256 * 1024,

            finality_window_ms: 30_000,
            finality_default_peers: 3,

            pow_ticket_ttl_ms: 600_000,
            peer_msg_budget: 256,
            peer_budget_window_ms: 10_000,
            score_throttle_at: -50,
            score_disconnect_at: -100,
            score_decay_step: 5,

            prune_retain_events: 1_000,
        }
    }
}
