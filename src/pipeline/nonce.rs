//! Per-issuer nonce tracking with a bounded reorder buffer.
//!
//! Nonces are strictly sequential per issuer. Gossip delivers out of order,
//! so an event a few nonces ahead is buffered rather than dropped; it drains
//! as soon as the gap fills. The committed nonce only ever advances on
//! accepted events, so a rejected event does not consume its nonce.

use std::collections::BTreeMap;

use crate::core::{Envelope, Limits};

/// Where an incoming nonce lands relative to the issuer's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// Exactly `committed + 1`: validate and apply now.
    Next,
    /// Ahead within the window: parked until the gap fills.
    Buffered,
    /// Ahead within the window but already parked.
    AlreadyBuffered,
    /// At or below the committed nonce.
    Replay,
    /// Ahead of the window, or the buffer is full.
    GapTooLarge,
}

/// One issuer's nonce stream.
#[derive(Debug, Default)]
pub struct NonceStream {
    committed: u64,
    buffer: BTreeMap<u64, Envelope>,
}

impl NonceStream {
    pub fn resume(committed: u64) -> Self {
        Self {
            committed,
            buffer: BTreeMap::new(),
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Classify an incoming envelope and park it when it is ahead of the
    /// stream. Parking never advances `committed`.
    pub fn offer(&mut self, env: &Envelope, limits: &Limits) -> NonceCheck {
        let nonce = env.nonce;
        if nonce <= self.committed {
            return NonceCheck::Replay;
        }
        if nonce == self.committed + 1 {
            return NonceCheck::Next;
        }
        if nonce > self.committed + 1 + limits.nonce_window {
            return NonceCheck::GapTooLarge;
        }
        if self.buffer.contains_key(&nonce) {
            return NonceCheck::AlreadyBuffered;
        }
        if self.buffer.len() >= limits.max_buffered_per_issuer {
            return NonceCheck::GapTooLarge;
        }
        self.buffer.insert(nonce, env.clone());
        NonceCheck::Buffered
    }

    /// Advance past an accepted nonce.
    pub fn commit(&mut self, nonce: u64) {
        debug_assert_eq!(nonce, self.committed + 1);
        self.committed = nonce;
        // Anything at or below the new committed nonce is stale.
        self.buffer.retain(|&n, _| n > nonce);
    }

    /// Remove and return the buffered envelope that is now next in line,
    /// if the gap just closed.
    pub fn pop_ready(&mut self) -> Option<Envelope> {
        self.buffer.remove(&(self.committed + 1))
    }

    /// Drop a buffered envelope that failed validation after draining.
    pub fn discard(&mut self, nonce: u64) {
        self.buffer.remove(&nonce);
    }
}
