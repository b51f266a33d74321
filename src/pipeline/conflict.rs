//! Per-resource optimistic concurrency with a deterministic tie-break.
//!
//! Every tracked resource carries a head: the hash of the last accepted
//! event for it, together with that event's own `resourcePrev` (its parent).
//! An update must name the current head as its `resourcePrev`. When two
//! updates race from the same parent, the one with the smaller hash wins
//! regardless of arrival order: if the loser arrived first it is superseded
//! and retracted, so every node converges on the same head.

use std::collections::HashMap;

use crate::core::{Envelope, EventHash};

/// Result of checking an envelope against the resource heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// No `resourceId` in the payload; nothing to check.
    NotTracked,
    /// First event for this resource.
    Creation,
    /// `resourcePrev` names the current head.
    Advance,
    /// Sibling of the current head with a smaller hash; the current head
    /// must be retracted.
    Supersede { displaced: EventHash },
    /// Stale or sibling-with-larger-hash; reject.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeadEntry {
    head: EventHash,
    /// The head event's own `resourcePrev`, kept so a late-arriving sibling
    /// can be recognized and tie-broken.
    parent: Option<EventHash>,
}

/// Current head per resource id. Rebuilt from the log on startup, never
/// persisted separately.
#[derive(Debug, Default)]
pub struct ResourceHeads {
    heads: HashMap<String, HeadEntry>,
}

impl ResourceHeads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head_of(&self, resource: &str) -> Option<&EventHash> {
        self.heads.get(resource).map(|e| &e.head)
    }

    /// Classify without mutating. `prev` must already be parsed from the
    /// envelope payload.
    pub fn check(&self, env: &Envelope, prev: Option<&EventHash>) -> ConflictOutcome {
        let Some(resource) = env.resource_id() else {
            return ConflictOutcome::NotTracked;
        };
        let Some(entry) = self.heads.get(resource) else {
            return match prev {
                None => ConflictOutcome::Creation,
                // Head unknown (possibly pruned); a stale prev cannot be
                // distinguished from a valid one here, so fail closed.
                Some(_) => ConflictOutcome::Conflict,
            };
        };

        if prev == Some(&entry.head) {
            return ConflictOutcome::Advance;
        }
        // Same parent as the current head: a racing sibling. Smaller hash
        // wins so acceptance does not depend on arrival order.
        if prev == entry.parent.as_ref() && env.hash < entry.head {
            return ConflictOutcome::Supersede {
                displaced: entry.head,
            };
        }
        ConflictOutcome::Conflict
    }

    /// Record an accepted event as the new head for its resource.
    pub fn record(&mut self, env: &Envelope, prev: Option<EventHash>) {
        if let Some(resource) = env.resource_id() {
            self.heads.insert(
                resource.to_string(),
                HeadEntry {
                    head: env.hash,
                    parent: prev,
                },
            );
        }
    }
}
