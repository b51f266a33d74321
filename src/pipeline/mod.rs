//! The validation pipeline: every event passes the same ordered checks
//! before it can touch the log or any state module.
//!
//! Check order is fixed: schema, signature, authorization, nonce, resource
//! conflict, then sink application. An event either fully lands (appended,
//! nonce committed, heads advanced, sinks applied) or leaves no trace.

pub mod conflict;
pub mod finality;
pub mod nonce;

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{Did, Envelope, EnvelopeError, EventHash, EventType, Limits};
use crate::store::{EventLog, KvStore};
use crate::Error;

pub use conflict::{ConflictOutcome, ResourceHeads};
pub use finality::{required_acks, FinalityConfig, FinalityTracker};
pub use nonce::{NonceCheck, NonceStream};

/// Why an event was refused. `code()` values are stable protocol identifiers
/// carried in reject notices; the detail strings are local diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MalformedEnvelope(String),
    EnvelopeTooLarge,
    InvalidSignature,
    SchemaViolation(String),
    Unauthorized,
    ReplayedNonce,
    NonceGapTooLarge,
    ResourceConflict,
    SinkRejected(String),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MalformedEnvelope(_) => "malformed_envelope",
            RejectReason::EnvelopeTooLarge => "envelope_too_large",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::SchemaViolation(_) => "schema_violation",
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::ReplayedNonce => "replayed_nonce",
            RejectReason::NonceGapTooLarge => "nonce_gap_too_large",
            RejectReason::ResourceConflict => "resource_conflict",
            RejectReason::SinkRejected(_) => "sink_rejected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MalformedEnvelope(detail)
            | RejectReason::SchemaViolation(detail)
            | RejectReason::SinkRejected(detail) => write!(f, "{}: {detail}", self.code()),
            _ => f.write_str(self.code()),
        }
    }
}

/// A state module's refusal to apply an event it was offered.
#[derive(Debug, Error)]
#[error("{module}: {reason}")]
pub struct SinkError {
    pub module: &'static str,
    pub reason: String,
}

/// A deterministic state module fed by accepted events.
///
/// `apply` must be a pure function of prior state and the envelope: same
/// events in the same order produce the same exported state on every node.
pub trait EventSink: Send {
    fn module(&self) -> &'static str;

    fn apply(&mut self, env: &Envelope) -> Result<(), SinkError>;

    /// Undo a previously applied event. Called when a racing sibling with a
    /// smaller hash displaces it, and to roll back when a later sink in the
    /// same submission fails. The default ignores the notice, which is only
    /// correct for sinks that derive nothing from displaced heads.
    fn retract(&mut self, _env: &Envelope) {}

    /// Canonical JSON export of the module's full state, for snapshots.
    fn export_state(&self) -> Value;
}

/// Payload requirements per event type.
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    pub required_fields: Vec<String>,
}

/// Known event types and their payload schemas. Unknown types are rejected
/// unless the registry was built permissive.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<EventType, EventSchema>,
    allow_unknown: bool,
}

impl SchemaRegistry {
    /// Strict registry: only registered types pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that passes unregistered types through unchecked. Relays use
    /// this; full validators register everything they apply.
    pub fn permissive() -> Self {
        Self {
            schemas: HashMap::new(),
            allow_unknown: true,
        }
    }

    pub fn register(&mut self, event_type: EventType, schema: EventSchema) -> &mut Self {
        self.schemas.insert(event_type, schema);
        self
    }

    pub fn validate(&self, env: &Envelope) -> Result<(), String> {
        let Some(schema) = self.schemas.get(&env.event_type) else {
            if self.allow_unknown {
                return Ok(());
            }
            return Err(format!("unknown event type {}", env.event_type));
        };
        if schema.required_fields.is_empty() {
            return Ok(());
        }
        let Some(obj) = env.payload.as_object() else {
            return Err("payload must be an object".to_string());
        };
        for field in &schema.required_fields {
            if !obj.contains_key(field) {
                return Err(format!("missing required field `{field}`"));
            }
        }
        Ok(())
    }
}

/// Issuer-level permission check, applied after the signature is known good.
pub trait Authorizer: Send {
    fn authorize(&self, env: &Envelope) -> Result<(), String>;
}

/// Permissive policy for relays: any issuer with a valid signature may emit
/// any event.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _env: &Envelope) -> Result<(), String> {
        Ok(())
    }
}

/// Default policy: an issuer may only act on subjects it controls. Payload
/// `from`/`account` fields must name the issuer, and DID-document events
/// must target the issuer itself.
pub struct IssuerControls;

impl Authorizer for IssuerControls {
    fn authorize(&self, env: &Envelope) -> Result<(), String> {
        for field in ["from", "account"] {
            if let Some(actor) = env.payload.get(field).and_then(Value::as_str) {
                if actor != env.issuer.as_str() {
                    return Err(format!("payload `{field}` does not match the issuer"));
                }
            }
        }
        if env.event_type.module() == "did" {
            match env.payload.get("id").and_then(Value::as_str) {
                Some(id) if id == env.issuer.as_str() => {}
                _ => return Err("did events must target the issuer".to_string()),
            }
        }
        Ok(())
    }
}

/// What happened to a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Landed, along with any buffered events it unblocked (in order).
    Accepted { applied: Vec<EventHash> },
    /// Parked in the issuer's nonce buffer.
    Buffered,
    /// Already in the log (or already parked); nothing to do.
    Duplicate,
    Rejected(RejectReason),
}

enum StepResult {
    Applied,
    Buffered,
    Duplicate,
    Rejected(RejectReason),
}

pub struct ValidationPipeline<S: KvStore> {
    log: EventLog<S>,
    limits: Limits,
    registry: SchemaRegistry,
    authorizer: Box<dyn Authorizer>,
    sinks: Vec<Box<dyn EventSink>>,
    nonces: HashMap<Did, NonceStream>,
    heads: ResourceHeads,
    finality: FinalityTracker,
}

impl<S: KvStore> ValidationPipeline<S> {
    pub fn new(
        log: EventLog<S>,
        limits: Limits,
        registry: SchemaRegistry,
        finality: FinalityConfig,
    ) -> Self {
        Self {
            log,
            limits,
            registry,
            authorizer: Box::new(IssuerControls),
            sinks: Vec::new(),
            nonces: HashMap::new(),
            heads: ResourceHeads::new(),
            finality: FinalityTracker::new(finality),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Box<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn log(&self) -> &EventLog<S> {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut EventLog<S> {
        &mut self.log
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn finality(&self) -> &FinalityTracker {
        &self.finality
    }

    pub fn finality_mut(&mut self) -> &mut FinalityTracker {
        &mut self.finality
    }

    pub fn resource_head(&self, resource: &str) -> Option<&EventHash> {
        self.heads.head_of(resource)
    }

    /// Rebuild resource heads and sink state from the log. Run once at
    /// startup, after recovery, before accepting traffic.
    pub fn replay_from_log(&mut self) -> Result<u64, Error> {
        let mut replayed = 0;
        for seq in 1..=self.log.head_seq() {
            let Some((_, bytes)) = self.log.get_by_seq(seq)? else {
                continue;
            };
            let env = Envelope::from_bytes(&bytes).map_err(Error::Envelope)?;
            let prev = env
                .resource_prev()
                .map_err(Error::Envelope)?;
            // Replay may encounter a displaced sibling followed by its
            // winner; route through the same supersede logic so rebuilt
            // state matches what the live path produced.
            if let ConflictOutcome::Supersede { displaced } =
                self.heads.check(&env, prev.as_ref())
            {
                self.retract_displaced(&displaced)?;
            }
            self.heads.record(&env, prev);
            for sink in &mut self.sinks {
                if let Err(e) = sink.apply(&env) {
                    warn!(hash = %env.hash, %e, "sink refused a logged event during replay");
                }
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Validate and land one event, draining any buffered successors it
    /// unblocks.
    pub fn submit(&mut self, env: Envelope, now_ms: u64) -> Result<IngestOutcome, Error> {
        let issuer = env.issuer.clone();
        match self.ingest_one(&env, now_ms)? {
            StepResult::Applied => {
                let mut applied = vec![env.hash];
                loop {
                    let Some(next) = self
                        .nonces
                        .get_mut(&issuer)
                        .and_then(NonceStream::pop_ready)
                    else {
                        break;
                    };
                    match self.ingest_one(&next, now_ms)? {
                        StepResult::Applied => applied.push(next.hash),
                        StepResult::Rejected(reason) => {
                            // The buffered event does not advance the stream;
                            // its nonce is free for the issuer to reuse.
                            debug!(hash = %next.hash, %reason, "drained event rejected");
                            break;
                        }
                        StepResult::Buffered | StepResult::Duplicate => break,
                    }
                }
                Ok(IngestOutcome::Accepted { applied })
            }
            StepResult::Buffered => Ok(IngestOutcome::Buffered),
            StepResult::Duplicate => Ok(IngestOutcome::Duplicate),
            StepResult::Rejected(reason) => Ok(IngestOutcome::Rejected(reason)),
        }
    }

    fn ingest_one(&mut self, env: &Envelope, now_ms: u64) -> Result<StepResult, Error> {
        if self.log.contains(&env.hash)? {
            return Ok(StepResult::Duplicate);
        }

        if let Err(reason) = self.registry.validate(env) {
            return Ok(StepResult::Rejected(RejectReason::SchemaViolation(reason)));
        }

        let limits = self.limits.clone();
        if let Err(e) = env.verify(&limits) {
            return Ok(StepResult::Rejected(match e {
                EnvelopeError::TooLarge { .. } => RejectReason::EnvelopeTooLarge,
                EnvelopeError::HashMismatch
                | EnvelopeError::InvalidSignature(_)
                | EnvelopeError::IssuerKeyMismatch => RejectReason::InvalidSignature,
                other => RejectReason::MalformedEnvelope(other.to_string()),
            }));
        }

        if let Err(reason) = self.authorizer.authorize(env) {
            debug!(issuer = %env.issuer, %reason, "unauthorized event");
            return Ok(StepResult::Rejected(RejectReason::Unauthorized));
        }

        let stream = self.stream_for(&env.issuer)?;
        match stream.offer(env, &limits) {
            NonceCheck::Next => {}
            NonceCheck::Buffered => return Ok(StepResult::Buffered),
            NonceCheck::AlreadyBuffered => return Ok(StepResult::Duplicate),
            NonceCheck::Replay => {
                return Ok(StepResult::Rejected(RejectReason::ReplayedNonce))
            }
            NonceCheck::GapTooLarge => {
                return Ok(StepResult::Rejected(RejectReason::NonceGapTooLarge))
            }
        }

        let prev = match env.resource_prev() {
            Ok(prev) => prev,
            Err(e) => {
                return Ok(StepResult::Rejected(RejectReason::MalformedEnvelope(
                    e.to_string(),
                )))
            }
        };
        let displaced = match self.heads.check(env, prev.as_ref()) {
            ConflictOutcome::Conflict => {
                return Ok(StepResult::Rejected(RejectReason::ResourceConflict))
            }
            ConflictOutcome::Supersede { displaced } => Some(displaced),
            ConflictOutcome::NotTracked
            | ConflictOutcome::Creation
            | ConflictOutcome::Advance => None,
        };

        // All checks passed. The displaced sibling comes out of the sinks
        // before the winner goes in, the same order replay uses, so the
        // result cannot depend on how a sink implements `retract`.
        let displaced_env = match displaced {
            Some(ref hash) => self.retract_displaced(hash)?,
            None => None,
        };

        let mut applied_sinks = 0;
        let mut sink_failure = None;
        for sink in &mut self.sinks {
            match sink.apply(env) {
                Ok(()) => applied_sinks += 1,
                Err(e) => {
                    sink_failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = sink_failure {
            for sink in self.sinks.iter_mut().take(applied_sinks) {
                sink.retract(env);
            }
            // The challenger did not land; the head it tried to displace
            // stays the head and goes back into the sinks.
            if let Some(d) = &displaced_env {
                for sink in &mut self.sinks {
                    if let Err(err) = sink.apply(d) {
                        warn!(hash = %d.hash, %err, "sink refused the restored head");
                    }
                }
                self.finality.observe(d, now_ms, &limits);
            }
            return Ok(StepResult::Rejected(RejectReason::SinkRejected(
                e.to_string(),
            )));
        }

        // Commit: log first, then the derived indices.
        let bytes = env.to_bytes().map_err(Error::Envelope)?;
        self.log.append(&env.hash, &bytes)?;
        self.log.set_committed_nonce(&env.issuer, env.nonce)?;
        self.heads.record(env, prev);
        if let Some(stream) = self.nonces.get_mut(&env.issuer) {
            stream.commit(env.nonce);
        }
        self.finality.observe(env, now_ms, &limits);
        debug!(hash = %env.hash, event_type = %env.event_type, "event accepted");
        Ok(StepResult::Applied)
    }

    fn retract_displaced(&mut self, displaced: &EventHash) -> Result<Option<Envelope>, Error> {
        let Some(bytes) = self.log.get_by_hash(displaced)? else {
            return Ok(None);
        };
        let env = Envelope::from_bytes(&bytes).map_err(Error::Envelope)?;
        for sink in &mut self.sinks {
            sink.retract(&env);
        }
        // A displaced event is in conflict with an accepted sibling and must
        // never read as final.
        self.finality.forget(displaced);
        debug!(hash = %displaced, "head displaced by smaller sibling");
        Ok(Some(env))
    }

    /// Light-node pruning: drop log entries at or below `cutoff_seq` (keeping
    /// the most recent `retain` of them) together with the finality
    /// bookkeeping that referenced them.
    pub fn prune_through(&mut self, cutoff_seq: u64, retain: u64) -> Result<u64, Error> {
        let dropped = self.log.prune_through(cutoff_seq, retain)?;
        for hash in &dropped {
            self.finality.forget(hash);
        }
        Ok(dropped.len() as u64)
    }

    fn stream_for(&mut self, issuer: &Did) -> Result<&mut NonceStream, Error> {
        let committed = match self.nonces.contains_key(issuer) {
            true => 0,
            false => self.log.committed_nonce(issuer)?,
        };
        Ok(self
            .nonces
            .entry(issuer.clone())
            .or_insert_with(|| NonceStream::resume(committed)))
    }

    /// Per-module canonical state, for snapshot builds and determinism
    /// checks. Keyed by module name, ordered.
    pub fn export_state(&self) -> std::collections::BTreeMap<String, Value> {
        self.sinks
            .iter()
            .map(|s| (s.module().to_string(), s.export_state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keystore::RotationPolicy;
    use crate::core::{EnvelopeDraft, KeyHandle};
    use crate::store::MemoryKv;
    use ed25519_dalek::SigningKey;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn key(seed: u8) -> KeyHandle {
        KeyHandle::new(
            SigningKey::from_bytes(&[seed; 32]),
            RotationPolicy::default(),
            0,
        )
    }

    fn transfer(key: &mut KeyHandle, nonce: u64, amount: u64) -> Envelope {
        EnvelopeDraft::new(
            EventType::parse("wallet.transfer").unwrap(),
            key.did(),
            json!({"amount": amount}),
            1_700_000_000_000 + nonce,
            nonce,
            None,
        )
        .finalize(key, &Limits::default())
        .unwrap()
    }

    fn registry() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        reg.register(
            EventType::parse("wallet.transfer").unwrap(),
            EventSchema {
                required_fields: vec!["amount".to_string()],
            },
        );
        reg.register(
            EventType::parse("escrow.release").unwrap(),
            EventSchema {
                required_fields: vec!["resourceId".to_string()],
            },
        );
        reg
    }

    fn pipeline() -> ValidationPipeline<MemoryKv> {
        ValidationPipeline::new(
            EventLog::open(MemoryKv::new()).unwrap(),
            Limits::default(),
            registry(),
            FinalityConfig::default(),
        )
    }

    /// Counts applied amounts; refuses amounts of exactly 13.
    struct TallySink {
        total: u64,
    }

    impl EventSink for TallySink {
        fn module(&self) -> &'static str {
            "wallet"
        }

        fn apply(&mut self, env: &Envelope) -> Result<(), SinkError> {
            let amount = env.amount().unwrap_or(0);
            if amount == 13 {
                return Err(SinkError {
                    module: "wallet",
                    reason: "refused".to_string(),
                });
            }
            self.total += amount;
            Ok(())
        }

        fn retract(&mut self, env: &Envelope) {
            self.total -= env.amount().unwrap_or(0);
        }

        fn export_state(&self) -> Value {
            json!({"total": self.total})
        }
    }

    #[test]
    fn accepts_in_order_events() {
        let mut p = pipeline();
        let mut k = key(1);
        let e1 = transfer(&mut k, 1, 10);
        let e2 = transfer(&mut k, 2, 20);
        assert_eq!(
            p.submit(e1.clone(), 0).unwrap(),
            IngestOutcome::Accepted {
                applied: vec![e1.hash]
            }
        );
        assert_eq!(
            p.submit(e2.clone(), 0).unwrap(),
            IngestOutcome::Accepted {
                applied: vec![e2.hash]
            }
        );
        assert!(p.log().contains(&e2.hash).unwrap());
    }

    #[test]
    fn duplicate_and_replay() {
        let mut p = pipeline();
        let mut k = key(1);
        let e1 = transfer(&mut k, 1, 10);
        p.submit(e1.clone(), 0).unwrap();
        assert_eq!(p.submit(e1.clone(), 0).unwrap(), IngestOutcome::Duplicate);

        // Different event reusing a committed nonce.
        let replay = transfer(&mut k, 1, 99);
        assert_eq!(
            p.submit(replay, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::ReplayedNonce)
        );
    }

    #[test]
    fn out_of_order_buffers_then_drains() {
        let mut p = pipeline();
        let mut k = key(1);
        let e1 = transfer(&mut k, 1, 1);
        let e2 = transfer(&mut k, 2, 2);
        let e3 = transfer(&mut k, 3, 3);

        p.submit(e1, 0).unwrap();
        assert_eq!(p.submit(e3.clone(), 0).unwrap(), IngestOutcome::Buffered);
        // Nonce 3 is parked, not committed.
        assert!(!p.log().contains(&e3.hash).unwrap());

        let outcome = p.submit(e2.clone(), 0).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                applied: vec![e2.hash, e3.hash]
            }
        );
        assert!(p.log().contains(&e3.hash).unwrap());
    }

    #[test]
    fn nonce_gap_beyond_window_rejected() {
        let mut p = pipeline();
        let mut k = key(1);
        let far = transfer(&mut k, 50, 1);
        assert_eq!(
            p.submit(far, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::NonceGapTooLarge)
        );
    }

    #[test]
    fn schema_and_signature_rejections() {
        let mut p = pipeline();
        let mut k = key(1);

        let unknown = EnvelopeDraft::new(
            EventType::parse("dao.vote").unwrap(),
            k.did(),
            json!({}),
            1,
            1,
            None,
        )
        .finalize(&mut k, &Limits::default())
        .unwrap();
        assert!(matches!(
            p.submit(unknown, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::SchemaViolation(_))
        ));

        let missing_field = EnvelopeDraft::new(
            EventType::parse("wallet.transfer").unwrap(),
            k.did(),
            json!({"to": "x"}),
            1,
            1,
            None,
        )
        .finalize(&mut k, &Limits::default())
        .unwrap();
        assert!(matches!(
            p.submit(missing_field, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::SchemaViolation(_))
        ));

        let mut tampered = transfer(&mut k, 1, 5);
        tampered.payload = json!({"amount": 500});
        assert_eq!(
            p.submit(tampered, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::InvalidSignature)
        );
    }

    #[test]
    fn sink_failure_rolls_back_and_frees_the_nonce() {
        let mut p = pipeline();
        p.add_sink(Box::new(TallySink { total: 0 }));
        let mut k = key(1);

        p.submit(transfer(&mut k, 1, 10), 0).unwrap();
        let refused = transfer(&mut k, 2, 13);
        assert!(matches!(
            p.submit(refused.clone(), 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::SinkRejected(_))
        ));
        assert!(!p.log().contains(&refused.hash).unwrap());
        assert_eq!(p.export_state()["wallet"], json!({"total": 10}));

        // The nonce was not consumed; a replacement at nonce 2 lands.
        let retry = transfer(&mut k, 2, 20);
        assert!(matches!(
            p.submit(retry, 0).unwrap(),
            IngestOutcome::Accepted { .. }
        ));
        assert_eq!(p.export_state()["wallet"], json!({"total": 30}));
    }

    #[test]
    fn issuer_cannot_act_for_someone_else() {
        let mut p = pipeline();
        let mut k = key(1);
        let stranger = key(2).did();

        let forged = EnvelopeDraft::new(
            EventType::parse("wallet.transfer").unwrap(),
            k.did(),
            json!({"amount": 5, "from": stranger.as_str()}),
            1,
            1,
            None,
        )
        .finalize(&mut k, &Limits::default())
        .unwrap();
        assert_eq!(
            p.submit(forged, 0).unwrap(),
            IngestOutcome::Rejected(RejectReason::Unauthorized)
        );

        // Acting on its own account is fine; the nonce was not consumed.
        let own = EnvelopeDraft::new(
            EventType::parse("wallet.transfer").unwrap(),
            k.did(),
            json!({"amount": 5, "from": k.did().as_str()}),
            1,
            1,
            None,
        )
        .finalize(&mut k, &Limits::default())
        .unwrap();
        assert!(matches!(
            p.submit(own, 0).unwrap(),
            IngestOutcome::Accepted { .. }
        ));
    }

    fn escrow(key: &mut KeyHandle, nonce: u64, prev: Option<&EventHash>, note: u64) -> Envelope {
        let prev_field = match prev {
            Some(h) => Value::String(h.to_string()),
            None => Value::Null,
        };
        EnvelopeDraft::new(
            EventType::parse("escrow.release").unwrap(),
            key.did(),
            json!({"resourceId": "esc-1", "resourcePrev": prev_field, "note": note}),
            1_700_000_000_000 + nonce,
            nonce,
            None,
        )
        .finalize(key, &Limits::default())
        .unwrap()
    }

    #[test]
    fn racing_updates_converge_regardless_of_order() {
        let mut ka = key(1);
        let mut kb = key(2);
        let mut kc = key(3);
        let create = escrow(&mut kc, 1, None, 0);
        let a = escrow(&mut ka, 1, Some(&create.hash), 1);
        let b = escrow(&mut kb, 1, Some(&create.hash), 2);

        let mut first = pipeline();
        first.submit(create.clone(), 0).unwrap();
        first.submit(a.clone(), 0).unwrap();
        first.submit(b.clone(), 0).unwrap();

        let mut second = pipeline();
        second.submit(create.clone(), 0).unwrap();
        second.submit(b.clone(), 0).unwrap();
        second.submit(a.clone(), 0).unwrap();

        let winner = if a.hash < b.hash { a.hash } else { b.hash };
        assert_eq!(first.resource_head("esc-1"), Some(&winner));
        assert_eq!(second.resource_head("esc-1"), Some(&winner));
    }

    /// Remembers only the most recent note; retract clears it without
    /// checking what it displaces.
    struct LastNoteSink {
        note: Option<u64>,
    }

    impl EventSink for LastNoteSink {
        fn module(&self) -> &'static str {
            "notes"
        }

        fn apply(&mut self, env: &Envelope) -> Result<(), SinkError> {
            self.note = env.payload.get("note").and_then(Value::as_u64);
            Ok(())
        }

        fn retract(&mut self, _env: &Envelope) {
            self.note = None;
        }

        fn export_state(&self) -> Value {
            json!({"note": self.note})
        }
    }

    #[test]
    fn supersede_retracts_the_loser_before_applying_the_winner() {
        let mut ka = key(1);
        let mut kb = key(2);
        let mut kc = key(3);
        let create = escrow(&mut kc, 1, None, 10);
        let a = escrow(&mut ka, 1, Some(&create.hash), 11);
        let b = escrow(&mut kb, 1, Some(&create.hash), 12);
        let (loser, winner) = if a.hash < b.hash { (b, a) } else { (a, b) };
        let winner_note = winner.payload.get("note").and_then(Value::as_u64);

        let mut p = pipeline();
        p.add_sink(Box::new(LastNoteSink { note: None }));
        p.submit(create, 0).unwrap();
        p.submit(loser, 0).unwrap();
        p.submit(winner, 0).unwrap();
        // An unguarded retract must not wipe the winner's application.
        assert_eq!(p.export_state()["notes"], json!({"note": winner_note}));

        // Replay over the same log lands on the same state.
        let kv = p.log().kv().clone();
        let mut rebuilt = ValidationPipeline::new(
            EventLog::open(kv).unwrap(),
            Limits::default(),
            registry(),
            FinalityConfig::default(),
        );
        rebuilt.add_sink(Box::new(LastNoteSink { note: None }));
        rebuilt.replay_from_log().unwrap();
        assert_eq!(rebuilt.export_state(), p.export_state());
    }

    #[test]
    fn displaced_sibling_is_no_longer_final() {
        let mut ka = key(1);
        let mut kb = key(2);
        let mut kc = key(3);
        let create = escrow(&mut kc, 1, None, 0);
        let a = escrow(&mut ka, 1, Some(&create.hash), 1);
        let b = escrow(&mut kb, 1, Some(&create.hash), 2);
        let (loser, winner) = if a.hash < b.hash { (b, a) } else { (a, b) };

        let mut p = pipeline();
        p.submit(create, 0).unwrap();
        p.submit(loser.clone(), 0).unwrap();
        p.submit(winner.clone(), 0).unwrap();

        let limits = Limits::default();
        let window = limits.finality_window_ms;
        assert!(!p.finality_mut().is_final(&loser.hash, window, &limits));
        assert!(p.finality_mut().is_final(&winner.hash, window, &limits));
    }

    #[test]
    fn prune_drops_finality_bookkeeping() {
        let mut p = pipeline();
        let mut k = key(1);
        let limits = Limits::default();
        for nonce in 1..=3 {
            p.submit(transfer(&mut k, nonce, 1), 0).unwrap();
        }
        let hashes: Vec<EventHash> = (1..=3)
            .map(|seq| p.log().get_by_seq(seq).unwrap().unwrap().0)
            .collect();
        for hash in &hashes {
            assert!(p.finality_mut().is_final(hash, limits.finality_window_ms, &limits));
        }
        assert_eq!(p.finality().finalized_count(), 3);

        assert_eq!(p.prune_through(3, 0).unwrap(), 3);
        assert_eq!(p.finality().finalized_count(), 0);
    }

    #[test]
    fn replay_rebuilds_heads_and_sink_state() {
        let mut k = key(1);
        let e1 = transfer(&mut k, 1, 10);
        let e2 = transfer(&mut k, 2, 20);

        let mut p = pipeline();
        p.add_sink(Box::new(TallySink { total: 0 }));
        p.submit(e1, 0).unwrap();
        p.submit(e2, 0).unwrap();
        let state = p.export_state();

        // New pipeline over the same log, rebuilt by replay.
        let kv = p.log().kv().clone();
        let mut rebuilt = ValidationPipeline::new(
            EventLog::open(kv).unwrap(),
            Limits::default(),
            registry(),
            FinalityConfig::default(),
        );
        rebuilt.add_sink(Box::new(TallySink { total: 0 }));
        assert_eq!(rebuilt.replay_from_log().unwrap(), 2);
        assert_eq!(rebuilt.export_state(), state);

        // Committed nonces survive through the log, so nonce 3 is next.
        assert!(matches!(
            rebuilt.submit(transfer(&mut k, 3, 5), 0).unwrap(),
            IngestOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn export_state_is_ordered_by_module() {
        let mut p = pipeline();
        p.add_sink(Box::new(TallySink { total: 0 }));
        let state: BTreeMap<String, Value> = p.export_state();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["wallet"]);
    }
}
