//! Replication: serving sync requests and pulling from peers.
//!
//! The server side answers gossip, range, and snapshot traffic through the
//! validation pipeline; the client side pulls ranges with a resumable cursor
//! and fails over to the next peer when one stops answering. Transport is a
//! trait so the same logic runs over TCP, in-process test wiring, or
//! anything else that can move frames.

use std::collections::HashSet;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{crypto, Envelope, EventHash, KeyHandle, PeerId};
use crate::pipeline::{IngestOutcome, RejectReason, ValidationPipeline};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::{KvStore, LogError};
use crate::wire::{Message, WireMessage};
use crate::Error;

use super::admission::{AdmissionError, PeerRotation, PowTicket, StakeLookup, StakeProof};
use super::score::{Observation, ScoreBook, Standing};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(PeerId),
    #[error("peer {0} unavailable")]
    Unavailable(PeerId),
}

/// Moves encoded messages between peers. A request may produce any number of
/// reply messages (a snapshot fetch streams chunks).
pub trait Transport {
    fn request(&mut self, peer: &PeerId, bytes: Bytes) -> Result<Vec<Vec<u8>>, TransportError>;
    fn broadcast(&mut self, bytes: Bytes) -> Result<(), TransportError>;
}

/// How new peers earn a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Anyone connects. Finality falls back to the time window.
    Open,
    ProofOfWork { min_difficulty: u32 },
    Staked { min_stake: u64 },
}

pub struct SyncServer<S: KvStore, C: KvStore> {
    key: KeyHandle,
    local_peer: PeerId,
    pipeline: ValidationPipeline<S>,
    snapshots: SnapshotStore<C>,
    scores: ScoreBook,
    admitted: HashSet<PeerId>,
    policy: AdmissionPolicy,
    stake_lookup: Option<Box<dyn StakeLookup + Send>>,
}

impl<S: KvStore, C: KvStore> SyncServer<S, C> {
    pub fn new(
        key: KeyHandle,
        pipeline: ValidationPipeline<S>,
        snapshots: SnapshotStore<C>,
        policy: AdmissionPolicy,
    ) -> Self {
        let local_peer = PeerId::from_public_key(&key.public_key());
        Self {
            key,
            local_peer,
            pipeline,
            snapshots,
            scores: ScoreBook::new(),
            admitted: HashSet::new(),
            policy,
            stake_lookup: None,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn with_stake_lookup(mut self, lookup: Box<dyn StakeLookup + Send>) -> Self {
        self.stake_lookup = Some(lookup);
        self
    }

    pub fn pipeline(&self) -> &ValidationPipeline<S> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut ValidationPipeline<S> {
        &mut self.pipeline
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotStore<C> {
        &mut self.snapshots
    }

    pub fn is_admitted(&self, peer: &PeerId) -> bool {
        matches!(self.policy, AdmissionPolicy::Open) || self.admitted.contains(peer)
    }

    pub fn standing(&self, peer: &PeerId) -> Standing {
        self.scores.standing(peer, self.pipeline.limits())
    }

    /// Periodic maintenance tick.
    pub fn decay_scores(&mut self) {
        let limits = self.pipeline.limits().clone();
        self.scores.decay(&limits);
    }

    /// Handle one inbound message payload from `peer`, returning the replies
    /// to send back.
    pub fn handle(
        &mut self,
        peer: &PeerId,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Vec<WireMessage>, Error> {
        let limits = self.pipeline.limits().clone();
        match self.scores.on_message(peer, now_ms, &limits) {
            Standing::Disconnect => {
                debug!(peer = %peer, "dropping message from disconnected peer");
                return Ok(Vec::new());
            }
            Standing::Throttled | Standing::Ok => {}
        }

        let wire = match WireMessage::decode(payload) {
            Ok(wire) => wire,
            Err(e) => {
                self.scores.observe(peer, Observation::MalformedMessage);
                return Err(Error::Wire(e));
            }
        };

        let admission_msg = matches!(
            wire.msg,
            Message::PowTicket { .. } | Message::StakeProof { .. } | Message::Rotation { .. }
        );
        if !self.is_admitted(peer) && !admission_msg {
            self.scores.observe(peer, Observation::Flood);
            return Err(Error::Admission(AdmissionError::NotAdmitted));
        }
        if self.standing(peer) == Standing::Throttled && !admission_msg {
            // Throttled peers keep their connection but lose service.
            debug!(peer = %peer, "throttled, ignoring");
            return Ok(Vec::new());
        }

        match wire.msg {
            Message::GossipEvent { event } => self.handle_gossip(peer, &event, now_ms),
            Message::RangeRequest { from, limit } => self.handle_range(from, limit),
            Message::SnapshotRequest { hash } => self.handle_snapshot_request(hash),
            // Reply kinds; nothing to do when pushed unsolicited.
            Message::RangeResponse { .. } | Message::SnapshotChunk { .. } => Ok(Vec::new()),
            Message::EventAck { hash, peer: claimed, sig } => {
                // An ack feeds finality, so it must be signed by the key it
                // names and arrive from that same identity.
                if claimed != *peer
                    || crypto::verify(
                        crypto::P2P_DOMAIN,
                        hash.as_bytes(),
                        &sig,
                        &claimed.public_key(),
                    )
                    .is_err()
                {
                    self.scores.observe(peer, Observation::InvalidSignature);
                    return Ok(Vec::new());
                }
                self.pipeline.finality_mut().record_ack(&hash, claimed);
                Ok(Vec::new())
            }
            Message::PowTicket { ticket } => self.handle_pow(peer, &ticket, now_ms),
            Message::StakeProof { proof } => self.handle_stake(peer, &proof),
            Message::Rotation { record } => self.handle_rotation(peer, &record),
            Message::Reject { hash, code } => {
                debug!(peer = %peer, %hash, code, "peer rejected our event");
                Ok(Vec::new())
            }
        }
    }

    fn handle_gossip(
        &mut self,
        peer: &PeerId,
        event: &[u8],
        now_ms: u64,
    ) -> Result<Vec<WireMessage>, Error> {
        let env = match Envelope::from_bytes(event) {
            Ok(env) => env,
            Err(e) => {
                self.scores.observe(peer, Observation::MalformedMessage);
                return Err(Error::Envelope(e));
            }
        };
        match self.pipeline.submit(env, now_ms)? {
            IngestOutcome::Accepted { applied } => {
                self.scores.observe(peer, Observation::UsefulEvent);
                let mut acks = Vec::with_capacity(applied.len());
                for hash in applied {
                    let sig = self
                        .key
                        .sign(crypto::P2P_DOMAIN, hash.as_bytes())
                        .map_err(Error::Keystore)?;
                    acks.push(WireMessage::new(Message::EventAck {
                        hash,
                        peer: self.local_peer.clone(),
                        sig: sig.to_bytes().to_vec(),
                    }));
                }
                Ok(acks)
            }
            IngestOutcome::Buffered | IngestOutcome::Duplicate => Ok(Vec::new()),
            IngestOutcome::Rejected(reason) => {
                let obs = if matches!(reason, RejectReason::InvalidSignature) {
                    Observation::InvalidSignature
                } else {
                    Observation::RejectedEvent
                };
                self.scores.observe(peer, obs);
                let hash = Envelope::from_bytes(event)
                    .map(|e| e.hash)
                    .unwrap_or(EventHash::from_bytes([0u8; 32]));
                Ok(vec![WireMessage::new(Message::Reject {
                    hash,
                    code: reason.code().to_string(),
                })])
            }
        }
    }

    fn handle_range(
        &mut self,
        from: Option<EventHash>,
        limit: u64,
    ) -> Result<Vec<WireMessage>, Error> {
        let limits = self.pipeline.limits();
        // A zero limit would answer with an empty page marked has_more and
        // stall the requester's cursor loop.
        let limit = (limit as usize).min(limits.max_range_events).max(1);
        let max_bytes = limits.max_range_bytes;
        match self.pipeline.log().get_range(from.as_ref(), limit, max_bytes) {
            Ok(page) => Ok(vec![WireMessage::new(Message::RangeResponse {
                events: page.events,
                cursor: page.cursor,
                has_more: page.has_more,
            })]),
            Err(LogError::UnknownCursor(cursor)) => {
                // The requester's cursor fell behind our pruning horizon; it
                // must restart from a snapshot.
                Ok(vec![WireMessage::new(Message::Reject {
                    hash: cursor,
                    code: "unknown_cursor".to_string(),
                })])
            }
            Err(e) => Err(Error::Log(e)),
        }
    }

    fn handle_snapshot_request(
        &mut self,
        hash: Option<EventHash>,
    ) -> Result<Vec<WireMessage>, Error> {
        let snapshot = match hash {
            Some(hash) => self.snapshots.get(&hash)?,
            None => self.snapshots.latest()?,
        };
        let Some(snapshot) = snapshot else {
            return Ok(Vec::new());
        };
        let bytes = snapshot.to_bytes()?;
        let chunk_size = self.pipeline.limits().snapshot_chunk_bytes.max(1);
        let chunks: Vec<&[u8]> = bytes.chunks(chunk_size).collect();
        let count = chunks.len() as u32;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                WireMessage::new(Message::SnapshotChunk {
                    hash: snapshot.hash,
                    index: index as u32,
                    count,
                    data: data.to_vec(),
                })
            })
            .collect())
    }

    fn handle_pow(
        &mut self,
        peer: &PeerId,
        ticket: &[u8],
        now_ms: u64,
    ) -> Result<Vec<WireMessage>, Error> {
        let AdmissionPolicy::ProofOfWork { min_difficulty } = self.policy else {
            return Err(Error::Admission(AdmissionError::NotAdmitted));
        };
        let ticket: PowTicket = serde_json::from_slice(ticket)
            .map_err(|e| Error::Admission(AdmissionError::Decode(e)))?;
        if &ticket.peer != peer {
            self.scores.observe(peer, Observation::InvalidSignature);
            return Err(Error::Admission(AdmissionError::NotAdmitted));
        }
        if let Err(e) = ticket.verify(now_ms, min_difficulty, self.pipeline.limits()) {
            self.scores.observe(peer, Observation::InvalidSignature);
            return Err(Error::Admission(e));
        }
        info!(peer = %peer, difficulty = ticket.difficulty, "peer admitted via proof of work");
        self.admitted.insert(peer.clone());
        Ok(Vec::new())
    }

    fn handle_stake(&mut self, peer: &PeerId, proof: &[u8]) -> Result<Vec<WireMessage>, Error> {
        let AdmissionPolicy::Staked { min_stake } = self.policy else {
            return Err(Error::Admission(AdmissionError::NotAdmitted));
        };
        let proof: StakeProof = serde_json::from_slice(proof)
            .map_err(|e| Error::Admission(AdmissionError::Decode(e)))?;
        if &proof.peer != peer {
            self.scores.observe(peer, Observation::InvalidSignature);
            return Err(Error::Admission(AdmissionError::NotAdmitted));
        }
        let Some(lookup) = self.stake_lookup.as_deref() else {
            return Err(Error::Admission(AdmissionError::UnknownStake));
        };
        if let Err(e) = proof.verify(lookup, min_stake) {
            self.scores.observe(peer, Observation::InvalidSignature);
            return Err(Error::Admission(e));
        }
        info!(peer = %peer, controller = %proof.controller, "peer admitted via stake proof");
        self.admitted.insert(peer.clone());
        Ok(Vec::new())
    }

    fn handle_rotation(
        &mut self,
        peer: &PeerId,
        record: &[u8],
    ) -> Result<Vec<WireMessage>, Error> {
        let record: PeerRotation = serde_json::from_slice(record)
            .map_err(|e| Error::Admission(AdmissionError::Decode(e)))?;
        if let Err(e) = record.verify() {
            self.scores.observe(peer, Observation::InvalidSignature);
            return Err(Error::Admission(e));
        }
        // Standing transfers only if the old identity had earned admission.
        if self.admitted.remove(&record.old) {
            self.admitted.insert(record.new.clone());
        }
        self.scores.reassign(&record.old, record.new.clone());
        info!(old = %record.old, new = %record.new, "peer key rotated");
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    pub pages: u64,
    pub received: u64,
    pub accepted: u64,
}

/// Cursor-resuming range puller.
pub struct SyncClient {
    cursor: Option<EventHash>,
}

impl SyncClient {
    pub fn new(cursor: Option<EventHash>) -> Self {
        Self { cursor }
    }

    pub fn cursor(&self) -> Option<&EventHash> {
        self.cursor.as_ref()
    }

    /// Pull everything available from the first responsive peer, feeding
    /// events through the pipeline. A peer that times out is skipped; the
    /// next peer resumes from the same cursor.
    pub fn pull<T: Transport, S: KvStore>(
        &mut self,
        transport: &mut T,
        peers: &[PeerId],
        pipeline: &mut ValidationPipeline<S>,
        now_ms: u64,
    ) -> Result<PullStats, Error> {
        let mut stats = PullStats::default();
        let limit = pipeline.limits().max_range_events as u64;

        'peers: for peer in peers {
            loop {
                let request = WireMessage::new(Message::RangeRequest {
                    from: self.cursor,
                    limit,
                });
                let replies = match transport.request(peer, request.relay_bytes()?) {
                    Ok(replies) => replies,
                    Err(e) => {
                        warn!(peer = %peer, %e, "range request failed, trying next peer");
                        continue 'peers;
                    }
                };

                let mut has_more = false;
                for reply in &replies {
                    match WireMessage::decode(reply)?.msg {
                        Message::RangeResponse {
                            events,
                            cursor,
                            has_more: more,
                        } => {
                            stats.pages += 1;
                            for bytes in events {
                                stats.received += 1;
                                let env = Envelope::from_bytes(&bytes)?;
                                if let IngestOutcome::Accepted { applied } =
                                    pipeline.submit(env, now_ms)?
                                {
                                    stats.accepted += applied.len() as u64;
                                }
                            }
                            if let Some(cursor) = cursor {
                                self.cursor = Some(cursor);
                            }
                            has_more = more;
                        }
                        Message::Reject { code, .. } if code == "unknown_cursor" => {
                            // Fell behind the peer's pruning horizon; restart
                            // from the beginning (or a snapshot, done by the
                            // caller before retrying).
                            info!(peer = %peer, "cursor unknown to peer, restarting");
                            self.cursor = None;
                        }
                        other => {
                            debug!(kind = other.kind(), "ignoring non-range reply");
                        }
                    }
                }
                if !has_more {
                    return Ok(stats);
                }
            }
        }
        Ok(stats)
    }

    /// Fetch and reassemble a snapshot from `peer` (`None` asks for their
    /// latest). Returns `None` when the peer has no snapshot.
    pub fn fetch_snapshot<T: Transport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        hash: Option<EventHash>,
    ) -> Result<Option<Snapshot>, Error> {
        let request = WireMessage::new(Message::SnapshotRequest { hash });
        let replies = transport
            .request(peer, request.relay_bytes()?)
            .map_err(Error::Transport)?;

        let mut expected: Option<(EventHash, u32)> = None;
        let mut parts: Vec<Option<Vec<u8>>> = Vec::new();
        for reply in &replies {
            let Message::SnapshotChunk {
                hash,
                index,
                count,
                data,
            } = WireMessage::decode(reply)?.msg
            else {
                continue;
            };
            match expected {
                None => {
                    expected = Some((hash, count));
                    parts = vec![None; count as usize];
                }
                Some((h, c)) if h == hash && c == count => {}
                Some(_) => {
                    return Err(Error::Wire(crate::wire::WireError::Decode(
                        "interleaved snapshot chunks".to_string(),
                    )))
                }
            }
            if let Some(slot) = parts.get_mut(index as usize) {
                *slot = Some(data);
            }
        }

        if expected.is_none() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        for part in parts {
            let Some(part) = part else {
                return Err(Error::Wire(crate::wire::WireError::Decode(
                    "missing snapshot chunk".to_string(),
                )));
            };
            bytes.extend_from_slice(&part);
        }
        Ok(Some(Snapshot::from_bytes(&bytes)?))
    }
}
