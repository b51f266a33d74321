//! Protocol messages and their CBOR codec.
//!
//! A message is a two-element array: `[kind, body]`, where `body` is a map
//! with small-integer keys. Keys are emitted in ascending order; decoders
//! skip keys they do not recognize (forward compatibility) and reject
//! duplicates. Signed artifacts (envelopes, tickets, proofs) travel as their
//! canonical JSON bytes inside the body, so relaying never re-canonicalizes
//! what someone else signed.

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::core::{EventHash, PeerId};

use super::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A single envelope, canonical JSON bytes.
    GossipEvent { event: Vec<u8> },
    /// Pull events after `from` (`None` = from the beginning).
    RangeRequest { from: Option<EventHash>, limit: u64 },
    RangeResponse {
        events: Vec<Vec<u8>>,
        cursor: Option<EventHash>,
        has_more: bool,
    },
    /// Fetch a snapshot by hash (`None` = the responder's latest).
    SnapshotRequest { hash: Option<EventHash> },
    SnapshotChunk {
        hash: EventHash,
        index: u32,
        count: u32,
        data: Vec<u8>,
    },
    /// Acknowledgement that `peer` holds the event, signed by that peer's
    /// key under the p2p domain; feeds finality.
    EventAck {
        hash: EventHash,
        peer: PeerId,
        sig: Vec<u8>,
    },
    /// Admission artifacts, canonical JSON bytes.
    PowTicket { ticket: Vec<u8> },
    StakeProof { proof: Vec<u8> },
    Rotation { record: Vec<u8> },
    /// Event refused; `code` is a stable reject-reason identifier.
    Reject { hash: EventHash, code: String },
}

impl Message {
    pub fn kind(&self) -> u32 {
        match self {
            Message::GossipEvent { .. } => 1,
            Message::RangeRequest { .. } => 2,
            Message::RangeResponse { .. } => 3,
            Message::SnapshotRequest { .. } => 4,
            Message::SnapshotChunk { .. } => 5,
            Message::EventAck { .. } => 6,
            Message::PowTicket { .. } => 7,
            Message::StakeProof { .. } => 8,
            Message::Rotation { .. } => 9,
            Message::Reject { .. } => 10,
        }
    }
}

/// A decoded message together with the exact bytes it arrived in, so a relay
/// forwards what it received even when it skipped fields it does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub msg: Message,
    raw: Option<Bytes>,
}

impl WireMessage {
    pub fn new(msg: Message) -> Self {
        Self { msg, raw: None }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let msg = decode_message(bytes)?;
        Ok(Self {
            msg,
            raw: Some(Bytes::copy_from_slice(bytes)),
        })
    }

    /// Bytes to forward: the original frame when this message was received,
    /// a fresh encoding when it was built locally.
    pub fn relay_bytes(&self) -> Result<Bytes, WireError> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => Ok(Bytes::from(encode_message(&self.msg)?)),
        }
    }
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

fn enc_err<E: std::fmt::Display>(e: E) -> WireError {
    WireError::Encode(e.to_string())
}

fn dec_err<E: std::fmt::Display>(e: E) -> WireError {
    WireError::Decode(e.to_string())
}

fn put_hash(e: &mut Enc<'_>, key: u32, hash: &EventHash) -> Result<(), WireError> {
    e.u32(key).map_err(enc_err)?;
    e.bytes(hash.as_bytes()).map_err(enc_err)?;
    Ok(())
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    e.array(2).map_err(enc_err)?;
    e.u32(msg.kind()).map_err(enc_err)?;
    match msg {
        Message::GossipEvent { event } => {
            e.map(1).map_err(enc_err)?;
            e.u32(1).map_err(enc_err)?;
            e.bytes(event).map_err(enc_err)?;
        }
        Message::RangeRequest { from, limit } => {
            e.map(1 + u64::from(from.is_some())).map_err(enc_err)?;
            if let Some(from) = from {
                put_hash(&mut e, 1, from)?;
            }
            e.u32(2).map_err(enc_err)?;
            e.u64(*limit).map_err(enc_err)?;
        }
        Message::RangeResponse {
            events,
            cursor,
            has_more,
        } => {
            e.map(2 + u64::from(cursor.is_some())).map_err(enc_err)?;
            e.u32(1).map_err(enc_err)?;
            e.array(events.len() as u64).map_err(enc_err)?;
            for event in events {
                e.bytes(event).map_err(enc_err)?;
            }
            if let Some(cursor) = cursor {
                put_hash(&mut e, 2, cursor)?;
            }
            e.u32(3).map_err(enc_err)?;
            e.bool(*has_more).map_err(enc_err)?;
        }
        Message::SnapshotRequest { hash } => {
            e.map(u64::from(hash.is_some())).map_err(enc_err)?;
            if let Some(hash) = hash {
                put_hash(&mut e, 1, hash)?;
            }
        }
        Message::SnapshotChunk {
            hash,
            index,
            count,
            data,
        } => {
            e.map(4).map_err(enc_err)?;
            put_hash(&mut e, 1, hash)?;
            e.u32(2).map_err(enc_err)?;
            e.u32(*index).map_err(enc_err)?;
            e.u32(3).map_err(enc_err)?;
            e.u32(*count).map_err(enc_err)?;
            e.u32(4).map_err(enc_err)?;
            e.bytes(data).map_err(enc_err)?;
        }
        Message::EventAck { hash, peer, sig } => {
            e.map(3).map_err(enc_err)?;
            put_hash(&mut e, 1, hash)?;
            e.u32(2).map_err(enc_err)?;
            e.str(peer.as_str()).map_err(enc_err)?;
            e.u32(3).map_err(enc_err)?;
            e.bytes(sig).map_err(enc_err)?;
        }
        Message::PowTicket { ticket } => {
            e.map(1).map_err(enc_err)?;
            e.u32(1).map_err(enc_err)?;
            e.bytes(ticket).map_err(enc_err)?;
        }
        Message::StakeProof { proof } => {
            e.map(1).map_err(enc_err)?;
            e.u32(1).map_err(enc_err)?;
            e.bytes(proof).map_err(enc_err)?;
        }
        Message::Rotation { record } => {
            e.map(1).map_err(enc_err)?;
            e.u32(1).map_err(enc_err)?;
            e.bytes(record).map_err(enc_err)?;
        }
        Message::Reject { hash, code } => {
            e.map(2).map_err(enc_err)?;
            put_hash(&mut e, 1, hash)?;
            e.u32(2).map_err(enc_err)?;
            e.str(code).map_err(enc_err)?;
        }
    }
    Ok(buf)
}

struct BodyReader<'a, 'b> {
    d: &'a mut Decoder<'b>,
    remaining: u64,
    seen: u32,
}

impl<'a, 'b> BodyReader<'a, 'b> {
    fn open(d: &'a mut Decoder<'b>) -> Result<Self, WireError> {
        let remaining = d
            .map()
            .map_err(dec_err)?
            .ok_or_else(|| WireError::Decode("indefinite-length body".to_string()))?;
        Ok(Self {
            d,
            remaining,
            seen: 0,
        })
    }

    /// Next recognized key, skipping unknown ones. Duplicate keys reject the
    /// whole message.
    fn next_key(&mut self) -> Result<Option<u32>, WireError> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let key = self.d.u32().map_err(dec_err)?;
            if key < 32 {
                let bit = 1u32 << key;
                if self.seen & bit != 0 {
                    return Err(WireError::DuplicateField(key));
                }
                self.seen |= bit;
                return Ok(Some(key));
            }
            self.d.skip().map_err(dec_err)?;
        }
        Ok(None)
    }

    fn skip_value(&mut self) -> Result<(), WireError> {
        self.d.skip().map_err(dec_err)
    }
}

fn get_hash(d: &mut Decoder<'_>) -> Result<EventHash, WireError> {
    let raw = d.bytes().map_err(dec_err)?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| WireError::Decode(format!("hash must be 32 bytes, got {}", raw.len())))?;
    Ok(EventHash::from_bytes(bytes))
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    let mut d = Decoder::new(bytes);
    let len = d
        .array()
        .map_err(dec_err)?
        .ok_or_else(|| WireError::Decode("indefinite-length message".to_string()))?;
    if len != 2 {
        return Err(WireError::Decode(format!(
            "message array has {len} elements, want 2"
        )));
    }
    let kind = d.u32().map_err(dec_err)?;

    match kind {
        1 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut event = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => event = Some(body.d.bytes().map_err(dec_err)?.to_vec()),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::GossipEvent {
                event: event.ok_or(WireError::MissingField("event"))?,
            })
        }
        2 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut from = None;
            let mut limit = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => from = Some(get_hash(body.d)?),
                    2 => limit = Some(body.d.u64().map_err(dec_err)?),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::RangeRequest {
                from,
                limit: limit.ok_or(WireError::MissingField("limit"))?,
            })
        }
        3 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut events = None;
            let mut cursor = None;
            let mut has_more = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => {
                        let n = body.d.array().map_err(dec_err)?.ok_or_else(|| {
                            WireError::Decode("indefinite-length event list".to_string())
                        })?;
                        let mut list = Vec::with_capacity(n.min(1024) as usize);
                        for _ in 0..n {
                            list.push(body.d.bytes().map_err(dec_err)?.to_vec());
                        }
                        events = Some(list);
                    }
                    2 => cursor = Some(get_hash(body.d)?),
                    3 => has_more = Some(body.d.bool().map_err(dec_err)?),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::RangeResponse {
                events: events.ok_or(WireError::MissingField("events"))?,
                cursor,
                has_more: has_more.ok_or(WireError::MissingField("has_more"))?,
            })
        }
        4 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut hash = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => hash = Some(get_hash(body.d)?),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::SnapshotRequest { hash })
        }
        5 => {
            let mut body = BodyReader::open(&mut d)?;
            let (mut hash, mut index, mut count, mut data) = (None, None, None, None);
            while let Some(key) = body.next_key()? {
                match key {
                    1 => hash = Some(get_hash(body.d)?),
                    2 => index = Some(body.d.u32().map_err(dec_err)?),
                    3 => count = Some(body.d.u32().map_err(dec_err)?),
                    4 => data = Some(body.d.bytes().map_err(dec_err)?.to_vec()),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::SnapshotChunk {
                hash: hash.ok_or(WireError::MissingField("hash"))?,
                index: index.ok_or(WireError::MissingField("index"))?,
                count: count.ok_or(WireError::MissingField("count"))?,
                data: data.ok_or(WireError::MissingField("data"))?,
            })
        }
        6 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut hash = None;
            let mut peer = None;
            let mut sig = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => hash = Some(get_hash(body.d)?),
                    2 => {
                        let s = body.d.str().map_err(dec_err)?;
                        peer = Some(PeerId::parse(s).map_err(dec_err)?);
                    }
                    3 => sig = Some(body.d.bytes().map_err(dec_err)?.to_vec()),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::EventAck {
                hash: hash.ok_or(WireError::MissingField("hash"))?,
                peer: peer.ok_or(WireError::MissingField("peer"))?,
                sig: sig.ok_or(WireError::MissingField("sig"))?,
            })
        }
        7 | 8 | 9 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut payload = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => payload = Some(body.d.bytes().map_err(dec_err)?.to_vec()),
                    _ => body.skip_value()?,
                }
            }
            let payload = payload.ok_or(WireError::MissingField("payload"))?;
            Ok(match kind {
                7 => Message::PowTicket { ticket: payload },
                8 => Message::StakeProof { proof: payload },
                _ => Message::Rotation { record: payload },
            })
        }
        10 => {
            let mut body = BodyReader::open(&mut d)?;
            let mut hash = None;
            let mut code = None;
            while let Some(key) = body.next_key()? {
                match key {
                    1 => hash = Some(get_hash(body.d)?),
                    2 => code = Some(body.d.str().map_err(dec_err)?.to_string()),
                    _ => body.skip_value()?,
                }
            }
            Ok(Message::Reject {
                hash: hash.ok_or(WireError::MissingField("hash"))?,
                code: code.ok_or(WireError::MissingField("code"))?,
            })
        }
        other => Err(WireError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sha256;

    fn hash(n: u8) -> EventHash {
        EventHash::from_bytes(sha256(&[n]))
    }

    fn roundtrip(msg: Message) {
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn all_kinds_roundtrip() {
        roundtrip(Message::GossipEvent {
            event: b"{\"v\":1}".to_vec(),
        });
        roundtrip(Message::RangeRequest {
            from: None,
            limit: 100,
        });
        roundtrip(Message::RangeRequest {
            from: Some(hash(1)),
            limit: 512,
        });
        roundtrip(Message::RangeResponse {
            events: vec![b"a".to_vec(), b"b".to_vec()],
            cursor: Some(hash(2)),
            has_more: true,
        });
        roundtrip(Message::SnapshotRequest { hash: None });
        roundtrip(Message::SnapshotChunk {
            hash: hash(3),
            index: 0,
            count: 4,
            data: vec![0xab; 64],
        });
        roundtrip(Message::EventAck {
            hash: hash(4),
            peer: PeerId::from_public_key(&[7u8; 32]),
            sig: vec![0x5a; 64],
        });
        roundtrip(Message::PowTicket {
            ticket: b"{}".to_vec(),
        });
        roundtrip(Message::Reject {
            hash: hash(5),
            code: "resource_conflict".to_string(),
        });
    }

    #[test]
    fn unknown_body_keys_are_skipped() {
        // GossipEvent body with an extra field a newer peer might add.
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(2).unwrap();
        e.u32(1).unwrap();
        e.map(2).unwrap();
        e.u32(1).unwrap();
        e.bytes(b"event-bytes").unwrap();
        e.u32(9).unwrap();
        e.str("from-the-future").unwrap();

        let msg = decode_message(&buf).unwrap();
        assert_eq!(
            msg,
            Message::GossipEvent {
                event: b"event-bytes".to_vec()
            }
        );
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(2).unwrap();
        e.u32(1).unwrap();
        e.map(2).unwrap();
        e.u32(1).unwrap();
        e.bytes(b"first").unwrap();
        e.u32(1).unwrap();
        e.bytes(b"second").unwrap();

        assert!(matches!(
            decode_message(&buf),
            Err(WireError::DuplicateField(1))
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(2).unwrap();
        e.u32(99).unwrap();
        e.map(0).unwrap();
        assert!(matches!(
            decode_message(&buf),
            Err(WireError::UnknownKind(99))
        ));
    }

    #[test]
    fn missing_required_field_rejected() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(2).unwrap();
        e.u32(2).unwrap();
        e.map(0).unwrap();
        assert!(matches!(
            decode_message(&buf),
            Err(WireError::MissingField("limit"))
        ));
    }

    #[test]
    fn relay_preserves_received_bytes() {
        // Encode with an unknown extra field, decode, and relay: the extra
        // field must survive byte-for-byte.
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(2).unwrap();
        e.u32(1).unwrap();
        e.map(2).unwrap();
        e.u32(1).unwrap();
        e.bytes(b"event-bytes").unwrap();
        e.u32(15).unwrap();
        e.u64(42).unwrap();

        let wire = WireMessage::decode(&buf).unwrap();
        assert_eq!(wire.relay_bytes().unwrap().as_ref(), buf.as_slice());

        // A locally built message encodes without the unknown field.
        let local = WireMessage::new(wire.msg.clone());
        assert_ne!(local.relay_bytes().unwrap().as_ref(), buf.as_slice());
    }
}
