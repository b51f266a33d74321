#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod p2p;
pub mod pipeline;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod wire;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    Did, Envelope, EnvelopeDraft, EnvelopeError, EventHash, EventType, KeyHandle, Limits, PeerId,
    RotationPolicy,
};
pub use crate::pipeline::{
    EventSink, IngestOutcome, RejectReason, SchemaRegistry, ValidationPipeline,
};
