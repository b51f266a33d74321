//! Peer-to-peer layer: admission control, peer scoring, and replication.

pub mod admission;
pub mod score;
pub mod sync;

pub use admission::{AdmissionError, PeerRotation, PowTicket, StakeLookup, StakeProof};
pub use score::{Observation, ScoreBook, Standing};
pub use sync::{
    AdmissionPolicy, PullStats, SyncClient, SyncServer, Transport, TransportError,
};
