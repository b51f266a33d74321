//! Persistence: the key-value boundary, the append-only event log, and
//! startup recovery.

pub mod kv;
pub mod log;
pub mod recovery;

pub use kv::{KvError, KvStore, MemoryKv};
pub use log::{EventLog, LogError, RangePage};
pub use recovery::{recover, RecoveryReport};
