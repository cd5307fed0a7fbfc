//! Pluggable durability below the node
//!
//! Storage holds headers and per-(CoValue, session) transaction runs
//! with the latest signature per session. The contract is monotonic
//! durability: once a write returns success a subsequent read reflects
//! it; a crash may lose unacknowledged writes but never a prefix.

mod file;
mod mem;

pub use file::FileStorage;
pub use mem::MemStorage;

use cojson_core::{CoHeader, SessionLog, Transaction};
use cojson_model::{CoId, SessionId, Signature};
use thiserror::Error;

/// Errors from a storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt record in {0}")]
    CorruptRecord(String),

    #[error("unknown covalue: {0}")]
    UnknownCoValue(CoId),
}

/// A CoValue as read back from storage.
pub struct StoredCoValue {
    pub header: CoHeader,
    pub sessions: Vec<SessionLog>,
}

/// The durability interface consumed by the node.
pub trait Storage: Send {
    /// Persist a CoValue's header. Idempotent.
    fn write_header(&mut self, id: &CoId, header: &CoHeader) -> Result<(), StorageError>;

    /// Append transactions for one session, atomically with respect to
    /// crashes, and record the session's latest signature.
    fn write_transactions(
        &mut self,
        id: &CoId,
        session: &SessionId,
        after: u32,
        txs: &[Transaction],
        signature: &Signature,
    ) -> Result<(), StorageError>;

    /// Read a CoValue's header and sessions, or `None` if unknown.
    fn read_co_value(&mut self, id: &CoId) -> Result<Option<StoredCoValue>, StorageError>;

    /// All CoValue IDs present, for startup repopulation.
    fn list_co_values(&mut self) -> Result<Vec<CoId>, StorageError>;
}
