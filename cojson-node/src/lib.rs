//! CoJSON local node
//!
//! A node binds an agent identity, a storage backend, and a set of peer
//! channels into one process-local registry of CoValues. Applications
//! create or load CoValues, read their materialized views through typed
//! handles, and append writes that replicate to every connected peer.

pub mod handle;
pub mod node;
pub mod runner;

pub use handle::{GroupHandle, ListHandle, MapHandle, StreamHandle, TextHandle};
pub use node::{LocalNode, NodeError, PeerId};
pub use runner::{channel_pair, run_peer, PeerChannel};
