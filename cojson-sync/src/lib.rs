//! CoJSON sync protocol
//!
//! Ships sessions between peers. Each side advertises per-session
//! known state, compares, and streams content deltas; missing
//! dependencies are parked and retried; outbound queues are bounded
//! with KNOWN coalescing and CONTENT fragmenting. There is no global
//! clock: convergence follows from every replica eventually holding
//! the same transaction sets.

pub mod message;
pub mod peer;

pub use message::{drain_frames, FrameError, SyncMessage};
pub use peer::{
    diff_known, DependencyBuffer, KnownDiff, OutboundQueue, PeerState, MAX_TXS_PER_CONTENT,
    OUTBOUND_HIGH_WATER,
};
