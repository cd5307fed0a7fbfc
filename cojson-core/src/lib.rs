//! CoJSON engine core
//!
//! Causally-consistent, cryptographically-authenticated CRDTs over
//! JSON-shaped state. Each CoValue is an immutable header plus a set of
//! per-session hash-chained transaction logs; views are deterministic
//! folds over the validated, decrypted transactions, so replicas that
//! hold the same transaction sets materialize identical state.

pub mod colist;
pub mod comap;
pub mod coplaintext;
pub mod core;
pub mod costream;
pub mod group;
pub mod header;
pub mod session;
pub mod transaction;

pub use crate::core::{
    CoContext, CoUpdate, CoValueCore, CoView, IngestError, KnownState, SessionNewContent,
    StaticContext,
};
pub use colist::{Anchor, ListOp, ListView};
pub use comap::{MapOp, MapView};
pub use coplaintext::TextView;
pub use costream::{BinOp, StreamView};
pub use group::{GroupResolver, GroupView, Member, Role};
pub use header::{CoHeader, CoKind, Ruleset};
pub use session::{AppendOutcome, SessionLog, SessionLogError};
pub use transaction::{Transaction, TxBody, TxDecodeError};
