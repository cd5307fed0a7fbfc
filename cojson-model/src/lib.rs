//! Shared model types for the CoJSON engine
//!
//! Everything the other crates agree on lives here: fixed-size byte
//! newtypes, typed identifiers with stable textual forms, the narrow
//! crypto provider, the canonical JSON encoding, and local account
//! identity.

pub mod canon;
pub mod crypto;
pub mod id;
pub mod identity;
pub mod types;

pub use canon::canonical_bytes;
pub use crypto::{CryptoError, SealingKeypair, SigningKeypair, SymKey};
pub use id::{AgentId, CausalKey, CoId, KeyId, OpId, SessionId, TransactionId};
pub use identity::AgentSecret;
pub use types::{ByteTokenError, Hash, SealingPub, ShortHash, Signature, SigningPub};
