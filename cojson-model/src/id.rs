//! Typed identifiers with stable textual forms
//!
//! All IDs are opaque fixed-width tokens with a kind prefix and a
//! base58 payload. The textual form is the interop surface: group
//! content, wire messages, and storage sidecars all carry IDs as
//! strings, so every type here serializes via `Display`/`FromStr`.

use crate::types::{Hash, SealingPub, SigningPub};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing a textual identifier
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdParseError {
    #[error("missing prefix: expected {0}")]
    MissingPrefix(&'static str),

    #[error("invalid base58 payload")]
    InvalidBase58,

    #[error("invalid payload length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("malformed composite id: {0}")]
    Malformed(&'static str),
}

fn decode_b58<const N: usize>(s: &str) -> Result<[u8; N], IdParseError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_| IdParseError::InvalidBase58)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| IdParseError::InvalidLength { expected: N, got })
}

macro_rules! string_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// CoValue IDs
// ---------------------------------------------------------------------------

/// Identity of a CoValue: the hash of its canonical header encoding.
///
/// Textual form `co_z<base58>`. Accounts and groups are CoValues, so
/// account IDs share this form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoId(pub Hash);

impl CoId {
    pub const PREFIX: &'static str = "co_z";

    pub fn hash(&self) -> &Hash {
        &self.0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0.to_b58())
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", self)
    }
}

impl FromStr for CoId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s
            .strip_prefix(Self::PREFIX)
            .ok_or(IdParseError::MissingPrefix(Self::PREFIX))?;
        Ok(CoId(Hash(decode_b58::<32>(payload)?)))
    }
}

string_serde!(CoId);

/// Accounts are CoValues; an account ID is a CoValue ID.
pub type AccountId = CoId;

// ---------------------------------------------------------------------------
// Agent IDs
// ---------------------------------------------------------------------------

/// A raw keypair principal that is not (or not yet) an account CoValue.
///
/// Used for invite principals and account bootstrap, where the verifying
/// key must be locatable from the ID alone. Textual form
/// `sealer_z<base58>/signer_z<base58>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub sealing: SealingPub,
    pub signing: SigningPub,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sealer_z{}/signer_z{}",
            self.sealing.to_b58(),
            self.signing.to_b58()
        )
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self)
    }
}

impl FromStr for AgentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or(IdParseError::Malformed("expected sealer/signer parts"))?;
        let sealer = sealer
            .strip_prefix("sealer_z")
            .ok_or(IdParseError::MissingPrefix("sealer_z"))?;
        let signer = signer
            .strip_prefix("signer_z")
            .ok_or(IdParseError::MissingPrefix("signer_z"))?;
        Ok(AgentId {
            sealing: SealingPub(decode_b58::<32>(sealer)?),
            signing: SigningPub(decode_b58::<32>(signer)?),
        })
    }
}

string_serde!(AgentId);

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// The principal that owns a session and signs its chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum SessionOwner {
    /// An account CoValue; its signing key is found in its content.
    Account(AccountId),
    /// A raw agent; its signing key is embedded in the ID.
    Agent(AgentId),
}

impl fmt::Display for SessionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOwner::Account(id) => write!(f, "{}", id),
            SessionOwner::Agent(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for SessionOwner {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(CoId::PREFIX) {
            Ok(SessionOwner::Account(s.parse()?))
        } else {
            Ok(SessionOwner::Agent(s.parse()?))
        }
    }
}

/// A single-writer append context: `(owner, session counter)`.
///
/// Each device or tab picks a fresh counter at startup. The owner is
/// embedded so that given a session ID, the verifying key is locatable.
/// Textual form `<owner>_session_z<base58 counter>`.
///
/// Ordering is by `(owner, counter)`, which is the deterministic
/// tie-break used by causal keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SessionId {
    pub owner: SessionOwner,
    pub counter: u64,
}

impl SessionId {
    pub fn new(owner: SessionOwner, counter: u64) -> Self {
        Self { owner, counter }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_session_z{}",
            self.owner,
            bs58::encode(&self.counter.to_be_bytes()).into_string()
        )
    }
}

impl FromStr for SessionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, counter) = s
            .rsplit_once("_session_z")
            .ok_or(IdParseError::Malformed("expected _session_z separator"))?;
        let counter = u64::from_be_bytes(decode_b58::<8>(counter)?);
        Ok(SessionId {
            owner: owner.parse()?,
            counter,
        })
    }
}

string_serde!(SessionId);

// ---------------------------------------------------------------------------
// Key epochs
// ---------------------------------------------------------------------------

/// Name of a symmetric key epoch within a group. Textual form
/// `key_z<base58>` over 12 random bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 12]);

impl KeyId {
    pub const PREFIX: &'static str = "key_z";
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self)
    }
}

impl FromStr for KeyId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s
            .strip_prefix(Self::PREFIX)
            .ok_or(IdParseError::MissingPrefix(Self::PREFIX))?;
        Ok(KeyId(decode_b58::<12>(payload)?))
    }
}

string_serde!(KeyId);

// ---------------------------------------------------------------------------
// Transactions and list positions
// ---------------------------------------------------------------------------

/// One transaction within a session: `(session, index)`.
/// Textual form `<session>_tx<index>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TransactionId {
    pub session: SessionId,
    pub index: u32,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_tx{}", self.session, self.index)
    }
}

impl FromStr for TransactionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, index) = s
            .rsplit_once("_tx")
            .ok_or(IdParseError::Malformed("expected _tx separator"))?;
        let index = index
            .parse()
            .map_err(|_| IdParseError::Malformed("bad transaction index"))?;
        Ok(TransactionId {
            session: session.parse()?,
            index,
        })
    }
}

string_serde!(TransactionId);

/// Stable position identifier for list CRDT operations.
///
/// One transaction may carry several insertions (a plaintext `ins` op
/// expands to a run of single characters), so the introducing
/// transaction ID is extended with the change offset within it.
/// Textual form `<session>_tx<index>_op<change>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct OpId {
    pub tx: TransactionId,
    pub change: u32,
}

impl OpId {
    pub fn new(tx: TransactionId, change: u32) -> Self {
        Self { tx, change }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_op{}", self.tx, self.change)
    }
}

impl FromStr for OpId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx, change) = s
            .rsplit_once("_op")
            .ok_or(IdParseError::Malformed("expected _op separator"))?;
        let change = change
            .parse()
            .map_err(|_| IdParseError::Malformed("bad change index"))?;
        Ok(OpId {
            tx: tx.parse()?,
            change,
        })
    }
}

string_serde!(OpId);

// ---------------------------------------------------------------------------
// Causal ordering
// ---------------------------------------------------------------------------

/// The place of a transaction in the deterministic cross-session order:
/// `(made_at ms, session, index)`, compared lexicographically.
///
/// This is not a vector clock. Concurrent writes are resolved by the
/// kind-specific CRDT; the timestamp only supplies a deterministic
/// tie-break, so correctness never depends on clock sync.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct CausalKey {
    pub made_at: u64,
    pub session: SessionId,
    pub index: u32,
}

impl CausalKey {
    pub fn new(made_at: u64, session: SessionId, index: u32) -> Self {
        Self {
            made_at,
            session,
            index,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        TransactionId {
            session: self.session,
            index: self.index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn co_id(byte: u8) -> CoId {
        CoId(Hash([byte; 32]))
    }

    fn session(byte: u8, counter: u64) -> SessionId {
        SessionId::new(SessionOwner::Account(co_id(byte)), counter)
    }

    #[test]
    fn test_co_id_roundtrip() {
        let id = co_id(0x5a);
        let text = id.to_string();
        assert!(text.starts_with("co_z"));
        assert_eq!(text.parse::<CoId>().unwrap(), id);
    }

    #[test]
    fn test_co_id_rejects_wrong_prefix() {
        assert_eq!(
            "key_zabc".parse::<CoId>(),
            Err(IdParseError::MissingPrefix("co_z"))
        );
    }

    #[test]
    fn test_co_id_rejects_wrong_length() {
        let short = format!("co_z{}", bs58::encode(&[1u8; 16]).into_string());
        assert!(matches!(
            short.parse::<CoId>(),
            Err(IdParseError::InvalidLength { expected: 32, .. })
        ));
    }

    #[test]
    fn test_agent_id_roundtrip() {
        let agent = AgentId {
            sealing: SealingPub([3; 32]),
            signing: SigningPub([4; 32]),
        };
        let text = agent.to_string();
        assert!(text.starts_with("sealer_z"));
        assert_eq!(text.parse::<AgentId>().unwrap(), agent);
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = session(0x11, 42);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);

        let agent_session = SessionId::new(
            SessionOwner::Agent(AgentId {
                sealing: SealingPub([9; 32]),
                signing: SigningPub([8; 32]),
            }),
            7,
        );
        let text = agent_session.to_string();
        assert_eq!(text.parse::<SessionId>().unwrap(), agent_session);
    }

    #[test]
    fn test_op_id_roundtrip() {
        let op = OpId::new(
            TransactionId {
                session: session(0x22, 3),
                index: 14,
            },
            2,
        );
        assert_eq!(op.to_string().parse::<OpId>().unwrap(), op);
    }

    #[test]
    fn test_key_id_roundtrip() {
        let key = KeyId([0xcd; 12]);
        assert_eq!(key.to_string().parse::<KeyId>().unwrap(), key);
    }

    #[test]
    fn test_causal_key_ordering() {
        let s1 = session(0x01, 1);
        let s2 = session(0x02, 1);

        // Timestamp dominates
        assert!(CausalKey::new(1, s2, 0) < CausalKey::new(2, s1, 0));
        // Session breaks timestamp ties
        assert!(CausalKey::new(1, s1, 5) < CausalKey::new(1, s2, 0));
        // Index breaks session ties
        assert!(CausalKey::new(1, s1, 0) < CausalKey::new(1, s1, 1));
    }

    #[test]
    fn test_serde_as_string() {
        let id = co_id(0x77);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: CoId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
