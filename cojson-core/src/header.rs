//! CoValue headers and content-addressed identity
//!
//! The header is the immutable half of a CoValue. Its canonical
//! encoding is hashed to form the CoValue's ID, so two structurally
//! identical creations still get distinct IDs through the uniqueness
//! nonce.

use cojson_model::{canonical_bytes, crypto, CoId};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from decoding a header's wire form
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderDecodeError {
    #[error("not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("unknown covalue type: {0}")]
    UnknownKind(String),

    #[error("unknown ruleset: {0}")]
    UnknownRuleset(String),
}

/// The concrete CRDT kind of a CoValue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoKind {
    Map,
    List,
    Stream,
    PlainText,
    Group,
    Account,
}

impl CoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoKind::Map => "comap",
            CoKind::List => "colist",
            CoKind::Stream => "costream",
            CoKind::PlainText => "coplaintext",
            CoKind::Group => "group",
            CoKind::Account => "account",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "comap" => Some(CoKind::Map),
            "colist" => Some(CoKind::List),
            "costream" => Some(CoKind::Stream),
            "coplaintext" => Some(CoKind::PlainText),
            "group" => Some(CoKind::Group),
            "account" => Some(CoKind::Account),
            _ => None,
        }
    }
}

/// How permissions are evaluated for a CoValue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ruleset {
    /// This CoValue is itself the permission root (groups, accounts).
    Group,
    /// Permissions delegated to the referenced group.
    OwnedByGroup(CoId),
    /// Public; used only for account bootstrapping.
    UnsafeAllowAll,
}

/// The immutable header of a CoValue. Hashing its canonical encoding
/// yields the CoValue's ID, which never changes.
#[derive(Clone, Debug, PartialEq)]
pub struct CoHeader {
    pub kind: CoKind,
    pub ruleset: Ruleset,
    /// Opaque static metadata; never interpreted by the core.
    pub meta: Option<Value>,
    /// Creator wall clock, advisory only.
    pub created_at: u64,
    /// Random nonce distinguishing structurally identical creations.
    pub uniqueness: [u8; 12],
}

impl CoHeader {
    pub fn new(kind: CoKind, ruleset: Ruleset, created_at: u64) -> Self {
        Self {
            kind,
            ruleset,
            meta: None,
            created_at,
            uniqueness: crypto::random_bytes(),
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// The content-addressed identity of this CoValue.
    pub fn id(&self) -> CoId {
        CoId(crypto::hash(&canonical_bytes(&self.to_value())))
    }

    pub fn to_value(&self) -> Value {
        let ruleset = match &self.ruleset {
            Ruleset::Group => json!({"type": "group"}),
            Ruleset::OwnedByGroup(group) => {
                json!({"type": "ownedByGroup", "group": group.to_string()})
            }
            Ruleset::UnsafeAllowAll => json!({"type": "unsafeAllowAll"}),
        };
        json!({
            "createdAt": self.created_at,
            "meta": self.meta.clone().unwrap_or(Value::Null),
            "ruleset": ruleset,
            "type": self.kind.as_str(),
            "uniqueness": bs58::encode(&self.uniqueness).into_string(),
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, HeaderDecodeError> {
        let obj = value.as_object().ok_or(HeaderDecodeError::NotAnObject)?;

        let kind_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(HeaderDecodeError::MissingField("type"))?;
        let kind = CoKind::from_str(kind_str)
            .ok_or_else(|| HeaderDecodeError::UnknownKind(kind_str.to_string()))?;

        let ruleset_obj = obj
            .get("ruleset")
            .and_then(Value::as_object)
            .ok_or(HeaderDecodeError::MissingField("ruleset"))?;
        let ruleset_type = ruleset_obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(HeaderDecodeError::MissingField("ruleset.type"))?;
        let ruleset = match ruleset_type {
            "group" => Ruleset::Group,
            "unsafeAllowAll" => Ruleset::UnsafeAllowAll,
            "ownedByGroup" => {
                let group = ruleset_obj
                    .get("group")
                    .and_then(Value::as_str)
                    .ok_or(HeaderDecodeError::MissingField("ruleset.group"))?
                    .parse()
                    .map_err(|_| HeaderDecodeError::InvalidField("ruleset.group"))?;
                Ruleset::OwnedByGroup(group)
            }
            other => return Err(HeaderDecodeError::UnknownRuleset(other.to_string())),
        };

        let created_at = obj
            .get("createdAt")
            .and_then(Value::as_u64)
            .ok_or(HeaderDecodeError::MissingField("createdAt"))?;

        let meta = match obj.get("meta") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };

        let uniqueness = obj
            .get("uniqueness")
            .and_then(Value::as_str)
            .ok_or(HeaderDecodeError::MissingField("uniqueness"))
            .and_then(|s| {
                bs58::decode(s)
                    .into_vec()
                    .map_err(|_| HeaderDecodeError::InvalidField("uniqueness"))
            })?
            .try_into()
            .map_err(|_| HeaderDecodeError::InvalidField("uniqueness"))?;

        Ok(Self {
            kind,
            ruleset,
            meta,
            created_at,
            uniqueness,
        })
    }

    /// The governing group for permission checks, if delegated.
    pub fn owner_group(&self) -> Option<&CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup(group) => Some(group),
            _ => None,
        }
    }
}

impl serde::Serialize for CoHeader {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for CoHeader {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CoHeader::from_value(&value).map_err(serde::de::Error::custom)
    }
}
