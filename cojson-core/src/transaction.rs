//! Transactions: the atomic unit of change
//!
//! One transaction is one atomic write to a CoValue from one session.
//! Its canonical JSON form is the input to chain hashing, so the field
//! layout here is part of the interop surface. Payloads are either
//! trusting (plaintext change list) or private (change list sealed
//! under a group key epoch).

use cojson_model::crypto::{self, CryptoError, SymKey, NONCE_LEN};
use cojson_model::{canonical_bytes, KeyId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from decoding a transaction's wire form
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxDecodeError {
    #[error("not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("unknown privacy level: {0}")]
    UnknownPrivacy(String),
}

/// The payload of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum TxBody {
    /// Changes stored as plaintext JSON.
    Trusting { changes: Vec<Value> },
    /// Changes sealed under a group symmetric key epoch.
    Private {
        key_used: KeyId,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    },
}

/// One atomic write in one session.
///
/// `made_at` is the writer's wall clock in milliseconds. It is never
/// used for intra-session ordering, only as the first component of the
/// deterministic cross-session tie-break.
#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub made_at: u64,
    pub body: TxBody,
}

impl Transaction {
    /// Build a trusting (plaintext) transaction.
    pub fn trusting(made_at: u64, changes: Vec<Value>) -> Self {
        Self {
            made_at,
            body: TxBody::Trusting { changes },
        }
    }

    /// Build a private transaction by sealing `changes` under `key`.
    pub fn private(
        made_at: u64,
        key_used: KeyId,
        key: &SymKey,
        changes: &[Value],
    ) -> Result<Self, CryptoError> {
        let nonce = crypto::random_bytes::<NONCE_LEN>();
        let plaintext = canonical_bytes(&Value::Array(changes.to_vec()));
        let ciphertext = crypto::encrypt(key, &nonce, &plaintext)?;
        Ok(Self {
            made_at,
            body: TxBody::Private {
                key_used,
                nonce,
                ciphertext,
            },
        })
    }

    /// Decrypt a private payload back into its change list.
    /// Fails with `CryptoError` on tamper or wrong key; the caller
    /// treats that as "transaction invalid".
    pub fn decrypt_changes(&self, key: &SymKey) -> Result<Vec<Value>, CryptoError> {
        match &self.body {
            TxBody::Trusting { changes } => Ok(changes.clone()),
            TxBody::Private {
                nonce, ciphertext, ..
            } => {
                let plaintext = crypto::decrypt(key, nonce, ciphertext)?;
                match serde_json::from_slice(&plaintext) {
                    Ok(Value::Array(changes)) => Ok(changes),
                    _ => Err(CryptoError::DecryptFailed),
                }
            }
        }
    }

    /// The key epoch a private payload was sealed under.
    pub fn key_used(&self) -> Option<&KeyId> {
        match &self.body {
            TxBody::Trusting { .. } => None,
            TxBody::Private { key_used, .. } => Some(key_used),
        }
    }

    /// Wire/JSON form of this transaction.
    pub fn to_value(&self) -> Value {
        match &self.body {
            TxBody::Trusting { changes } => json!({
                "changes": changes,
                "madeAt": self.made_at,
                "privacy": "trusting",
            }),
            TxBody::Private {
                key_used,
                nonce,
                ciphertext,
            } => json!({
                "encrypted": bs58::encode(ciphertext).into_string(),
                "keyUsed": key_used.to_string(),
                "madeAt": self.made_at,
                "nonce": bs58::encode(nonce).into_string(),
                "privacy": "private",
            }),
        }
    }

    /// Parse the wire/JSON form.
    pub fn from_value(value: &Value) -> Result<Self, TxDecodeError> {
        let obj = value.as_object().ok_or(TxDecodeError::NotAnObject)?;
        let made_at = obj
            .get("madeAt")
            .ok_or(TxDecodeError::MissingField("madeAt"))?
            .as_u64()
            .ok_or(TxDecodeError::InvalidField("madeAt"))?;
        let privacy = obj
            .get("privacy")
            .ok_or(TxDecodeError::MissingField("privacy"))?
            .as_str()
            .ok_or(TxDecodeError::InvalidField("privacy"))?;

        let body = match privacy {
            "trusting" => {
                let changes = obj
                    .get("changes")
                    .ok_or(TxDecodeError::MissingField("changes"))?
                    .as_array()
                    .ok_or(TxDecodeError::InvalidField("changes"))?
                    .clone();
                TxBody::Trusting { changes }
            }
            "private" => {
                let key_used = obj
                    .get("keyUsed")
                    .and_then(Value::as_str)
                    .ok_or(TxDecodeError::MissingField("keyUsed"))?
                    .parse()
                    .map_err(|_| TxDecodeError::InvalidField("keyUsed"))?;
                let nonce_bytes = obj
                    .get("nonce")
                    .and_then(Value::as_str)
                    .ok_or(TxDecodeError::MissingField("nonce"))
                    .and_then(|s| {
                        bs58::decode(s)
                            .into_vec()
                            .map_err(|_| TxDecodeError::InvalidField("nonce"))
                    })?;
                let nonce: [u8; NONCE_LEN] = nonce_bytes
                    .try_into()
                    .map_err(|_| TxDecodeError::InvalidField("nonce"))?;
                let ciphertext = obj
                    .get("encrypted")
                    .and_then(Value::as_str)
                    .ok_or(TxDecodeError::MissingField("encrypted"))
                    .and_then(|s| {
                        bs58::decode(s)
                            .into_vec()
                            .map_err(|_| TxDecodeError::InvalidField("encrypted"))
                    })?;
                TxBody::Private {
                    key_used,
                    nonce,
                    ciphertext,
                }
            }
            other => return Err(TxDecodeError::UnknownPrivacy(other.to_string())),
        };

        Ok(Self { made_at, body })
    }

    /// Canonical bytes of this transaction: the chain-hash input.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.to_value())
    }
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Transaction::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusting_roundtrip() {
        let tx = Transaction::trusting(
            1_700_000_000_123,
            vec![json!({"op": "set", "key": "title", "value": "notes"})],
        );
        let value = tx.to_value();
        assert_eq!(Transaction::from_value(&value).unwrap(), tx);
    }

    #[test]
    fn test_canonical_bytes_roundtrip() {
        let tx = Transaction::trusting(5, vec![json!({"op": "del", "key": "x"})]);
        let bytes = tx.canonical_bytes();
        let decoded: Value = serde_json::from_slice(&bytes).unwrap();
        let back = Transaction::from_value(&decoded).unwrap();
        assert_eq!(back.canonical_bytes(), bytes);
    }

    #[test]
    fn test_private_roundtrip() {
        let key = SymKey::generate();
        let key_id = KeyId([1; 12]);
        let changes = vec![json!({"op": "set", "key": "secret", "value": 42})];

        let tx = Transaction::private(99, key_id, &key, &changes).unwrap();
        assert_eq!(tx.key_used(), Some(&key_id));
        assert_eq!(tx.decrypt_changes(&key).unwrap(), changes);

        // Wire roundtrip preserves the ciphertext exactly
        let back = Transaction::from_value(&tx.to_value()).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.decrypt_changes(&key).unwrap(), changes);
    }

    #[test]
    fn test_private_wrong_key_fails() {
        let key = SymKey::generate();
        let other = SymKey::generate();
        let tx =
            Transaction::private(1, KeyId([2; 12]), &key, &[json!({"op": "del", "key": "k"})])
                .unwrap();
        assert!(tx.decrypt_changes(&other).is_err());
    }

    #[test]
    fn test_rejects_unknown_privacy() {
        let value = json!({"madeAt": 1, "privacy": "mystery"});
        assert_eq!(
            Transaction::from_value(&value),
            Err(TxDecodeError::UnknownPrivacy("mystery".into()))
        );
    }

    #[test]
    fn test_rejects_missing_fields() {
        let value = json!({"privacy": "trusting"});
        assert_eq!(
            Transaction::from_value(&value),
            Err(TxDecodeError::MissingField("madeAt"))
        );
    }
}
