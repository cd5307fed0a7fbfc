//! In-memory storage backend for tests and ephemeral nodes

use crate::{Storage, StorageError, StoredCoValue};
use cojson_core::{CoHeader, SessionLog, Transaction};
use cojson_model::{CoId, SessionId, Signature};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct MemCoValue {
    header: Option<CoHeader>,
    sessions: HashMap<SessionId, (Vec<Transaction>, Signature)>,
}

/// Volatile storage with the same semantics as the file backend.
#[derive(Default)]
pub struct MemStorage {
    values: HashMap<CoId, MemCoValue>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn write_header(&mut self, id: &CoId, header: &CoHeader) -> Result<(), StorageError> {
        self.values.entry(*id).or_default().header = Some(header.clone());
        Ok(())
    }

    fn write_transactions(
        &mut self,
        id: &CoId,
        session: &SessionId,
        after: u32,
        txs: &[Transaction],
        signature: &Signature,
    ) -> Result<(), StorageError> {
        let value = self.values.entry(*id).or_default();
        let (stored, sig) = value
            .sessions
            .entry(*session)
            .or_insert_with(|| (Vec::new(), *signature));

        // Append only what extends the stored run; redelivery is a no-op.
        let have = stored.len() as u32;
        if after <= have {
            let skip = (have - after) as usize;
            if skip < txs.len() {
                stored.extend_from_slice(&txs[skip..]);
            }
            *sig = *signature;
        }
        Ok(())
    }

    fn read_co_value(&mut self, id: &CoId) -> Result<Option<StoredCoValue>, StorageError> {
        let Some(value) = self.values.get(id) else {
            return Ok(None);
        };
        let Some(header) = value.header.clone() else {
            return Ok(None);
        };

        let sessions = value
            .sessions
            .iter()
            .map(|(session, (txs, sig))| {
                let mut signatures = BTreeMap::new();
                signatures.insert(txs.len() as u32, *sig);
                SessionLog::rehydrate(*session, txs.clone(), signatures)
            })
            .collect();

        Ok(Some(StoredCoValue { header, sessions }))
    }

    fn list_co_values(&mut self) -> Result<Vec<CoId>, StorageError> {
        Ok(self
            .values
            .iter()
            .filter(|(_, v)| v.header.is_some())
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_core::{CoKind, Ruleset};
    use cojson_model::id::{SessionOwner, SessionId};
    use cojson_model::{AgentSecret, Hash};
    use serde_json::json;

    #[test]
    fn test_roundtrip() {
        let agent = AgentSecret::generate();
        let header = CoHeader::new(CoKind::Map, Ruleset::UnsafeAllowAll, 1);
        let id = header.id();
        let session = SessionId::new(SessionOwner::Agent(agent.id()), 1);

        let mut log = SessionLog::new(session);
        let sig = log.append_local(
            &[Transaction::trusting(1, vec![json!({"op": "set", "key": "k", "value": 1})])],
            agent.signing(),
        );

        let mut storage = MemStorage::new();
        storage.write_header(&id, &header).unwrap();
        storage
            .write_transactions(&id, &session, 0, log.transactions(), &sig)
            .unwrap();

        let stored = storage.read_co_value(&id).unwrap().unwrap();
        assert_eq!(stored.header, header);
        assert_eq!(stored.sessions.len(), 1);
        assert_eq!(stored.sessions[0].last_hash(), log.last_hash());
        assert_eq!(storage.list_co_values().unwrap(), vec![id]);
    }

    #[test]
    fn test_unknown_covalue_is_none() {
        let mut storage = MemStorage::new();
        let id = CoId(Hash([9; 32]));
        assert!(storage.read_co_value(&id).unwrap().is_none());
    }
}
