//! CoStream: per-session append-only feeds
//!
//! Streams have no cross-session merge: the view is, for each session,
//! the ordered list of its entries. Binary streams are streams whose
//! entries frame opaque chunks between `start`/`end` markers within a
//! single session.

use cojson_model::id::SessionOwner;
use cojson_model::{CausalKey, SessionId};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// One entry in a session's feed.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamItem {
    pub at: CausalKey,
    pub value: Value,
}

/// Materialized view of a CoStream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamView {
    sessions: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl StreamView {
    /// Fold transactions (already sorted by causal key) into the view.
    pub fn fold<'a>(txs: impl Iterator<Item = (CausalKey, &'a [Value])>) -> Self {
        let mut view = StreamView::default();
        for (at, changes) in txs {
            view.apply(at, changes);
        }
        view
    }

    pub fn apply(&mut self, at: CausalKey, changes: &[Value]) {
        let feed = self.sessions.entry(at.session).or_default();
        for change in changes {
            feed.push(StreamItem {
                at,
                value: change.clone(),
            });
        }
    }

    /// The ordered feed of one session.
    pub fn per_session(&self, session: &SessionId) -> &[StreamItem] {
        self.sessions
            .get(session)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All sessions that have written to this stream.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.keys()
    }

    /// The most recent entry of one session.
    pub fn latest_of(&self, session: &SessionId) -> Option<&StreamItem> {
        self.sessions.get(session).and_then(|feed| feed.last())
    }

    /// The most recent entry per owner (account or agent), picking the
    /// causally latest across all of that owner's sessions.
    pub fn latest_per_owner(&self) -> BTreeMap<SessionOwner, &StreamItem> {
        let mut latest: BTreeMap<SessionOwner, &StreamItem> = BTreeMap::new();
        for (session, feed) in &self.sessions {
            if let Some(item) = feed.last() {
                latest
                    .entry(session.owner)
                    .and_modify(|current| {
                        if item.at > current.at {
                            *current = item;
                        }
                    })
                    .or_insert(item);
            }
        }
        latest
    }

    /// Every entry across all sessions, in causal order.
    pub fn all(&self) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self.sessions.values().flatten().collect();
        items.sort_by_key(|item| item.at);
        items
    }

    /// Reassemble the most recent complete binary payload written by a
    /// session: `push` chunks between a matched `start`/`end` pair.
    pub fn binary_chunks(&self, session: &SessionId) -> Option<Vec<u8>> {
        let feed = self.sessions.get(session)?;
        let mut current: Option<Vec<u8>> = None;
        let mut complete: Option<Vec<u8>> = None;

        for item in feed {
            match BinOp::from_value(&item.value) {
                Some(BinOp::Start) => current = Some(Vec::new()),
                Some(BinOp::Push(chunk)) => {
                    if let Some(buf) = current.as_mut() {
                        buf.extend_from_slice(&chunk);
                    }
                }
                Some(BinOp::End) => {
                    if let Some(buf) = current.take() {
                        complete = Some(buf);
                    }
                }
                None => {}
            }
        }
        complete
    }
}

/// Binary stream framing ops.
#[derive(Clone, Debug, PartialEq)]
pub enum BinOp {
    Start,
    Push(Vec<u8>),
    End,
}

impl BinOp {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("op")?.as_str()? {
            "start" => Some(BinOp::Start),
            "end" => Some(BinOp::End),
            "push" => {
                let chunk = bs58::decode(obj.get("chunk")?.as_str()?).into_vec().ok()?;
                Some(BinOp::Push(chunk))
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            BinOp::Start => json!({"op": "start"}),
            BinOp::End => json!({"op": "end"}),
            BinOp::Push(chunk) => {
                json!({"op": "push", "chunk": bs58::encode(chunk).into_string()})
            }
        }
    }
}
