//! CoList: RGA-style ordered insertions with tombstones
//!
//! Every inserted element gets a stable position identifier (the
//! introducing transaction ID extended with the element offset within
//! that transaction). Insertions anchor after or before an existing
//! position, `start`, or `end`. Concurrent insertions at the same
//! anchor converge because after-children emit newest-first and
//! before-children oldest-first, both by the deterministic causal
//! order. Deleted positions are tombstoned but stay addressable.

use cojson_model::{CausalKey, OpId};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Where an insertion attaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    Start,
    End,
    Pos(OpId),
}

impl Anchor {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "start" => Some(Anchor::Start),
            "end" => Some(Anchor::End),
            s => s.parse().ok().map(Anchor::Pos),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Anchor::Start => json!("start"),
            Anchor::End => json!("end"),
            Anchor::Pos(id) => json!(id.to_string()),
        }
    }
}

/// A decoded CoList change.
#[derive(Clone, Debug, PartialEq)]
pub enum ListOp {
    /// Insert one element logically after the anchor.
    App { after: Anchor, value: Value },
    /// Insert one element logically before the anchor.
    Pre { before: Anchor, value: Value },
    /// Tombstone a position.
    Del { pos: OpId },
    /// Plain-text compression: a contiguous run of single-character
    /// insertions, the first after the anchor and each subsequent one
    /// after its predecessor in the run.
    Ins { after: Anchor, text: String },
}

impl ListOp {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("op")?.as_str()? {
            "app" => Some(ListOp::App {
                after: Anchor::from_value(obj.get("after")?)?,
                value: obj.get("value")?.clone(),
            }),
            "pre" => Some(ListOp::Pre {
                before: Anchor::from_value(obj.get("before")?)?,
                value: obj.get("value")?.clone(),
            }),
            "del" => Some(ListOp::Del {
                pos: obj.get("pos")?.as_str()?.parse().ok()?,
            }),
            "ins" => Some(ListOp::Ins {
                after: Anchor::from_value(obj.get("after")?)?,
                text: obj.get("text")?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ListOp::App { after, value } => {
                json!({"op": "app", "after": after.to_value(), "value": value})
            }
            ListOp::Pre { before, value } => {
                json!({"op": "pre", "before": before.to_value(), "value": value})
            }
            ListOp::Del { pos } => json!({"op": "del", "pos": pos.to_string()}),
            ListOp::Ins { after, text } => {
                json!({"op": "ins", "after": after.to_value(), "text": text})
            }
        }
    }

    pub fn app(after: Anchor, value: Value) -> Value {
        ListOp::App { after, value }.to_value()
    }

    pub fn pre(before: Anchor, value: Value) -> Value {
        ListOp::Pre { before, value }.to_value()
    }

    pub fn del(pos: OpId) -> Value {
        ListOp::Del { pos }.to_value()
    }

    pub fn ins(after: Anchor, text: impl Into<String>) -> Value {
        ListOp::Ins {
            after,
            text: text.into(),
        }
        .to_value()
    }
}

/// Sort key for sibling ordering: the causal key of the introducing
/// transaction, extended with the element offset within it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct OpSort(CausalKey, u32);

struct Node {
    id: OpId,
    sort: OpSort,
    value: Value,
    deleted: bool,
    after_children: Vec<usize>,
    before_children: Vec<usize>,
}

/// Materialized RGA view of a CoList.
pub struct ListView {
    nodes: Vec<Node>,
    by_id: HashMap<OpId, usize>,
    start_before: Vec<usize>,
    start_after: Vec<usize>,
    end_before: Vec<usize>,
    end_after: Vec<usize>,
    /// DFS order over all nodes, tombstones included.
    order: Vec<usize>,
}

impl Default for ListView {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            by_id: HashMap::new(),
            start_before: Vec::new(),
            start_after: Vec::new(),
            end_before: Vec::new(),
            end_after: Vec::new(),
            order: Vec::new(),
        }
    }
}

impl ListView {
    /// Fold transactions (already sorted by causal key) into the view.
    pub fn fold<'a>(txs: impl Iterator<Item = (CausalKey, &'a [Value])>) -> Self {
        let mut view = ListView::default();
        for (at, changes) in txs {
            view.apply(at, changes);
        }
        view.finalize();
        view
    }

    fn apply(&mut self, at: CausalKey, changes: &[Value]) {
        // Element offsets count inserted elements across the whole
        // transaction, so expanded text runs and later changes never
        // collide.
        let mut offset: u32 = 0;
        for change in changes {
            match ListOp::from_value(change) {
                Some(ListOp::App { after, value }) => {
                    self.insert(at, &mut offset, after, value, false);
                }
                Some(ListOp::Pre { before, value }) => {
                    self.insert(at, &mut offset, before, value, true);
                }
                Some(ListOp::Del { pos }) => {
                    // An unknown position refers to a transaction this
                    // replica does not consider valid; skip.
                    if let Some(&idx) = self.by_id.get(&pos) {
                        self.nodes[idx].deleted = true;
                    }
                }
                Some(ListOp::Ins { after, text }) => {
                    let mut anchor = after;
                    for ch in text.chars() {
                        let id = self.insert(
                            at,
                            &mut offset,
                            anchor,
                            Value::String(ch.to_string()),
                            false,
                        );
                        anchor = Anchor::Pos(id);
                    }
                }
                None => {}
            }
        }
    }

    fn insert(
        &mut self,
        at: CausalKey,
        offset: &mut u32,
        anchor: Anchor,
        value: Value,
        before: bool,
    ) -> OpId {
        let id = OpId::new(at.tx_id(), *offset);
        *offset += 1;

        let idx = self.nodes.len();
        self.nodes.push(Node {
            id,
            sort: OpSort(at, id.change),
            value,
            deleted: false,
            after_children: Vec::new(),
            before_children: Vec::new(),
        });
        self.by_id.insert(id, idx);

        let bucket = match (anchor, before) {
            (Anchor::Start, false) => &mut self.start_after,
            (Anchor::Start, true) => &mut self.start_before,
            (Anchor::End, false) => &mut self.end_after,
            (Anchor::End, true) => &mut self.end_before,
            (Anchor::Pos(pos), before) => match self.by_id.get(&pos) {
                Some(&parent) if parent != idx => {
                    if before {
                        &mut self.nodes[parent].before_children
                    } else {
                        &mut self.nodes[parent].after_children
                    }
                }
                // Anchor introduced by a transaction we do not hold as
                // valid: fall back to the head, deterministically.
                _ => &mut self.start_after,
            },
        };
        bucket.push(idx);
        id
    }

    /// Compute the DFS order: before-children oldest-first ahead of a
    /// node, after-children newest-first behind it.
    fn finalize(&mut self) {
        fn emit(nodes: &[Node], order: &mut Vec<usize>, idx: usize) {
            let mut before = nodes[idx].before_children.clone();
            before.sort_by_key(|&i| nodes[i].sort);
            for child in before {
                emit(nodes, order, child);
            }
            order.push(idx);
            let mut after = nodes[idx].after_children.clone();
            after.sort_by_key(|&i| std::cmp::Reverse(nodes[i].sort));
            for child in after {
                emit(nodes, order, child);
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        for bucket in [
            (&self.start_before, false),
            (&self.start_after, true),
            (&self.end_before, false),
            (&self.end_after, true),
        ] {
            let (list, newest_first) = bucket;
            let mut roots = (*list).clone();
            if newest_first {
                roots.sort_by_key(|&i| std::cmp::Reverse(self.nodes[i].sort));
            } else {
                roots.sort_by_key(|&i| self.nodes[i].sort);
            }
            for root in roots {
                emit(&self.nodes, &mut order, root);
            }
        }
        self.order = order;
    }

    /// Live values in list order.
    pub fn to_vec(&self) -> Vec<&Value> {
        self.iter().map(|(_, v)| v).collect()
    }

    /// Live `(position, value)` pairs in list order.
    pub fn iter(&self) -> impl Iterator<Item = (OpId, &Value)> {
        self.order
            .iter()
            .map(|&i| &self.nodes[i])
            .filter(|n| !n.deleted)
            .map(|n| (n.id, &n.value))
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The live element at a list index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.iter().nth(index).map(|(_, v)| v)
    }

    /// The position identifier of the live element at a list index.
    pub fn pos_at_index(&self, index: usize) -> Option<OpId> {
        self.iter().nth(index).map(|(id, _)| id)
    }
}
