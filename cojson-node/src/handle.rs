//! Typed handles: thin façades over CoValue cores
//!
//! A handle owns nothing but the CoValue ID; reads materialize the view
//! through the node and writes append transactions to the node's
//! current session. The core itself has no notion of schema — these
//! wrappers are the only typed surface.

use crate::node::{LocalNode, NodeError};
use cojson_core::{Anchor, ListOp, MapOp, Member, Role};
use cojson_model::{CausalKey, CoId, KeyId, OpId};
use serde_json::Value;

/// Handle over a `comap` CoValue.
#[derive(Clone, Copy, Debug)]
pub struct MapHandle {
    id: CoId,
}

impl MapHandle {
    pub fn new(id: CoId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn get(&self, node: &mut LocalNode, key: &str) -> Result<Option<Value>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view.as_map().and_then(|m| m.get(key).cloned()))
    }

    pub fn keys(&self, node: &mut LocalNode) -> Result<Vec<String>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view
            .as_map()
            .map(|m| m.keys().map(str::to_string).collect())
            .unwrap_or_default())
    }

    pub fn set(
        &self,
        node: &mut LocalNode,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), NodeError> {
        node.commit(&self.id, vec![MapOp::set(key, value)])
    }

    pub fn set_private(
        &self,
        node: &mut LocalNode,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), NodeError> {
        node.commit_private(&self.id, vec![MapOp::set(key, value)])
    }

    pub fn delete(&self, node: &mut LocalNode, key: impl Into<String>) -> Result<(), NodeError> {
        node.commit(&self.id, vec![MapOp::del(key)])
    }
}

/// Handle over a `colist` CoValue.
#[derive(Clone, Copy, Debug)]
pub struct ListHandle {
    id: CoId,
}

impl ListHandle {
    pub fn new(id: CoId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn to_vec(&self, node: &mut LocalNode) -> Result<Vec<Value>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view
            .as_list()
            .map(|l| l.to_vec().into_iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn len(&self, node: &mut LocalNode) -> Result<usize, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view.as_list().map(|l| l.len()).unwrap_or_default())
    }

    pub fn is_empty(&self, node: &mut LocalNode) -> Result<bool, NodeError> {
        Ok(self.len(node)? == 0)
    }

    /// Append at the end of the list.
    pub fn push(&self, node: &mut LocalNode, value: Value) -> Result<(), NodeError> {
        node.commit(&self.id, vec![ListOp::pre(Anchor::End, value)])
    }

    /// Insert logically after the element at `index`.
    pub fn insert_after_index(
        &self,
        node: &mut LocalNode,
        index: usize,
        value: Value,
    ) -> Result<(), NodeError> {
        let anchor = self
            .pos_at(node, index)?
            .map(Anchor::Pos)
            .unwrap_or(Anchor::End);
        node.commit(&self.id, vec![ListOp::app(anchor, value)])
    }

    /// Tombstone the element at `index`.
    pub fn delete_at(&self, node: &mut LocalNode, index: usize) -> Result<(), NodeError> {
        let Some(pos) = self.pos_at(node, index)? else {
            return Ok(());
        };
        node.commit(&self.id, vec![ListOp::del(pos)])
    }

    /// The stable position identifier of the element at `index`.
    pub fn pos_at(&self, node: &mut LocalNode, index: usize) -> Result<Option<OpId>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view.as_list().and_then(|l| l.pos_at_index(index)))
    }
}

/// Handle over a `costream` CoValue.
#[derive(Clone, Copy, Debug)]
pub struct StreamHandle {
    id: CoId,
}

impl StreamHandle {
    pub fn new(id: CoId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    /// Append one entry to our session's feed.
    pub fn push(&self, node: &mut LocalNode, value: Value) -> Result<(), NodeError> {
        node.commit(&self.id, vec![value])
    }

    /// Every entry across all sessions, in causal order.
    pub fn all(&self, node: &mut LocalNode) -> Result<Vec<Value>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view
            .as_stream()
            .map(|s| s.all().into_iter().map(|item| item.value.clone()).collect())
            .unwrap_or_default())
    }
}

/// Handle over a `coplaintext` CoValue.
#[derive(Clone, Copy, Debug)]
pub struct TextHandle {
    id: CoId,
}

impl TextHandle {
    pub fn new(id: CoId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn text(&self, node: &mut LocalNode) -> Result<String, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view.as_text().map(|t| t.text()).unwrap_or_default())
    }

    pub fn insert_after(
        &self,
        node: &mut LocalNode,
        index: Option<usize>,
        text: &str,
    ) -> Result<(), NodeError> {
        let changes = match node.view(&self.id)?.as_text() {
            Some(t) => t.insert_after(index, text),
            None => return Ok(()),
        };
        self.commit_changes(node, changes)
    }

    pub fn insert_before(
        &self,
        node: &mut LocalNode,
        index: usize,
        text: &str,
    ) -> Result<(), NodeError> {
        let changes = match node.view(&self.id)?.as_text() {
            Some(t) => t.insert_before(index, text),
            None => return Ok(()),
        };
        self.commit_changes(node, changes)
    }

    pub fn delete_range(
        &self,
        node: &mut LocalNode,
        from: usize,
        to: usize,
    ) -> Result<(), NodeError> {
        let changes = match node.view(&self.id)?.as_text() {
            Some(t) => t.delete_range(from, to),
            None => return Ok(()),
        };
        self.commit_changes(node, changes)
    }

    /// Transform the current text into `new` as one transaction
    /// carrying the minimum edit script.
    pub fn apply_diff(&self, node: &mut LocalNode, new: &str) -> Result<(), NodeError> {
        let changes = match node.view(&self.id)?.as_text() {
            Some(t) => t.apply_diff(new),
            None => return Ok(()),
        };
        self.commit_changes(node, changes)
    }

    fn commit_changes(&self, node: &mut LocalNode, changes: Vec<Value>) -> Result<(), NodeError> {
        if changes.is_empty() {
            return Ok(());
        }
        node.commit(&self.id, changes)
    }
}

/// Handle over a `group` CoValue.
#[derive(Clone, Copy, Debug)]
pub struct GroupHandle {
    id: CoId,
}

impl GroupHandle {
    pub fn new(id: CoId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    /// The member's effective role as of now.
    pub fn role_of(&self, node: &mut LocalNode, account: &CoId) -> Result<Option<Role>, NodeError> {
        let ctx = node.build_ctx();
        let view = node.view(&self.id)?;
        let Some(group) = view.as_group() else {
            return Ok(None);
        };
        // A probe key later than every possible transaction.
        let probe = CausalKey::new(
            u64::MAX,
            cojson_model::SessionId::new(
                cojson_model::id::SessionOwner::Account(*account),
                u64::MAX,
            ),
            u32::MAX,
        );
        Ok(group.role_at(&Member::Account(*account), probe, &ctx))
    }

    pub fn current_read_key(&self, node: &mut LocalNode) -> Result<Option<KeyId>, NodeError> {
        let view = node.view(&self.id)?;
        Ok(view.as_group().and_then(|g| g.current_read_key()))
    }

    pub fn add_member(
        &self,
        node: &mut LocalNode,
        account: &CoId,
        role: Role,
    ) -> Result<(), NodeError> {
        node.add_member(&self.id, account, role)
    }

    pub fn revoke_member(&self, node: &mut LocalNode, account: &CoId) -> Result<(), NodeError> {
        node.revoke_member(&self.id, account)
    }

    pub fn create_map(&self, node: &mut LocalNode) -> Result<MapHandle, NodeError> {
        Ok(MapHandle::new(
            node.create_co_value(cojson_core::CoKind::Map, &self.id)?,
        ))
    }

    pub fn create_list(&self, node: &mut LocalNode) -> Result<ListHandle, NodeError> {
        Ok(ListHandle::new(
            node.create_co_value(cojson_core::CoKind::List, &self.id)?,
        ))
    }

    pub fn create_stream(&self, node: &mut LocalNode) -> Result<StreamHandle, NodeError> {
        Ok(StreamHandle::new(
            node.create_co_value(cojson_core::CoKind::Stream, &self.id)?,
        ))
    }

    pub fn create_text(&self, node: &mut LocalNode) -> Result<TextHandle, NodeError> {
        Ok(TextHandle::new(
            node.create_co_value(cojson_core::CoKind::PlainText, &self.id)?,
        ))
    }
}
