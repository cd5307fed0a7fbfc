//! CoPlainText: collaborative text as a list of characters
//!
//! A plain-text CoValue is a CoList whose elements are single
//! characters. The `ins` change op compresses a contiguous run of
//! insertions that share a parent for locality; the fold expands it
//! back into chained single-character insertions. Editing helpers
//! compute change lists against the current materialization, including
//! a minimal-edit-script `apply_diff`.

use crate::colist::{Anchor, ListOp, ListView};
use cojson_model::CausalKey;
use serde_json::Value;

/// Materialized view of a CoPlainText.
pub struct TextView {
    list: ListView,
}

impl TextView {
    /// Fold transactions (already sorted by causal key) into the view.
    pub fn fold<'a>(txs: impl Iterator<Item = (CausalKey, &'a [Value])>) -> Self {
        Self {
            list: ListView::fold(txs),
        }
    }

    /// The current text.
    pub fn text(&self) -> String {
        self.list
            .iter()
            .filter_map(|(_, v)| v.as_str())
            .collect()
    }

    /// Number of live characters.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn list(&self) -> &ListView {
        &self.list
    }

    /// Changes that insert `text` after the character at `index`
    /// (`None` = at the very beginning).
    pub fn insert_after(&self, index: Option<usize>, text: &str) -> Vec<Value> {
        if text.is_empty() {
            return Vec::new();
        }
        let anchor = match index {
            None => Anchor::Start,
            Some(i) => match self.list.pos_at_index(i) {
                Some(pos) => Anchor::Pos(pos),
                None => Anchor::End,
            },
        };
        vec![ListOp::ins(anchor, text)]
    }

    /// Changes that insert `text` before the character at `index`.
    pub fn insert_before(&self, index: usize, text: &str) -> Vec<Value> {
        if index == 0 {
            self.insert_after(None, text)
        } else {
            self.insert_after(Some(index - 1), text)
        }
    }

    /// Changes that delete characters in `[from, to)`.
    pub fn delete_range(&self, from: usize, to: usize) -> Vec<Value> {
        (from..to)
            .filter_map(|i| self.list.pos_at_index(i))
            .map(ListOp::del)
            .collect()
    }

    /// Changes that transform the current text into `new`, as a minimum
    /// edit script over the common prefix and suffix: at most one
    /// deletion range and one insertion run.
    pub fn apply_diff(&self, new: &str) -> Vec<Value> {
        let old_chars: Vec<char> = self.text().chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let mut prefix = 0;
        while prefix < old_chars.len()
            && prefix < new_chars.len()
            && old_chars[prefix] == new_chars[prefix]
        {
            prefix += 1;
        }

        let mut suffix = 0;
        while suffix < old_chars.len() - prefix
            && suffix < new_chars.len() - prefix
            && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
        {
            suffix += 1;
        }

        let mut changes = Vec::new();
        let delete_to = old_chars.len() - suffix;
        if prefix < delete_to {
            changes.extend(self.delete_range(prefix, delete_to));
        }
        let insert_to = new_chars.len() - suffix;
        if prefix < insert_to {
            let inserted: String = new_chars[prefix..insert_to].iter().collect();
            let after = if prefix == 0 { None } else { Some(prefix - 1) };
            changes.extend(self.insert_after(after, &inserted));
        }
        changes
    }
}
