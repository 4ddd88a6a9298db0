//! Tracked partial updates, replacing in-place mutation of a document with
//! an explicit changeset.
//!
//! Stages never diff an entity against its previous snapshot. Instead each
//! stage builds an `UpdateBuilder` describing exactly which field paths to
//! `$set`, `$unset`, or `$addToSet`. The document-store adapter
//! (`inflow_worker::db::store`) turns this into the actual SQL.

use serde_json::Value;
use std::collections::BTreeMap;

/// One accumulated partial update against a single document.
#[derive(Debug, Clone, Default)]
pub struct UpdateBuilder {
    sets: BTreeMap<String, Value>,
    unsets: Vec<String>,
    /// field path -> appended values (the `$each` of an `$addToSet`).
    add_to_sets: BTreeMap<String, Vec<Value>>,
}

impl UpdateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.sets.insert(path.into(), value.into());
        self
    }

    pub fn unset(&mut self, path: impl Into<String>) -> &mut Self {
        self.unsets.push(path.into());
        self
    }

    pub fn add_to_set(&mut self, path: impl Into<String>, values: Vec<Value>) -> &mut Self {
        self.add_to_sets.entry(path.into()).or_default().extend(values);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.unsets.is_empty() && self.add_to_sets.is_empty()
    }

    pub fn sets(&self) -> &BTreeMap<String, Value> {
        &self.sets
    }

    pub fn unsets(&self) -> &[String] {
        &self.unsets
    }

    pub fn add_to_sets(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.add_to_sets
    }

    /// Merge another builder's operations into this one (later wins on `$set`).
    pub fn merge(&mut self, other: UpdateBuilder) -> &mut Self {
        self.sets.extend(other.sets);
        self.unsets.extend(other.unsets);
        for (path, values) in other.add_to_sets {
            self.add_to_sets.entry(path).or_default().extend(values);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_unset_same_path_keeps_last_operation_queued() {
        let mut b = UpdateBuilder::new();
        b.set("status", json!("LOADED"));
        b.unset("status");
        assert!(b.sets().contains_key("status"));
        assert_eq!(b.unsets(), &["status".to_string()]);
    }

    #[test]
    fn add_to_set_accumulates_across_calls() {
        let mut b = UpdateBuilder::new();
        b.add_to_set("log", vec![json!("a")]);
        b.add_to_set("log", vec![json!("b")]);
        assert_eq!(b.add_to_sets()["log"], vec![json!("a"), json!("b")]);
    }

    #[test]
    fn merge_combines_two_builders() {
        let mut a = UpdateBuilder::new();
        a.set("x", json!(1));
        let mut b = UpdateBuilder::new();
        b.set("y", json!(2));
        a.merge(b);
        assert_eq!(a.sets().len(), 2);
    }
}
