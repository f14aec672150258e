//! The key/value state shared across one workflow run.
//!
//! Writes are last-write-wins per key, but nothing is silently lost: every write
//! lands in an audit trail together with the value it replaced and the path of
//! the node that made it.
//!
//! Parallel branches never write into their parent directly. Each branch runs on
//! a [`BranchView`] forked from the parent; when the branch completes the engine
//! merges its writes under `"<branch-id>.<key>"`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plain key-ordered copy of a context.
pub type ContextSnapshot = BTreeMap<String, Value>;

/// Separator between a branch id and the key it wrote.
pub const BRANCH_SEPARATOR: char = '.';

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRecord {
    pub seq: u64,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    /// Path of the node that committed the write
    pub writer: String,
}

/// A batch of writes with unique keys, committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWrite(BTreeMap<String, Value>);

impl ContextWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: Value) -> Self {
        let mut write = Self::new();
        write.insert(key, value);
        write
    }

    /// Insert a key; a repeated key replaces the earlier value in the same batch.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, Value)> for ContextWrite {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, Value>,
    journal: Vec<WriteRecord>,
    next_seq: u64,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context with initial values. Seeding is not audited.
    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Seed from a JSON object; any other JSON value yields an empty context.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_values(map),
            _ => Self::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Commit a batch of writes on behalf of `writer`.
    pub fn commit(&mut self, writer: &str, write: ContextWrite) {
        for (key, value) in write.0 {
            self.record(writer, key, value);
        }
    }

    pub fn set(&mut self, writer: &str, key: impl Into<String>, value: Value) {
        self.record(writer, key.into(), value);
    }

    fn record(&mut self, writer: &str, key: String, value: Value) {
        let previous = self.values.insert(key.clone(), value.clone());
        if previous.is_some() {
            tracing::trace!("[Context] {} overwrote '{}'", writer, key);
        }
        self.journal.push(WriteRecord {
            seq: self.next_seq,
            key,
            value,
            previous,
            writer: writer.to_string(),
        });
        self.next_seq += 1;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.values.clone()
    }

    pub fn audit(&self) -> &[WriteRecord] {
        &self.journal
    }

    pub fn into_parts(self) -> (ContextSnapshot, Vec<WriteRecord>) {
        (self.values, self.journal)
    }

    /// Fork an independent view for a parallel branch.
    ///
    /// The view sees every value of the parent at fork time and starts with an
    /// empty journal, so its journal is exactly the branch's own writes.
    pub fn fork(&self, branch_id: &str) -> BranchView {
        BranchView {
            branch_id: branch_id.to_string(),
            context: Context::from_values(self.values.clone()),
        }
    }

    /// Merge a completed branch's writes under `"<branch-id>.<key>"`.
    pub fn merge_branch(&mut self, view: BranchView) {
        let BranchView { branch_id, context } = view;
        for rec in context.journal {
            let key = qualify(&branch_id, &rec.key);
            self.record(&rec.writer, key, rec.value);
        }
    }
}

/// Key a branch write lands under once merged.
pub fn qualify(branch_id: &str, key: &str) -> String {
    format!("{}{}{}", branch_id, BRANCH_SEPARATOR, key)
}

/// A parallel branch's private view of the context.
#[derive(Debug, Clone)]
pub struct BranchView {
    branch_id: String,
    context: Context,
}

impl BranchView {
    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Keys written by the branch so far (unqualified).
    pub fn written_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.context.journal.iter().map(|r| r.key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}
