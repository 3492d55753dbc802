//! Durable document-store capability.
//!
//! The rollup writes immutable time-series rows here; the view builder
//! replaces whole collections; the anomaly detector reads aggregates. The
//! trait mirrors the handful of document-store operations the core needs,
//! so a remote store can be injected in place of the bundled
//! [`FileArchive`].

pub mod file;

pub use file::FileArchive;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Sort direction for [`Archive::find`] and index hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A single archive row: a flat JSON object.
///
/// Rollup rows carry `app_id`, `name`, `date` (epoch seconds) and one
/// numeric column per configured field. View rows carry the flattened
/// `{field}_{period}` columns, which may be `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn set_null(&mut self, key: &str) {
        self.0.insert(key.to_string(), Value::Null);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// The rollup timestamp column, epoch seconds.
    pub fn date(&self) -> Option<i64> {
        self.get_i64("date")
    }
}

/// Conjunctive document filter: equality plus open/closed bounds on
/// integer columns (in practice, `date`).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    eq: Vec<(String, Value)>,
    gt: Vec<(String, i64)>,
    lt: Vec<(String, i64)>,
    lte: Vec<(String, i64)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.eq.push((key.to_string(), value.into()));
        self
    }

    pub fn gt(mut self, key: &str, bound: i64) -> Self {
        self.gt.push((key.to_string(), bound));
        self
    }

    pub fn lt(mut self, key: &str, bound: i64) -> Self {
        self.lt.push((key.to_string(), bound));
        self
    }

    pub fn lte(mut self, key: &str, bound: i64) -> Self {
        self.lte.push((key.to_string(), bound));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.eq
            .iter()
            .all(|(key, value)| doc.get(key) == Some(value))
            && self
                .gt
                .iter()
                .all(|(key, bound)| doc.get_i64(key).is_some_and(|v| v > *bound))
            && self
                .lt
                .iter()
                .all(|(key, bound)| doc.get_i64(key).is_some_and(|v| v < *bound))
            && self
                .lte
                .iter()
                .all(|(key, bound)| doc.get_i64(key).is_some_and(|v| v <= *bound))
    }
}

/// Per-`(app_id, name)` field means, as produced by
/// [`Archive::avg_by_identifier`].
pub type IdentifierAverages = HashMap<(String, String), HashMap<String, f64>>;

/// Capability interface over the durable document store.
pub trait Archive: Send + Sync {
    /// Insert documents, assigning each a fresh `_id`.
    fn insert(&self, collection: &str, docs: Vec<Document>) -> Result<()>;

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, Order)>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>>;

    /// Delete matching documents; returns the count.
    fn remove(&self, collection: &str, filter: &Filter) -> Result<usize>;

    /// Atomically swap the collection contents. Used by the view builder.
    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> Result<()>;

    /// Advisory index hint; implementations may ignore it.
    fn ensure_index(&self, collection: &str, fields: &[(&str, Order)]) -> Result<()>;

    /// Mean of each listed field grouped by `(app_id, name)` over documents
    /// whose `date` lies strictly inside `(start, end)`.
    fn avg_by_identifier(
        &self,
        collection: &str,
        fields: &[String],
        start: i64,
        end: i64,
    ) -> Result<IdentifierAverages>;

    fn collection_names(&self) -> Result<Vec<String>>;

    fn drop_collection(&self, collection: &str) -> Result<()>;
}

/// Total order over JSON values for sorting: null < numbers < strings.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
