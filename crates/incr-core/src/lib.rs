//! Core identifier, batch and job types for incremental item filtering.

use std::borrow::Borrow;
use std::collections::{hash_set, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "incr-core";

pub const DEFAULT_ITEM_UNIQUE_FIELD: &str = "url";
pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const COLLECTION_SUFFIX: &str = "_seen_before";

/// Dedup key extracted from an item's unique field. Unique per job, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Store-side collection holding a job's seen identifiers.
pub fn collection_name(job_name: &str) -> String {
    format!("{job_name}{COLLECTION_SUFFIX}")
}

/// Reads `field` from a JSON item. Strings and numbers qualify; null, empty
/// strings and any other JSON type count as a missing identifier.
pub fn extract_identifier(record: &JsonValue, field: &str) -> Option<Identifier> {
    identifier_from_value(record.get(field)?)
}

/// Strings and numbers are identifiers; numbers keep their JSON text.
pub fn identifier_from_value(value: &JsonValue) -> Option<Identifier> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(Identifier::new(s.as_str())),
        JsonValue::Number(n) => Some(Identifier::new(n.to_string())),
        _ => None,
    }
}

fn deserialize_stored_id<'de, D>(deserializer: D) -> Result<Option<Identifier>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(identifier_from_value))
}

/// Insert-only identifier set with O(1) membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierSet {
    items: HashSet<Identifier>,
}

impl IdentifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains(id)
    }

    /// Returns `false` when the identifier was already present.
    pub fn insert(&mut self, id: Identifier) -> bool {
        self.items.insert(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identifier> {
        self.items.iter()
    }

    /// Consumes the set into batches of at most `batch_size` identifiers, in
    /// unspecified order. A zero size is treated as one.
    pub fn into_batches(self, batch_size: usize) -> Batches {
        Batches {
            inner: self.items.into_iter(),
            batch_size: batch_size.max(1),
        }
    }
}

impl FromIterator<Identifier> for IdentifierSet {
    fn from_iter<T: IntoIterator<Item = Identifier>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl Extend<Identifier> for IdentifierSet {
    fn extend<T: IntoIterator<Item = Identifier>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

impl IntoIterator for IdentifierSet {
    type Item = Identifier;
    type IntoIter = hash_set::IntoIter<Identifier>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[derive(Debug)]
pub struct Batches {
    inner: hash_set::IntoIter<Identifier>,
    batch_size: usize,
}

impl Iterator for Batches {
    type Item = Vec<Identifier>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<_> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Persisted `{_key, item_id}` pair. The synthetic key only gives each write a
/// unique slot in the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    #[serde(rename = "_key")]
    pub key: String,
    pub item_id: Identifier,
}

impl BatchEntry {
    pub fn fresh(item_id: Identifier) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            item_id,
        }
    }
}

/// Entry as read back from a collection. Foreign writers may omit fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    #[serde(rename = "_key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_stored_id")]
    pub item_id: Option<Identifier>,
}

impl From<BatchEntry> for StoredEntry {
    fn from(entry: BatchEntry) -> Self {
        Self {
            key: Some(entry.key),
            item_id: Some(entry.item_id),
        }
    }
}

/// Full-crawl bypass switch for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Incremental,
    FullCrawl,
}

impl RunMode {
    pub fn from_full_crawl(full_crawl: bool) -> Self {
        if full_crawl {
            Self::FullCrawl
        } else {
            Self::Incremental
        }
    }

    pub fn is_full_crawl(self) -> bool {
        self == Self::FullCrawl
    }
}

/// Capability a host job declares to take part in incremental runs. Queried
/// once when a run opens.
pub trait IncrementalJob: Send + Sync {
    fn job_name(&self) -> &str;

    fn run_mode(&self) -> RunMode {
        RunMode::Incremental
    }

    /// Whether candidate requests are screened against prior-run identifiers
    /// before they are fetched.
    fn filters_requests(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub mode: RunMode,
    pub filter_requests: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: RunMode::Incremental,
            filter_requests: true,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn without_request_filter(mut self) -> Self {
        self.filter_requests = false;
        self
    }
}

impl IncrementalJob for JobSpec {
    fn job_name(&self) -> &str {
        &self.name
    }

    fn run_mode(&self) -> RunMode {
        self.mode
    }

    fn filters_requests(&self) -> bool {
        self.filter_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_name_appends_suffix() {
        assert_eq!(collection_name("spiderA"), "spiderA_seen_before");
    }

    #[test]
    fn extraction_accepts_strings_and_numbers() {
        let item = json!({"url": "https://a.example/1", "sku": 42, "empty": "", "none": null, "tags": ["x"]});
        assert_eq!(
            extract_identifier(&item, "url"),
            Some(Identifier::from("https://a.example/1"))
        );
        assert_eq!(extract_identifier(&item, "sku"), Some(Identifier::from("42")));
        assert_eq!(extract_identifier(&item, "empty"), None);
        assert_eq!(extract_identifier(&item, "none"), None);
        assert_eq!(extract_identifier(&item, "tags"), None);
        assert_eq!(extract_identifier(&item, "missing"), None);
        assert_eq!(extract_identifier(&json!("not an object"), "url"), None);
    }

    #[test]
    fn set_insert_reports_first_sighting() {
        let mut set = IdentifierSet::new();
        assert!(set.insert("a".into()));
        assert!(!set.insert("a".into()));
        assert!(set.contains("a"));
        assert!(!set.contains("b"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn batches_cover_every_identifier_once() {
        let set: IdentifierSet = (0..7).map(|i| Identifier::new(format!("id-{i}"))).collect();
        let batches: Vec<_> = set.clone().into_batches(3).collect();

        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        let flattened: IdentifierSet = batches.into_iter().flatten().collect();
        assert_eq!(flattened, set);
    }

    #[test]
    fn empty_set_yields_no_batches() {
        assert_eq!(IdentifierSet::new().into_batches(10).count(), 0);
    }

    #[test]
    fn batch_entry_serializes_with_underscore_key() {
        let entry = BatchEntry::fresh("https://a.example/1".into());
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["item_id"], "https://a.example/1");
        assert_eq!(value["_key"].as_str().map(str::len), Some(36));
        assert_ne!(entry.key, BatchEntry::fresh("https://a.example/1".into()).key);
    }

    #[test]
    fn stored_entry_tolerates_missing_fields() {
        let entry: StoredEntry = serde_json::from_str(r#"{"value": 1}"#).expect("parse");
        assert_eq!(entry.key, None);
        assert_eq!(entry.item_id, None);
    }

    #[test]
    fn stored_entry_accepts_numeric_ids_and_ignores_structures() {
        let parse = |line: &str| -> Option<Identifier> {
            serde_json::from_str::<StoredEntry>(line).expect("parse").item_id
        };
        assert_eq!(parse(r#"{"_key":"k1","item_id":"a"}"#), Some(Identifier::from("a")));
        assert_eq!(parse(r#"{"_key":"k2","item_id":42}"#), Some(Identifier::from("42")));
        assert_eq!(parse(r#"{"_key":"k3","item_id":null}"#), None);
        assert_eq!(parse(r#"{"_key":"k4","item_id":["a"]}"#), None);
        assert_eq!(parse(r#"{"_key":"k5","item_id":""}"#), None);
    }

    #[test]
    fn job_spec_defaults_to_incremental_with_request_filter() {
        let job = JobSpec::new("spiderA");
        assert_eq!(job.run_mode(), RunMode::Incremental);
        assert!(job.filters_requests());
        let job = job.with_mode(RunMode::FullCrawl).without_request_filter();
        assert!(job.run_mode().is_full_crawl());
        assert!(!job.filters_requests());
    }
}
