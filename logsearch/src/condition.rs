//! Normalization of query terms and condition keys.
//!
//! A [`ConditionKey`] identifies "the same question asked of the backend".
//! Two snapshots that only differ in ways that cannot change a response (the
//! order of keywords, whitespace inside a predicate) produce the same key,
//! which lets the orchestrator and distribution cache skip redundant fetches
//! and drop responses that belong to a superseded question.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDateTime;
use serde_json::{Value, json};

use crate::model::{SearchParams, SortField};
use crate::time_range::format_datetime;

/// Key under which two predicates count as the same: all whitespace removed.
pub fn predicate_key(predicate: &str) -> String {
    predicate.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Key under which two keywords count as the same: trimmed, inner whitespace
/// runs collapsed to a single space.
pub fn keyword_key(keyword: &str) -> String {
    keyword.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops blank predicates and whitespace-only variants of earlier ones. The
/// first literal form of each predicate is kept untouched.
pub fn dedupe_predicates<S: AsRef<str>>(predicates: &[S]) -> Vec<String> {
    dedupe_by(predicates, predicate_key, |p| p.to_string())
}

/// Drops blank keywords and duplicates, keeping the first trimmed form.
pub fn dedupe_keywords<S: AsRef<str>>(keywords: &[S]) -> Vec<String> {
    dedupe_by(keywords, keyword_key, |k| k.trim().to_string())
}

/// Drops blank and repeated field names, preserving first-seen order.
pub fn dedupe_fields<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    dedupe_by(fields, |f| f.trim().to_string(), |f| f.trim().to_string())
}

fn dedupe_by<S, K, L>(values: &[S], key: K, literal: L) -> Vec<String>
where
    S: AsRef<str>,
    K: Fn(&str) -> String,
    L: Fn(&str) -> String,
{
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|value: &S| -> &str { value.as_ref() })
        .filter(|value| {
            let key = key(*value);
            !key.is_empty() && seen.insert(key)
        })
        .map(literal)
        .collect()
}

/// A 128-bit digest of a normalized query condition.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionKey([u8; 16]);

impl ConditionKey {
    pub fn builder() -> ConditionKeyBuilder {
        ConditionKeyBuilder::default()
    }

    /// Key for the detail rows of a snapshot: everything that shapes the
    /// returned rows except pagination.
    pub fn for_details(params: &SearchParams, time_field: Option<&str>) -> ConditionKey {
        ConditionKey::builder()
            .target(params)
            .filters(params)
            .fields(&params.active_fields)
            .sort(&params.sort_fields)
            .page_size(params.page_size)
            .text("timeField", time_field)
            .build()
    }

    /// Key for the histogram of a snapshot. Field selection and sort do not
    /// affect bucket counts.
    pub fn for_histogram(params: &SearchParams, time_field: Option<&str>) -> ConditionKey {
        ConditionKey::builder()
            .target(params)
            .filters(params)
            .text("timeGrouping", Some(params.time_grouping.as_str()))
            .text("timeField", time_field)
            .build()
    }

    /// Key for the filter condition shared by every distribution request,
    /// independent of which fields are asked for.
    pub fn for_shared_condition(params: &SearchParams) -> ConditionKey {
        ConditionKey::builder()
            .target(params)
            .filters(params)
            .build()
    }

    /// Key for a distribution request over `fields`.
    pub fn for_distribution<S: AsRef<str>>(params: &SearchParams, fields: &[S]) -> ConditionKey {
        ConditionKey::builder()
            .target(params)
            .filters(params)
            .fields(fields)
            .build()
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConditionKey({})", self)
    }
}

/// Accumulates normalized query terms into a [`ConditionKey`].
///
/// Terms are stored in a sorted map and set-like terms are sorted before
/// hashing, so the order in which builder methods are called, or in which
/// keywords were typed, never changes the key.
#[derive(Debug, Default, Clone)]
pub struct ConditionKeyBuilder {
    terms: BTreeMap<&'static str, Value>,
}

impl ConditionKeyBuilder {
    /// Adds module and datasource.
    pub fn target(self, params: &SearchParams) -> Self {
        self.text("module", params.module.as_deref())
            .term("datasourceId", json!(params.datasource_id))
    }

    /// Adds predicates, keywords and resolved time bounds.
    pub fn filters(self, params: &SearchParams) -> Self {
        self.predicates(&params.where_predicates)
            .keywords(&params.keywords)
            .time_bounds(params.start_time, params.end_time)
    }

    pub fn predicates<S: AsRef<str>>(self, predicates: &[S]) -> Self {
        let normalized = sorted_unique(predicates.iter().map(|p| predicate_key(p.as_ref())));
        self.term("predicates", json!(normalized))
    }

    pub fn keywords<S: AsRef<str>>(self, keywords: &[S]) -> Self {
        let normalized = sorted_unique(keywords.iter().map(|k| keyword_key(k.as_ref())));
        self.term("keywords", json!(normalized))
    }

    pub fn time_bounds(self, start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        let start = start.as_ref().map(format_datetime);
        let end = end.as_ref().map(format_datetime);
        self.term("startTime", json!(start)).term("endTime", json!(end))
    }

    pub fn fields<S: AsRef<str>>(self, fields: &[S]) -> Self {
        let normalized = sorted_unique(fields.iter().map(|f| f.as_ref().trim().to_string()));
        self.term("fields", json!(normalized))
    }

    /// Sort order is significant and kept as given.
    pub fn sort(self, sort_fields: &[SortField]) -> Self {
        let sort: Vec<String> = sort_fields
            .iter()
            .map(|s| format!("{} {}", s.field_name, s.direction))
            .collect();
        self.term("sort", json!(sort))
    }

    pub fn page_size(self, page_size: usize) -> Self {
        self.term("pageSize", json!(page_size))
    }

    pub fn text(self, name: &'static str, value: Option<&str>) -> Self {
        self.term(name, json!(value))
    }

    fn term(mut self, name: &'static str, value: Value) -> Self {
        self.terms.insert(name, value);
        self
    }

    pub fn build(&self) -> ConditionKey {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.terms {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\n");
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        ConditionKey(key)
    }
}

fn sorted_unique(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut values: Vec<String> = values.filter(|v| !v.is_empty()).collect();
    values.sort();
    values.dedup();
    values
}
