//! Row expansion that survives data refreshes.
//!
//! Record keys are assigned on arrival, so a refetch of the same rows yields
//! new keys. Each expanded row therefore also remembers a fingerprint of its
//! content; when its key disappears from the buffer the expansion moves to a
//! row with the same fingerprint, if there is one.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};

use crate::accumulator::{RecordKey, RowRecord};

const IDENTITY_FIELDS: [&str; 3] = ["host", "source", "log_offset"];
const MIN_IDENTITY_FIELDS: usize = 2;
const EXTRA_FIELDS: usize = 5;
const MAX_VALUE_CHARS: usize = 100;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint([u8; 16]);

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint(")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Fingerprint of a row from its quasi-unique fields: the time field plus
/// host, source and log offset. Rows with fewer than two of those present
/// also contribute their first five other fields, values truncated to 100
/// characters.
pub fn fingerprint(source: &Map<String, Value>, time_field: &str) -> ContentFingerprint {
    let present = |name: &str| source.get(name).is_some_and(|v| !v.is_null());

    let mut fields: Vec<&str> = std::iter::once(time_field)
        .chain(IDENTITY_FIELDS)
        .filter(|&name| present(name))
        .collect();
    if fields.len() < MIN_IDENTITY_FIELDS {
        let extra: Vec<&str> = source
            .keys()
            .map(String::as_str)
            .filter(|name| !fields.contains(name))
            .take(EXTRA_FIELDS)
            .collect();
        fields.extend(extra);
    }

    let mut hasher = blake3::Hasher::new();
    for name in fields {
        let value = match source.get(name) {
            Some(Value::String(s)) => s.chars().take(MAX_VALUE_CHARS).collect::<String>(),
            Some(other) => other.to_string().chars().take(MAX_VALUE_CHARS).collect(),
            None => continue,
        };
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    ContentFingerprint(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionEntry {
    pub record_key: RecordKey,
    pub fingerprint: ContentFingerprint,
}

/// Which rows are expanded, in expansion order.
#[derive(Debug, Clone, Default)]
pub struct ExpansionState {
    entries: Vec<ExpansionEntry>,
}

impl ExpansionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_expanded(&self, key: &RecordKey) -> bool {
        self.entries.iter().any(|e| &e.record_key == key)
    }

    pub fn expanded_keys(&self) -> Vec<RecordKey> {
        self.entries.iter().map(|e| e.record_key.clone()).collect()
    }

    pub fn entries(&self) -> &[ExpansionEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expands or collapses `record`. Returns whether it is now expanded.
    pub fn toggle(&mut self, record: &RowRecord, time_field: &str) -> bool {
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.record_key == record.record_key)
        {
            self.entries.remove(index);
            return false;
        }
        self.entries.push(ExpansionEntry {
            record_key: record.record_key.clone(),
            fingerprint: fingerprint(&record.original_source, time_field),
        });
        true
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Carries expansion over to a new row buffer. Returns whether the
    /// expanded set changed.
    ///
    /// When every expanded key is still present nothing is recomputed.
    /// Otherwise entries whose key is gone move to the first unclaimed row
    /// with the same fingerprint, and entries without a match are dropped.
    pub fn reconcile(&mut self, rows: &[RowRecord], time_field: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let present: HashSet<&RecordKey> = rows.iter().map(|r| &r.record_key).collect();
        if self.entries.iter().all(|e| present.contains(&e.record_key)) {
            return false;
        }

        let fingerprints: Vec<ContentFingerprint> = rows
            .iter()
            .map(|r| fingerprint(&r.original_source, time_field))
            .collect();
        let mut claimed: HashSet<RecordKey> = self
            .entries
            .iter()
            .filter(|e| present.contains(&e.record_key))
            .map(|e| e.record_key.clone())
            .collect();

        let before = self.entries.len();
        let mut moved = 0usize;
        let mut next = Vec::with_capacity(before);
        for entry in self.entries.drain(..) {
            if present.contains(&entry.record_key) {
                next.push(entry);
                continue;
            }
            let target = rows
                .iter()
                .zip(&fingerprints)
                .find(|(row, fp)| **fp == entry.fingerprint && !claimed.contains(&row.record_key));
            if let Some((row, fp)) = target {
                claimed.insert(row.record_key.clone());
                moved += 1;
                next.push(ExpansionEntry {
                    record_key: row.record_key.clone(),
                    fingerprint: *fp,
                });
            }
        }
        tracing::debug!(
            moved,
            dropped = before - next.len(),
            "reconciled expanded rows"
        );
        self.entries = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use common::MockClock;
    use serde_json::json;

    use super::*;
    use crate::accumulator::IncrementalRowAccumulator;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn batch(ids: &[u64]) -> Vec<Map<String, Value>> {
        ids.iter()
            .map(|id| {
                object(json!({
                    "log_time": format!("2024-03-13 10:00:{:02}.000", id),
                    "host": "web-1",
                    "log_offset": id,
                    "message": format!("line {}", id),
                }))
            })
            .collect()
    }

    fn accumulator() -> (Arc<MockClock>, IncrementalRowAccumulator) {
        let clock = Arc::new(MockClock::with_millis(1_000));
        let mut acc = IncrementalRowAccumulator::new(clock.clone());
        acc.set_time_field(Some("log_time".to_string()));
        (clock, acc)
    }

    #[test]
    fn should_ignore_fields_outside_identity_set() {
        let a = object(json!({"log_time": "t", "host": "h", "message": "one"}));
        let b = object(json!({"log_time": "t", "host": "h", "message": "two"}));
        assert_eq!(fingerprint(&a, "log_time"), fingerprint(&b, "log_time"));
    }

    #[test]
    fn should_extend_fingerprint_when_identity_fields_are_missing() {
        let a = object(json!({"log_time": "t", "message": "one"}));
        let b = object(json!({"log_time": "t", "message": "two"}));
        assert_ne!(fingerprint(&a, "log_time"), fingerprint(&b, "log_time"));
    }

    #[test]
    fn should_truncate_long_values() {
        let long = "x".repeat(150);
        let longer = format!("{}{}", "x".repeat(100), "y".repeat(50));
        let a = object(json!({"message": long}));
        let b = object(json!({"message": longer}));
        assert_eq!(fingerprint(&a, "log_time"), fingerprint(&b, "log_time"));
    }

    #[test]
    fn should_toggle_expansion() {
        // given
        let (_, mut acc) = accumulator();
        acc.on_batch_arrived(batch(&[1, 2]), 0, 2);
        let mut state = ExpansionState::new();
        let row = &acc.rows()[1];

        // when / then
        assert!(state.toggle(row, "log_time"));
        assert!(state.is_expanded(&row.record_key));
        assert!(!state.toggle(row, "log_time"));
        assert!(state.is_empty());
    }

    #[test]
    fn should_keep_expansion_when_keys_survive() {
        // given
        let (_, mut acc) = accumulator();
        acc.on_batch_arrived(batch(&[1, 2, 3]), 0, 10);
        let mut state = ExpansionState::new();
        state.toggle(&acc.rows()[1], "log_time");

        // when
        acc.on_batch_arrived(batch(&[4, 5]), 3, 10);

        // then
        assert!(!state.reconcile(acc.rows(), "log_time"));
        assert_eq!(state.expanded_keys(), vec![acc.rows()[1].record_key.clone()]);
    }

    #[test]
    fn should_move_expansion_to_refetched_row_with_same_content() {
        // given
        let (clock, mut acc) = accumulator();
        acc.on_batch_arrived(batch(&[1, 2, 3]), 0, 3);
        let mut state = ExpansionState::new();
        state.toggle(&acc.rows()[2], "log_time");
        let old_key = acc.rows()[2].record_key.clone();

        // when
        clock.advance(Duration::from_secs(5));
        acc.on_batch_arrived(batch(&[0, 3, 4, 5]), 0, 4);
        let changed = state.reconcile(acc.rows(), "log_time");

        // then
        assert!(changed);
        let new_key = acc.rows()[1].record_key.clone();
        assert_ne!(new_key, old_key);
        assert_eq!(state.expanded_keys(), vec![new_key]);
    }

    #[test]
    fn should_drop_expansion_without_matching_row() {
        // given
        let (clock, mut acc) = accumulator();
        acc.on_batch_arrived(batch(&[1, 2]), 0, 2);
        let mut state = ExpansionState::new();
        state.toggle(&acc.rows()[0], "log_time");
        state.toggle(&acc.rows()[1], "log_time");

        // when
        clock.advance(Duration::from_secs(5));
        acc.on_batch_arrived(batch(&[2, 7]), 0, 2);
        state.reconcile(acc.rows(), "log_time");

        // then
        assert_eq!(state.expanded_keys(), vec![acc.rows()[0].record_key.clone()]);
    }
}
