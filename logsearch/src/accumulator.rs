//! Incremental accumulation of paginated detail rows.

use std::fmt;
use std::sync::Arc;

use common::Clock;
use serde_json::{Map, Value};

use crate::time_range::{format_datetime, parse_datetime};

/// Process-local identity of a row, `{receiptMillis}_{indexInBatch}`.
///
/// Assigned on arrival and not derived from content, so the same log line
/// fetched twice gets two different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(receipt_millis: i64, index: usize) -> Self {
        Self(format!("{}_{}", receipt_millis, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub record_key: RecordKey,
    pub fields: Map<String, Value>,
    /// Every field of the row as received, for full-record rendering.
    pub original_source: Arc<Map<String, Value>>,
}

impl RowRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Content equality, ignoring the record key.
    pub fn same_content(&self, other: &RowRecord) -> bool {
        self.original_source == other.original_source
    }
}

/// What an arriving batch did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEffect {
    /// A fresh search replaced the buffer.
    Replaced,
    /// A fresh search returned what the buffer already holds; the existing
    /// rows and keys were kept.
    Unchanged,
    /// A continuation page was appended after dropping `overlap` rows that
    /// repeated the tail of the buffer.
    Appended { added: usize, overlap: usize },
    /// A continuation page came back empty; there is nothing more to load.
    Exhausted,
}

/// Ordered buffer of fetched rows.
///
/// An offset-0 batch starts over; a batch at a positive offset extends the
/// buffer. The accumulator also tracks whether a page fetch is outstanding so
/// "load more" cannot be triggered twice for the same page.
pub struct IncrementalRowAccumulator {
    clock: Arc<dyn Clock>,
    time_field: Option<String>,
    rows: Vec<RowRecord>,
    total: u64,
    exhausted: bool,
    pending_offset: Option<usize>,
    last_receipt: i64,
}

impl IncrementalRowAccumulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            time_field: None,
            rows: Vec::new(),
            total: 0,
            exhausted: false,
            pending_offset: None,
            last_receipt: i64::MIN,
        }
    }

    /// Values of this field are normalized to `YYYY-MM-DD HH:MM:SS.mmm`.
    pub fn set_time_field(&mut self, time_field: Option<String>) {
        self.time_field = time_field;
    }

    pub fn rows(&self) -> &[RowRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row count reported by the backend for the whole query.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted && (self.rows.len() as u64) < self.total
    }

    pub fn fetch_in_flight(&self) -> bool {
        self.pending_offset.is_some()
    }

    pub fn can_load_more(&self) -> bool {
        self.has_more() && !self.fetch_in_flight()
    }

    /// Offset of the next page.
    pub fn next_offset(&self) -> usize {
        self.rows.len()
    }

    /// Records that a fetch at `offset` was issued.
    pub fn begin_fetch(&mut self, offset: usize) {
        self.pending_offset = Some(offset);
    }

    /// The outstanding fetch was cancelled; the buffer is untouched.
    pub fn fetch_cancelled(&mut self) {
        self.pending_offset = None;
    }

    /// The outstanding fetch failed: rows are cleared and load-more disabled.
    pub fn fetch_failed(&mut self) {
        self.pending_offset = None;
        self.rows.clear();
        self.total = 0;
        self.exhausted = true;
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.total = 0;
        self.exhausted = false;
        self.pending_offset = None;
    }

    pub fn on_batch_arrived(
        &mut self,
        batch: Vec<Map<String, Value>>,
        requested_offset: usize,
        total: u64,
    ) -> BatchEffect {
        self.pending_offset = None;
        self.total = total;

        if requested_offset == 0 {
            self.exhausted = false;
            let incoming = self.records(batch);
            let identical = !incoming.is_empty()
                && incoming.len() == self.rows.len()
                && incoming.iter().zip(&self.rows).all(|(a, b)| a.same_content(b));
            if identical {
                return BatchEffect::Unchanged;
            }
            self.rows = incoming;
            return BatchEffect::Replaced;
        }

        if batch.is_empty() {
            self.exhausted = true;
            return BatchEffect::Exhausted;
        }

        let mut incoming = self.records(batch);
        let overlap = self.seam_overlap(&incoming);
        if overlap > 0 {
            tracing::debug!(overlap, requested_offset, "dropping rows repeated at page seam");
            incoming.drain(..overlap);
        }
        let added = incoming.len();
        self.rows.extend(incoming);
        BatchEffect::Appended { added, overlap }
    }

    /// Length of the longest run at the head of `incoming` that repeats the
    /// tail of the buffer.
    fn seam_overlap(&self, incoming: &[RowRecord]) -> usize {
        let longest = incoming.len().min(self.rows.len());
        (1..=longest)
            .rev()
            .find(|&k| {
                let tail = &self.rows[self.rows.len() - k..];
                tail.iter()
                    .zip(&incoming[..k])
                    .all(|(a, b)| a.same_content(b))
            })
            .unwrap_or(0)
    }

    fn records(&mut self, batch: Vec<Map<String, Value>>) -> Vec<RowRecord> {
        let receipt = self.clock.epoch_millis().max(self.last_receipt.saturating_add(1));
        self.last_receipt = receipt;
        batch
            .into_iter()
            .enumerate()
            .map(|(index, mut fields)| {
                if let Some(time_field) = &self.time_field {
                    normalize_time_value(&mut fields, time_field);
                }
                RowRecord {
                    record_key: RecordKey::new(receipt, index),
                    original_source: Arc::new(fields.clone()),
                    fields,
                }
            })
            .collect()
    }
}

fn normalize_time_value(fields: &mut Map<String, Value>, time_field: &str) {
    if let Some(Value::String(text)) = fields.get_mut(time_field) {
        if let Some(parsed) = parse_datetime(text) {
            *text = format_datetime(&parsed);
        }
    }
}
