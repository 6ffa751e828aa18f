//! Presentation state of the result table.
//!
//! [`VirtualizedTableState`] holds column, sort and expansion state only. It
//! reads rows from the accumulator and never changes them.

pub mod columns;
pub mod expansion;
pub mod sort;

use crate::accumulator::{RecordKey, RowRecord};
use crate::error::{Error, Result};
use crate::model::{ColumnInfo, SortField};
use crate::params::ChangeSet;

pub use columns::{
    ColumnDescriptor, ColumnSet, FALLBACK_TIME_FIELD, ToggleOutcome, auto_width,
    determine_time_field, is_numeric, is_sortable,
};
pub use expansion::{ContentFingerprint, ExpansionEntry, ExpansionState, fingerprint};
pub use sort::{compare_values, sanitize_sort, sorted_rows};

pub const DEFAULT_SCREEN_WIDTH: u32 = 1920;

pub struct VirtualizedTableState {
    columns: ColumnSet,
    sort: Vec<SortField>,
    expansion: ExpansionState,
    screen_width: u32,
}

impl Default for VirtualizedTableState {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualizedTableState {
    pub fn new() -> Self {
        Self {
            columns: ColumnSet::default(),
            sort: Vec::new(),
            expansion: ExpansionState::new(),
            screen_width: DEFAULT_SCREEN_WIDTH,
        }
    }

    /// Replaces the column set for a newly selected module. Sort and
    /// expansion start over.
    pub fn load_columns(&mut self, columns: Vec<ColumnInfo>, time_field: &str, active: &[String]) {
        self.columns = ColumnSet::new(columns, time_field, active);
        self.sort.clear();
        self.expansion.reset();
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    pub fn time_field(&self) -> &str {
        self.columns.time_field()
    }

    pub fn toggle_column(&mut self, name: &str) -> Result<ToggleOutcome> {
        self.columns.toggle(name)
    }

    pub fn active_fields(&self) -> Vec<String> {
        self.columns.active_fields()
    }

    pub fn set_screen_width(&mut self, screen_width: u32) {
        self.screen_width = screen_width;
    }

    pub fn set_column_width(&mut self, name: &str, width: u32) -> Result<()> {
        if width == 0 {
            return Err(Error::InvalidInput(format!("zero width for column {}", name)));
        }
        self.columns.set_width(name, width)
    }

    pub fn column_width(&self, name: &str) -> u32 {
        self.columns.width(name, self.screen_width)
    }

    /// Applies a sort configuration and returns what was kept.
    pub fn set_sort(&mut self, sort_fields: &[SortField]) -> Vec<SortField> {
        self.sort = sanitize_sort(sort_fields, &self.columns);
        self.sort.clone()
    }

    pub fn sort(&self) -> &[SortField] {
        &self.sort
    }

    /// `rows` in the current sort order.
    pub fn view<'a>(&self, rows: &'a [RowRecord]) -> Vec<&'a RowRecord> {
        sorted_rows(rows, &self.sort, &self.columns)
    }

    pub fn expansion(&self) -> &ExpansionState {
        &self.expansion
    }

    pub fn is_expanded(&self, key: &RecordKey) -> bool {
        self.expansion.is_expanded(key)
    }

    /// Expands or collapses the row with `key`. Returns whether it is now
    /// expanded.
    pub fn toggle_expand(&mut self, rows: &[RowRecord], key: &RecordKey) -> Result<bool> {
        let record = rows
            .iter()
            .find(|r| &r.record_key == key)
            .ok_or_else(|| Error::InvalidInput(format!("no row with key {}", key)))?;
        let time_field = self.columns.time_field().to_string();
        Ok(self.expansion.toggle(record, &time_field))
    }

    /// Reacts to a committed query change. Important changes, and a return to
    /// the first page without a field change, collapse every row.
    pub fn on_params_changed(&mut self, changes: &ChangeSet, offset_reset: bool) {
        if changes.is_important() || (offset_reset && !changes.active_fields) {
            if !self.expansion.is_empty() {
                tracing::debug!("collapsing expanded rows after query change");
            }
            self.expansion.reset();
        }
    }

    /// Follows the row buffer after new data arrived.
    pub fn on_rows_replaced(&mut self, rows: &[RowRecord]) -> bool {
        let time_field = self.columns.time_field().to_string();
        self.expansion.reconcile(rows, &time_field)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use common::MockClock;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::accumulator::IncrementalRowAccumulator;
    use crate::model::SortDirection;

    fn batch(ids: &[u64]) -> Vec<Map<String, Value>> {
        ids.iter()
            .filter_map(|id| {
                json!({
                    "log_time": format!("2024-03-13 10:00:{:02}.000", id),
                    "host": "web-1",
                    "log_offset": id,
                })
                .as_object()
                .cloned()
            })
            .collect()
    }

    fn table() -> VirtualizedTableState {
        let mut table = VirtualizedTableState::new();
        table.load_columns(
            vec![
                ColumnInfo::new("log_time", "DATETIME"),
                ColumnInfo::new("host", "VARCHAR(64)"),
                ColumnInfo::new("log_offset", "BIGINT"),
                ColumnInfo::new("body", "JSON"),
            ],
            "log_time",
            &["host".to_string()],
        );
        table
    }

    #[test]
    fn should_keep_expansion_across_unrelated_refresh() {
        // given
        let clock = Arc::new(MockClock::with_millis(0));
        let mut acc = IncrementalRowAccumulator::new(clock.clone());
        acc.on_batch_arrived(batch(&[1, 2, 3]), 0, 3);
        let mut table = table();
        let key = acc.rows()[1].record_key.clone();
        assert!(table.toggle_expand(acc.rows(), &key).unwrap());

        // when
        table.on_params_changed(
            &ChangeSet {
                active_fields: true,
                ..ChangeSet::default()
            },
            false,
        );
        clock.advance(Duration::from_millis(300));
        acc.on_batch_arrived(batch(&[0, 1, 2, 3]), 0, 4);
        table.on_rows_replaced(acc.rows());

        // then
        assert!(table.is_expanded(&acc.rows()[2].record_key));
        assert_eq!(table.expansion().entries().len(), 1);
    }

    #[test]
    fn should_collapse_rows_when_time_range_changes() {
        // given
        let clock = Arc::new(MockClock::with_millis(0));
        let mut acc = IncrementalRowAccumulator::new(clock);
        acc.on_batch_arrived(batch(&[1]), 0, 1);
        let mut table = table();
        let key = acc.rows()[0].record_key.clone();
        table.toggle_expand(acc.rows(), &key).unwrap();

        // when
        table.on_params_changed(
            &ChangeSet {
                time: true,
                ..ChangeSet::default()
            },
            true,
        );

        // then
        assert!(table.expansion().is_empty());
    }

    #[test]
    fn should_collapse_rows_when_sort_resets_to_first_page() {
        // given
        let clock = Arc::new(MockClock::with_millis(0));
        let mut acc = IncrementalRowAccumulator::new(clock);
        acc.on_batch_arrived(batch(&[1]), 0, 1);
        let mut table = table();
        let key = acc.rows()[0].record_key.clone();
        table.toggle_expand(acc.rows(), &key).unwrap();

        // when
        table.on_params_changed(
            &ChangeSet {
                sort: true,
                offset: true,
                ..ChangeSet::default()
            },
            true,
        );

        // then
        assert!(table.expansion().is_empty());
    }

    #[test]
    fn should_reject_expanding_unknown_row() {
        let mut table = table();
        let missing = RecordKey::new(0, 99);
        assert!(table.toggle_expand(&[], &missing).is_err());
    }

    #[test]
    fn should_sort_view_without_touching_rows() {
        // given
        let clock = Arc::new(MockClock::with_millis(0));
        let mut acc = IncrementalRowAccumulator::new(clock);
        acc.on_batch_arrived(batch(&[3, 10, 2]), 0, 3);
        let mut table = table();

        // when
        let kept = table.set_sort(&[
            SortField::new("body", SortDirection::Asc),
            SortField::new("log_offset", SortDirection::Asc),
        ]);
        let view = table.view(acc.rows());

        // then
        assert_eq!(kept, vec![SortField::new("log_offset", SortDirection::Asc)]);
        let offsets: Vec<u64> = view
            .iter()
            .filter_map(|r| r.get("log_offset").and_then(Value::as_u64))
            .collect();
        assert_eq!(offsets, vec![2, 3, 10]);
        assert_eq!(acc.rows()[0].get("log_offset"), Some(&json!(3)));
    }

    #[test]
    fn should_reject_zero_column_width() {
        let mut table = table();
        assert!(table.set_column_width("host", 0).is_err());
        table.set_column_width("host", 260).unwrap();
        assert_eq!(table.column_width("host"), 260);
    }
}
