//! Multi-column ordering of buffered rows.

use std::cmp::Ordering;

use serde_json::Value;

use crate::accumulator::RowRecord;
use crate::model::{SortDirection, SortField};
use crate::table::columns::{ColumnSet, is_numeric};

/// Orders two cell values. Missing and null values sort first.
///
/// With `numeric`, values that parse as numbers (NaN excluded) compare
/// numerically and sort before values that don't. Two unparsable values fall
/// back to text order.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>, numeric: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a), Some(b)) => (a, b),
    };

    if numeric {
        match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => return x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => {}
        }
    }
    as_text(a).cmp(&as_text(b))
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| !n.is_nan())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keeps sort entries for sortable columns of the set, first entry per
/// column wins.
pub fn sanitize_sort(sort_fields: &[SortField], columns: &ColumnSet) -> Vec<SortField> {
    let mut kept: Vec<SortField> = Vec::with_capacity(sort_fields.len());
    for sort in sort_fields {
        let sortable = columns.get(&sort.field_name).is_some_and(|c| c.sortable);
        if !sortable {
            tracing::debug!(field = %sort.field_name, "ignoring sort on unsortable column");
            continue;
        }
        if kept.iter().all(|k| k.field_name != sort.field_name) {
            kept.push(sort.clone());
        }
    }
    kept
}

/// Rows ordered by `sort_fields`, earlier fields taking precedence. Rows that
/// compare equal keep their buffer order.
pub fn sorted_rows<'a>(
    rows: &'a [RowRecord],
    sort_fields: &[SortField],
    columns: &ColumnSet,
) -> Vec<&'a RowRecord> {
    let keys: Vec<(&str, bool, SortDirection)> = sort_fields
        .iter()
        .map(|s| {
            let numeric = columns.get(&s.field_name).is_some_and(|c| is_numeric(&c.data_type));
            (s.field_name.as_str(), numeric, s.direction)
        })
        .collect();

    let mut view: Vec<&RowRecord> = rows.iter().collect();
    if keys.is_empty() {
        return view;
    }
    view.sort_by(|a, b| {
        for (field, numeric, direction) in &keys {
            let ordering = compare_values(a.get(field), b.get(field), *numeric);
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    view
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::MockClock;
    use rstest::rstest;
    use serde_json::{Map, json};

    use super::*;
    use crate::accumulator::IncrementalRowAccumulator;
    use crate::model::ColumnInfo;

    #[rstest]
    #[case(json!(2), json!(10), Ordering::Less)]
    #[case(json!("2"), json!("10"), Ordering::Less)]
    #[case(json!("1.5"), json!(1.25), Ordering::Greater)]
    #[case(json!("abc"), json!(3), Ordering::Greater)]
    #[case(json!("NaN"), json!(3), Ordering::Greater)]
    #[case(json!("b"), json!("a"), Ordering::Greater)]
    fn should_compare_numeric_values(
        #[case] a: Value,
        #[case] b: Value,
        #[case] expected: Ordering,
    ) {
        assert_eq!(compare_values(Some(&a), Some(&b), true), expected);
    }

    #[test]
    fn should_sort_nulls_first() {
        let value = json!("x");
        assert_eq!(compare_values(None, Some(&value), false), Ordering::Less);
        assert_eq!(
            compare_values(Some(&Value::Null), Some(&value), true),
            Ordering::Less
        );
        assert_eq!(compare_values(None, Some(&Value::Null), false), Ordering::Equal);
    }

    #[test]
    fn should_compare_text_lexically_when_not_numeric() {
        let (a, b) = (json!("10"), json!("9"));
        assert_eq!(compare_values(Some(&a), Some(&b), false), Ordering::Less);
    }

    fn columns() -> ColumnSet {
        ColumnSet::new(
            vec![
                ColumnInfo::new("log_time", "DATETIME"),
                ColumnInfo::new("level", "VARCHAR(8)"),
                ColumnInfo::new("latency", "BIGINT"),
                ColumnInfo::new("body", "LONGTEXT"),
            ],
            "log_time",
            &[],
        )
    }

    #[test]
    fn should_drop_unsortable_and_repeated_sort_fields() {
        // given
        let sort = vec![
            SortField::new("body", SortDirection::Asc),
            SortField::new("level", SortDirection::Desc),
            SortField::new("level", SortDirection::Asc),
            SortField::new("unknown", SortDirection::Asc),
        ];

        // when
        let sanitized = sanitize_sort(&sort, &columns());

        // then
        assert_eq!(sanitized, vec![SortField::new("level", SortDirection::Desc)]);
    }

    #[test]
    fn should_sort_rows_by_multiple_fields() {
        // given
        let batch: Vec<Map<String, Value>> = [
            json!({"level": "WARN", "latency": "30"}),
            json!({"level": "ERROR", "latency": 5}),
            json!({"level": "WARN", "latency": 100}),
            json!({"level": "ERROR", "latency": null}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        let mut acc = IncrementalRowAccumulator::new(Arc::new(MockClock::with_millis(0)));
        acc.on_batch_arrived(batch, 0, 4);
        let sort = vec![
            SortField::new("level", SortDirection::Asc),
            SortField::new("latency", SortDirection::Desc),
        ];

        // when
        let sorted = sorted_rows(acc.rows(), &sort, &columns());

        // then
        let latencies: Vec<Value> = sorted
            .iter()
            .map(|r| r.get("latency").cloned().unwrap_or(Value::Null))
            .collect();
        assert_eq!(
            latencies,
            vec![json!(5), Value::Null, json!(100), json!("30")]
        );
    }
}
