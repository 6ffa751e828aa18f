//! Shareable query links.
//!
//! A query is flattened into string key/value pairs suitable for a URL query
//! string. Offset and page size are not part of a shared query. List values
//! are JSON arrays. Decoding never fails: malformed values are logged and
//! replaced with defaults.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{SearchParams, SortField, TimeGrouping};
use crate::time_range::{TimeRangeResolver, TimeSpec, format_datetime, parse_datetime};

const MODULE: &str = "module";
const DATASOURCE_ID: &str = "datasourceId";
const TIME_RANGE: &str = "timeRange";
const START_TIME: &str = "startTime";
const END_TIME: &str = "endTime";
const TIME_GROUPING: &str = "timeGrouping";
const KEYWORDS: &str = "keywords";
const WHERE_SQLS: &str = "whereSqls";
const FIELDS: &str = "fields";
const SORT_FIELDS: &str = "sortFields";

/// Flattens `params` into a shareable map. Empty lists are omitted.
pub fn to_query_map(params: &SearchParams) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(module) = &params.module {
        map.insert(MODULE.to_string(), module.clone());
    }
    if let Some(datasource_id) = params.datasource_id {
        map.insert(DATASOURCE_ID.to_string(), datasource_id.to_string());
    }
    map.insert(TIME_RANGE.to_string(), params.time_range.to_string());
    if let Some(start) = &params.start_time {
        map.insert(START_TIME.to_string(), format_datetime(start));
    }
    if let Some(end) = &params.end_time {
        map.insert(END_TIME.to_string(), format_datetime(end));
    }
    map.insert(
        TIME_GROUPING.to_string(),
        params.time_grouping.as_str().to_string(),
    );
    insert_list(&mut map, KEYWORDS, &params.keywords);
    insert_list(&mut map, WHERE_SQLS, &params.where_predicates);
    insert_list(&mut map, FIELDS, &params.active_fields);
    insert_list(&mut map, SORT_FIELDS, &params.sort_fields);
    map
}

fn insert_list<T: Serialize>(map: &mut BTreeMap<String, String>, key: &str, values: &[T]) {
    if values.is_empty() {
        return;
    }
    match serde_json::to_string(values) {
        Ok(json) => {
            map.insert(key.to_string(), json);
        }
        Err(err) => tracing::warn!(key, error = %err, "failed to encode shared list"),
    }
}

/// Rebuilds a query from a shared map.
///
/// The time mode is preserved: quick and relative ranges are resolved
/// against the current instant, absolute ranges keep their bounds. A map with
/// no usable `timeRange` but with both bounds is read as an absolute range.
pub fn from_query_map<I, K, V>(pairs: I, resolver: &TimeRangeResolver) -> SearchParams
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let map: BTreeMap<String, String> = pairs
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    let get = |key: &str| map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let datasource_id = get(DATASOURCE_ID).and_then(|v| match v.parse::<i64>() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(value = v, "ignoring malformed shared datasource id");
            None
        }
    });

    let bounds = match (get(START_TIME).and_then(parse_datetime), get(END_TIME).and_then(parse_datetime)) {
        (Some(start), Some(end)) if start <= end => Some((start, end)),
        _ => None,
    };
    let time_range = match get(TIME_RANGE).map(str::parse::<TimeSpec>) {
        Some(Ok(spec)) => spec,
        parsed => {
            if let Some(Err(err)) = parsed {
                tracing::warn!(error = %err, "ignoring malformed shared time range");
            }
            match bounds {
                Some((start, end)) => TimeSpec::Absolute { start, end },
                None => TimeSpec::default(),
            }
        }
    };
    let range = resolver.resolve(&time_range);

    let time_grouping = get(TIME_GROUPING)
        .map(|v| {
            v.parse::<TimeGrouping>().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "ignoring malformed shared time grouping");
                TimeGrouping::default()
            })
        })
        .unwrap_or_default();

    SearchParams {
        module: get(MODULE).map(str::to_string),
        datasource_id,
        start_time: Some(range.start),
        end_time: Some(range.end),
        time_range,
        time_grouping,
        keywords: read_list(get(KEYWORDS), KEYWORDS),
        where_predicates: read_list(get(WHERE_SQLS), WHERE_SQLS),
        active_fields: read_list(get(FIELDS), FIELDS),
        sort_fields: read_list::<SortField>(get(SORT_FIELDS), SORT_FIELDS),
        ..SearchParams::default()
    }
}

fn read_list<T: DeserializeOwned>(value: Option<&str>, key: &str) -> Vec<T> {
    let Some(value) = value else {
        return Vec::new();
    };
    serde_json::from_str(value).unwrap_or_else(|err| {
        tracing::warn!(key, error = %err, "ignoring malformed shared list");
        Vec::new()
    })
}
