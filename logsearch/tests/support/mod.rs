//! Scripted in-process backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::MockClock;
use common::storage::in_memory::InMemoryStore;
use logsearch::model::{FieldDistributionData, HistogramPoint, ValueDistribution};
use logsearch::time_range::{format_datetime, parse_datetime};
use logsearch::{
    ColumnInfo, DetailPage, DistributionResponse, Error, HistogramData, ModuleQueryConfig, Result,
    SearchBackend, SearchParams, SearchSession, SessionOptions, TabMirror,
};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

/// Wednesday 2024-03-13 10:17:42.123 UTC.
pub const NOW: &str = "2024-03-13 10:17:42.123";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Details,
    Histogram,
    Distributions,
    Columns,
    QueryConfig,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub kind: CallKind,
    pub module: String,
    pub params: Option<SearchParams>,
}

struct State {
    rows: Vec<Map<String, Value>>,
    columns: Vec<ColumnInfo>,
    time_field: Option<String>,
    latency: Duration,
    failing: HashSet<CallKind>,
    calls: Vec<Call>,
}

/// Serves a fixed table of rows, filtered by `field = 'value'` and
/// `field != 'value'` predicates, and records every call.
pub struct ScriptedBackend {
    state: Mutex<State>,
}

impl ScriptedBackend {
    pub fn new(rows: Vec<Map<String, Value>>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            state: Mutex::new(State {
                rows,
                columns,
                time_field: Some("log_time".to_string()),
                latency: Duration::ZERO,
                failing: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// `count` order log lines, newest first. Every fourth line is `OK`, the
    /// rest are `ERROR`.
    pub fn orders(count: usize) -> Self {
        let rows = (0..count).map(order_row).collect();
        Self::new(rows, order_columns())
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_failing(&self, kind: CallKind, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(kind);
        } else {
            state.failing.remove(&kind);
        }
    }

    /// A new line arrives at the head of the result set.
    pub fn insert_front(&self, row: Map<String, Value>) {
        self.lock().rows.insert(0, row);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<SearchParams> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .filter_map(|c| c.params.clone())
            .collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, kind: CallKind, module: &str, params: Option<&SearchParams>) -> Result<Duration> {
        let mut state = self.lock();
        state.calls.push(Call {
            kind,
            module: module.to_string(),
            params: params.cloned(),
        });
        if state.failing.contains(&kind) {
            return Err(Error::Server {
                code: "5000".to_string(),
                message: format!("{:?} unavailable", kind),
            });
        }
        Ok(state.latency)
    }

    async fn respond(
        &self,
        kind: CallKind,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<Map<String, Value>>> {
        let module = params.module.clone().unwrap_or_default();
        let latency = self.record(kind, &module, Some(params))?;
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        let rows = self.lock().rows.clone();
        Ok(rows
            .into_iter()
            .filter(|row| params.where_predicates.iter().all(|p| matches(row, p)))
            .collect())
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn fetch_log_details(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DetailPage> {
        let rows = self.respond(CallKind::Details, params, cancel).await?;
        let total_count = rows.len() as u64;
        Ok(DetailPage {
            rows: rows
                .into_iter()
                .skip(params.offset)
                .take(params.page_size)
                .collect(),
            total_count,
            ..DetailPage::default()
        })
    }

    async fn fetch_log_histogram(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<HistogramData> {
        let rows = self.respond(CallKind::Histogram, params, cancel).await?;
        Ok(HistogramData {
            distribution_data: vec![HistogramPoint {
                time_point: "2024-03-13 10:00:00".to_string(),
                count: rows.len() as u64,
            }],
            time_unit: "minute".to_string(),
            time_interval: 1,
        })
    }

    async fn fetch_distributions(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DistributionResponse> {
        let rows = self.respond(CallKind::Distributions, params, cancel).await?;
        let field_distributions = params
            .active_fields
            .iter()
            .map(|field| distribution(field, &rows))
            .collect();
        Ok(DistributionResponse {
            field_distributions,
            sample_size: rows.len() as u64,
        })
    }

    async fn fetch_columns(&self, _datasource_id: i64, module: &str) -> Result<Vec<ColumnInfo>> {
        self.record(CallKind::Columns, module, None)?;
        Ok(self.lock().columns.clone())
    }

    async fn get_module_query_config(&self, module: &str) -> Result<ModuleQueryConfig> {
        self.record(CallKind::QueryConfig, module, None)?;
        Ok(ModuleQueryConfig {
            module: module.to_string(),
            time_field: self.lock().time_field.clone(),
            ..ModuleQueryConfig::default()
        })
    }
}

fn matches(row: &Map<String, Value>, predicate: &str) -> bool {
    let (field, value, equal) = match predicate.split_once("!=") {
        Some((field, value)) => (field, value, false),
        None => match predicate.split_once('=') {
            Some((field, value)) => (field, value, true),
            None => return true,
        },
    };
    let expected = value.trim().trim_matches('\'');
    let actual = match row.get(field.trim()) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    (actual == expected) == equal
}

fn distribution(field: &str, rows: &[Map<String, Value>]) -> FieldDistributionData {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut null_count = 0;
    for row in rows {
        match row.get(field) {
            None | Some(Value::Null) => null_count += 1,
            Some(Value::String(s)) => *counts.entry(s.clone()).or_default() += 1,
            Some(other) => *counts.entry(other.to_string()).or_default() += 1,
        }
    }
    let total = rows.len() as u64;
    let mut values: Vec<ValueDistribution> = counts
        .into_iter()
        .map(|(value, count)| ValueDistribution {
            value: Value::String(value),
            count,
            percentage: if total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / total as f64
            },
        })
        .collect();
    values.sort_by(|a, b| b.count.cmp(&a.count));
    FieldDistributionData {
        field_name: field.to_string(),
        unique_count: values.len() as u64,
        value_distributions: values.into_iter().take(5).collect(),
        total_count: total,
        non_null_count: total - null_count,
        null_count,
    }
}

pub fn order_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("log_time", "DATETIME"),
        ColumnInfo::new("host", "VARCHAR(64)"),
        ColumnInfo::new("log_offset", "BIGINT"),
        ColumnInfo::new("status", "VARCHAR(16)"),
        ColumnInfo::new("message", "TEXT"),
        ColumnInfo::new("payload", "JSON"),
    ]
}

/// The `index`-th newest order line, one second apart.
pub fn order_row(index: usize) -> Map<String, Value> {
    let newest = parse_datetime("2024-03-13 10:15:00").unwrap();
    let time = newest - chrono::Duration::seconds(index as i64);
    let status = if index % 4 == 3 { "OK" } else { "ERROR" };
    object(json!({
        "log_time": format_datetime(&time).replace(' ', "T"),
        "host": format!("web-{}", index % 3),
        "log_offset": index,
        "status": status,
        "message": format!("order {} processed", index),
    }))
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

pub fn clock() -> Arc<MockClock> {
    let millis = parse_datetime(NOW).unwrap().and_utc().timestamp_millis();
    Arc::new(MockClock::with_millis(millis))
}

pub fn options() -> SessionOptions {
    SessionOptions::new(clock())
}

pub fn mirror(store: Arc<InMemoryStore>) -> TabMirror {
    TabMirror::new(store, "tab-1")
}

pub fn session(backend: &Arc<ScriptedBackend>) -> SearchSession {
    SearchSession::new(backend.clone(), options())
}

/// A session with "orders" loaded and its first results settled. The
/// backend's call log starts out empty.
pub async fn loaded_session(backend: &Arc<ScriptedBackend>) -> SearchSession {
    let mut session = session(backend);
    session.select_module("orders", 1).await.unwrap();
    session.settle().await;
    backend.clear_calls();
    session
}
