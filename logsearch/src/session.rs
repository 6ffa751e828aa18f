//! The console session: one owner for the query, its requests and the
//! state they populate.
//!
//! [`SearchSession`] is driven from a single task. User actions are plain
//! method calls that commit to the params store and hand the resulting event
//! to the orchestrator. [`next_event`](SearchSession::next_event) is the only
//! await point: it waits for a completed request, a debounce deadline or an
//! auto-refresh tick and reports what changed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc, Weekday};
use common::{Clock, SystemClock};
use serde_json::Value;
use tokio::time::{Instant, sleep_until};

use crate::accumulator::{BatchEffect, RecordKey, RowRecord};
use crate::backend::SearchBackend;
use crate::config::ConsoleConfig;
use crate::distribution::{DistributionCache, DistributionChange, RequestDecision};
use crate::error::{Error, Result};
use crate::histogram::HistogramState;
use crate::metrics::Metrics;
use crate::model::{ColumnInfo, DEFAULT_PAGE_SIZE, SearchParams, SortField, TimeGrouping};
use crate::orchestrator::{DEFAULT_DEBOUNCE, Dispatch, ModuleContext, RequestOrchestrator, Update};
use crate::params::{ParamsEvent, SearchParamsStore, SearchParamsUpdate, Trigger, toggle_value_filter};
use crate::persist::TabMirror;
use crate::request::{Completion, Dispatcher};
use crate::table::{ToggleOutcome, VirtualizedTableState, determine_time_field};
use crate::time_range::{TimeRangeResolver, TimeSpec};

/// Everything a session needs besides its backend.
#[derive(Clone)]
pub struct SessionOptions {
    pub clock: Arc<dyn Clock>,
    pub utc_offset: FixedOffset,
    pub week_start: Weekday,
    pub debounce: Duration,
    pub page_size: usize,
    pub default_time_range: TimeSpec,
    pub time_grouping: TimeGrouping,
    pub auto_refresh: Option<Duration>,
    pub mirror: Option<TabMirror>,
    pub metrics: Arc<Metrics>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SessionOptions {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            utc_offset: Utc.fix(),
            week_start: Weekday::Mon,
            debounce: DEFAULT_DEBOUNCE,
            page_size: DEFAULT_PAGE_SIZE,
            default_time_range: TimeSpec::default(),
            time_grouping: TimeGrouping::default(),
            auto_refresh: None,
            mirror: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn from_config(config: &ConsoleConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            utc_offset: config.utc_offset()?,
            week_start: config.week_start()?,
            debounce: config.debounce()?,
            page_size: config.page_size,
            default_time_range: config.default_time_range(),
            time_grouping: config.time_grouping,
            auto_refresh: config.auto_refresh()?,
            ..Self::new(clock)
        })
    }

    pub fn with_mirror(mut self, mirror: TabMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// What [`SearchSession::next_event`] observed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A debounce deadline or auto-refresh tick acted on the query.
    Dispatched(Dispatch),
    RowsUpdated {
        effect: BatchEffect,
        offset: usize,
        rows: usize,
        total: u64,
    },
    DetailFailed(Error),
    HistogramUpdated { total: u64 },
    HistogramFailed(Error),
    DistributionsUpdated { fields: Vec<String> },
    DistributionsFailed { fields: Vec<String>, error: Error },
}

struct AutoRefresh {
    interval: Duration,
    next_tick: Instant,
}

pub struct SearchSession {
    backend: Arc<dyn SearchBackend>,
    store: SearchParamsStore,
    orchestrator: RequestOrchestrator,
    table: VirtualizedTableState,
    auto_refresh: Option<AutoRefresh>,
}

impl SearchSession {
    /// Creates a session. With a mirror, the query starts from the tab's
    /// last snapshot; [`resume`](Self::resume) then reloads its module.
    pub fn new(backend: Arc<dyn SearchBackend>, options: SessionOptions) -> Self {
        let resolver = TimeRangeResolver::new(options.clock.clone())
            .with_offset(options.utc_offset)
            .with_week_start(options.week_start);
        let defaults = SearchParams {
            time_range: options.default_time_range,
            time_grouping: options.time_grouping,
            page_size: options.page_size,
            ..SearchParams::default()
        };
        let store = match options.mirror {
            Some(mirror) => SearchParamsStore::restore(defaults, resolver, mirror),
            None => SearchParamsStore::new(defaults, resolver),
        };
        let (dispatcher, completions) = Dispatcher::new(backend.clone(), options.metrics);
        let orchestrator =
            RequestOrchestrator::new(dispatcher, completions, options.clock, options.debounce);

        let mut session = Self {
            backend,
            store,
            orchestrator,
            table: VirtualizedTableState::new(),
            auto_refresh: None,
        };
        session.set_auto_refresh(options.auto_refresh);
        session
    }

    pub fn params(&self) -> Arc<SearchParams> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &SearchParamsStore {
        &self.store
    }

    pub fn rows(&self) -> &[RowRecord] {
        self.orchestrator.rows().rows()
    }

    /// Rows in the table's current sort order.
    pub fn view(&self) -> Vec<&RowRecord> {
        self.table.view(self.orchestrator.rows().rows())
    }

    pub fn total(&self) -> u64 {
        self.orchestrator.rows().total()
    }

    pub fn can_load_more(&self) -> bool {
        self.orchestrator.rows().can_load_more()
    }

    pub fn histogram(&self) -> &HistogramState {
        self.orchestrator.histogram()
    }

    pub fn distributions(&self) -> &DistributionCache {
        self.orchestrator.distributions()
    }

    pub fn table(&self) -> &VirtualizedTableState {
        &self.table
    }

    pub fn set_screen_width(&mut self, screen_width: u32) {
        self.table.set_screen_width(screen_width);
    }

    pub fn context(&self) -> Option<&ModuleContext> {
        self.orchestrator.context()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.orchestrator.metrics()
    }

    /// True when nothing is in flight or waiting on the debounce timer.
    pub fn is_idle(&self) -> bool {
        self.orchestrator.is_idle()
    }

    /// Loads `module`'s query config and columns and makes it the query
    /// target.
    ///
    /// Re-selecting the current target keeps the query and drops active
    /// fields the module no longer has. Selecting another module clears
    /// keywords, predicates, sort and fields.
    pub async fn select_module(&mut self, module: &str, datasource_id: i64) -> Result<Dispatch> {
        let (config, columns) = futures::try_join!(
            self.backend.get_module_query_config(module),
            self.backend.fetch_columns(datasource_id, module),
        )?;
        let columns: Vec<ColumnInfo> = columns
            .into_iter()
            .filter(|c| !config.exclude_fields.contains(&c.column_name))
            .collect();
        let time_field = determine_time_field(config.time_field.as_deref(), &columns);

        let previous = self.store.snapshot();
        let same_target = previous.module.as_deref() == Some(module)
            && previous.datasource_id == Some(datasource_id);

        self.table.load_columns(columns.clone(), &time_field, &[]);
        if same_target {
            let kept = self.table.columns().retain_known(&previous.active_fields);
            self.table.load_columns(columns.clone(), &time_field, &kept);
        }
        tracing::info!(module, datasource_id, %time_field, columns = columns.len(), "module selected");
        self.orchestrator.set_context(ModuleContext {
            module: module.to_string(),
            datasource_id,
            config,
            time_field,
            columns,
        });

        let mut update = SearchParamsUpdate::new()
            .module(module)
            .datasource_id(datasource_id)
            .active_fields(self.table.active_fields());
        if !same_target {
            update = update
                .keywords(Vec::<String>::new())
                .where_predicates(Vec::<String>::new())
                .sort_fields(Vec::new());
        }
        let event = self.store.update(update);
        let dispatch = self.after_commit(event);
        Ok(self
            .orchestrator
            .retry_deferred(self.store.snapshot())
            .unwrap_or(dispatch))
    }

    /// Reloads the module of a restored query and searches it. Returns
    /// `None` when the restored query has no target.
    pub async fn resume(&mut self) -> Result<Option<Dispatch>> {
        let snapshot = self.store.snapshot();
        let (Some(module), Some(datasource_id)) = (snapshot.module.clone(), snapshot.datasource_id)
        else {
            return Ok(None);
        };
        self.select_module(&module, datasource_id).await?;
        Ok(Some(self.search()))
    }

    /// Applies a query edit; fetching waits for the debounce interval.
    pub fn update(&mut self, partial: SearchParamsUpdate) -> Dispatch {
        let event = self.store.update(partial);
        self.after_commit(event)
    }

    /// Searches now, re-resolving relative time bounds. Repeats requests
    /// even when nothing changed.
    pub fn search(&mut self) -> Dispatch {
        let event = self.store.search();
        self.after_commit(event)
    }

    /// Fetches the next page of rows.
    pub fn load_more(&mut self) -> Dispatch {
        let rows = self.orchestrator.rows();
        if !rows.can_load_more() {
            return Dispatch::Ignored;
        }
        let next = rows.next_offset();
        let event = self.store.update(SearchParamsUpdate::new().offset(next));
        if event.trigger == Trigger::Pagination {
            self.after_commit(event)
        } else {
            // offset already points at the next page
            self.orchestrator.load_page(event)
        }
    }

    /// Shows or hides a column. The time field and fixed columns stay.
    pub fn toggle_column(&mut self, name: &str) -> Result<Dispatch> {
        match self.table.toggle_column(name)? {
            ToggleOutcome::Locked => Ok(Dispatch::Unchanged),
            ToggleOutcome::Selected | ToggleOutcome::Deselected => {
                let fields = self.table.active_fields();
                Ok(self.update(SearchParamsUpdate::new().active_fields(fields)))
            }
        }
    }

    /// Sorts by `sort_fields`; unsortable columns are ignored.
    pub fn set_sort(&mut self, sort_fields: &[SortField]) -> Dispatch {
        let kept = self.table.set_sort(sort_fields);
        self.update(SearchParamsUpdate::new().sort_fields(kept))
    }

    pub fn set_column_width(&mut self, name: &str, width: u32) -> Result<()> {
        self.table.set_column_width(name, width)
    }

    pub fn toggle_expand(&mut self, key: &RecordKey) -> Result<bool> {
        self.table
            .toggle_expand(self.orchestrator.rows().rows(), key)
    }

    /// Opens a field in the sidebar and fetches its distribution.
    pub fn expand_field(&mut self, field: &str) -> RequestDecision {
        let snapshot = self.store.snapshot();
        self.orchestrator
            .distributions_mut()
            .expand_field(field, &snapshot)
    }

    pub fn collapse_field(&mut self, field: &str) {
        self.orchestrator.distributions_mut().collapse_field(field);
    }

    /// Fetches distributions for `fields` in one request.
    pub fn request_distribution<S: AsRef<str>>(&mut self, fields: &[S]) -> RequestDecision {
        let snapshot = self.store.snapshot();
        self.orchestrator
            .distributions_mut()
            .request_distribution(fields, &snapshot)
    }

    /// Filters the query for (`include`) or against `field = value`.
    pub fn filter_by_value(&mut self, field: &str, value: &Value, include: bool) -> Dispatch {
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let snapshot = self.store.snapshot();
        let predicates = toggle_value_filter(&snapshot.where_predicates, field, &value, include);
        self.update(SearchParamsUpdate::new().where_predicates(predicates))
    }

    /// Searches every `interval`; `None` turns auto refresh off.
    pub fn set_auto_refresh(&mut self, interval: Option<Duration>) {
        self.auto_refresh = interval
            .filter(|i| !i.is_zero())
            .map(|interval| AutoRefresh {
                interval,
                next_tick: Instant::now() + interval,
            });
        tracing::info!(interval = ?interval, "auto refresh configured");
    }

    /// Favorites the current module, or clears the favorite if it already
    /// is. Returns the favorite afterwards.
    pub fn toggle_favorite_module(&mut self) -> Option<String> {
        let module = self.store.snapshot().module.clone()?;
        let mirror = self.store.mirror()?;
        mirror.toggle_favorite_module(&module)
    }

    pub fn favorite_module(&self) -> Option<String> {
        self.store.mirror().and_then(TabMirror::favorite_module)
    }

    fn after_commit(&mut self, event: ParamsEvent) -> Dispatch {
        let offset_reset = event.changes.offset && event.snapshot.offset == 0;
        self.table.on_params_changed(&event.changes, offset_reset);
        self.orchestrator.on_params_event(event)
    }

    /// Waits for the next state change.
    ///
    /// Returns `None` once nothing is in flight, no edit is waiting and auto
    /// refresh is off.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.next(true).await
    }

    /// Runs until every outstanding request has completed, ignoring auto
    /// refresh, and returns what happened.
    pub async fn settle(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next(false).await {
            events.push(event);
        }
        events
    }

    async fn next(&mut self, ticks: bool) -> Option<SessionEvent> {
        loop {
            let tick = if ticks {
                self.auto_refresh.as_ref().map(|a| a.next_tick)
            } else {
                None
            };
            if self.orchestrator.is_idle() && tick.is_none() {
                return None;
            }
            let deadline = self.orchestrator.deadline();

            tokio::select! {
                biased;
                completion = self.orchestrator.next_completion() => {
                    let completion = completion?;
                    if let Some(event) = self.apply(completion) {
                        return Some(event);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Some(SessionEvent::Dispatched(self.orchestrator.fire_pending()));
                }
                _ = sleep_until(tick.unwrap_or_else(Instant::now)), if tick.is_some() => {
                    if let Some(dispatch) = self.refresh_tick() {
                        return Some(SessionEvent::Dispatched(dispatch));
                    }
                }
            }
        }
    }

    fn refresh_tick(&mut self) -> Option<Dispatch> {
        let auto = self.auto_refresh.as_mut()?;
        auto.next_tick = Instant::now() + auto.interval;
        if self.orchestrator.detail_in_flight() {
            tracing::debug!("skipping auto refresh, detail fetch in flight");
            return None;
        }
        Some(self.search())
    }

    fn apply(&mut self, completion: Completion) -> Option<SessionEvent> {
        let event = match self.orchestrator.apply(completion)? {
            Update::Rows { effect, offset } => {
                let rows = self.orchestrator.rows();
                self.table.on_rows_replaced(rows.rows());
                SessionEvent::RowsUpdated {
                    effect,
                    offset,
                    rows: rows.len(),
                    total: rows.total(),
                }
            }
            Update::DetailFailed(error) => {
                self.table.on_rows_replaced(&[]);
                SessionEvent::DetailFailed(error)
            }
            Update::Histogram => SessionEvent::HistogramUpdated {
                total: self.orchestrator.histogram().total_count(),
            },
            Update::HistogramFailed(error) => SessionEvent::HistogramFailed(error),
            Update::Distributions(DistributionChange::Updated { fields }) => {
                SessionEvent::DistributionsUpdated { fields }
            }
            Update::Distributions(DistributionChange::Failed { fields, error }) => {
                SessionEvent::DistributionsFailed { fields, error }
            }
        };
        Some(event)
    }
}
