//! Fans query snapshots out to the detail, histogram and distribution
//! requests.
//!
//! The orchestrator reacts to [`ParamsEvent`]s from the params store:
//!
//! - edits are debounced, explicit searches run at once and page loads only
//!   fetch the next detail page;
//! - nothing is issued until a module, its query config and its columns are
//!   known; the latest event waits and is replayed when they are;
//! - each request type goes through its own [`RequestSlot`], so issuing
//!   cancels the previous request of that type and late responses are
//!   dropped;
//! - a request whose condition key matches the one last issued is skipped,
//!   unless the user explicitly searched.

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::accumulator::{BatchEffect, IncrementalRowAccumulator};
use crate::condition::ConditionKey;
use crate::distribution::{DistributionCache, DistributionChange, RequestDecision};
use crate::error::{Error, FetchOutcome};
use crate::histogram::HistogramState;
use crate::metrics::{Metrics, RequestKind};
use crate::model::{ColumnInfo, ModuleQueryConfig, SearchParams};
use crate::params::{ParamsEvent, Trigger};
use crate::request::{Completion, Dispatcher, Payload, RequestSlot};

/// Default quiet period before an edit is acted upon.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// What the orchestrator needs to know about the selected module before it
/// can query it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleContext {
    pub module: String,
    pub datasource_id: i64,
    pub config: ModuleQueryConfig,
    pub time_field: String,
    pub columns: Vec<ColumnInfo>,
}

impl ModuleContext {
    fn matches(&self, params: &SearchParams) -> bool {
        params.module.as_deref() == Some(self.module.as_str())
            && params.datasource_id == Some(self.datasource_id)
    }
}

/// How the orchestrator handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Requests went out.
    Issued {
        detail: bool,
        histogram: bool,
        distributions: bool,
    },
    /// Waiting for the debounce interval to pass.
    Debounced,
    /// Preconditions unmet; the event will be replayed.
    Deferred,
    /// Every request would repeat the last one issued.
    Unchanged,
    /// Nothing to do, e.g. a page load with no more rows.
    Ignored,
}

/// A completed request that changed session state.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Rows { effect: BatchEffect, offset: usize },
    DetailFailed(Error),
    Histogram,
    HistogramFailed(Error),
    Distributions(DistributionChange),
}

struct PendingEdit {
    event: ParamsEvent,
    deadline: Instant,
}

pub struct RequestOrchestrator {
    dispatcher: Dispatcher,
    completions: mpsc::UnboundedReceiver<Completion>,
    metrics: Arc<Metrics>,
    debounce: Duration,

    context: Option<ModuleContext>,
    pending: Option<PendingEdit>,
    deferred: Option<ParamsEvent>,

    detail_slot: RequestSlot,
    histogram_slot: RequestSlot,
    last_detail_key: Option<ConditionKey>,
    last_histogram_key: Option<ConditionKey>,

    rows: IncrementalRowAccumulator,
    histogram: HistogramState,
    distributions: DistributionCache,
}

impl RequestOrchestrator {
    pub fn new(
        dispatcher: Dispatcher,
        completions: mpsc::UnboundedReceiver<Completion>,
        clock: Arc<dyn Clock>,
        debounce: Duration,
    ) -> Self {
        let metrics = dispatcher.metrics().clone();
        Self {
            distributions: DistributionCache::new(dispatcher.clone()),
            dispatcher,
            completions,
            metrics,
            debounce,
            context: None,
            pending: None,
            deferred: None,
            detail_slot: RequestSlot::new(RequestKind::Detail),
            histogram_slot: RequestSlot::new(RequestKind::Histogram),
            last_detail_key: None,
            last_histogram_key: None,
            rows: IncrementalRowAccumulator::new(clock),
            histogram: HistogramState::new(),
        }
    }

    pub fn rows(&self) -> &IncrementalRowAccumulator {
        &self.rows
    }

    pub fn histogram(&self) -> &HistogramState {
        &self.histogram
    }

    pub fn distributions(&self) -> &DistributionCache {
        &self.distributions
    }

    pub fn distributions_mut(&mut self) -> &mut DistributionCache {
        &mut self.distributions
    }

    pub fn context(&self) -> Option<&ModuleContext> {
        self.context.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Installs the module the following events will be queried against.
    /// Switching modules drops every distribution.
    pub fn set_context(&mut self, context: ModuleContext) {
        let switched = self
            .context
            .as_ref()
            .is_none_or(|current| current.module != context.module);
        if switched {
            self.distributions.clear();
        }
        self.distributions
            .set_available_fields(context.columns.iter().map(|c| c.column_name.clone()));
        self.rows.set_time_field(Some(context.time_field.clone()));
        tracing::info!(module = %context.module, time_field = %context.time_field, "module context loaded");
        self.context = Some(context);
    }

    /// When the next debounced edit is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// True when nothing is in flight and nothing is waiting on a timer.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
            && !self.detail_slot.in_flight()
            && !self.histogram_slot.in_flight()
            && !self.distributions.in_flight()
    }

    pub fn detail_in_flight(&self) -> bool {
        self.detail_slot.in_flight()
    }

    pub fn on_params_event(&mut self, event: ParamsEvent) -> Dispatch {
        if event.changes.module || event.changes.datasource {
            self.detail_slot.cancel();
            self.histogram_slot.cancel();
            self.rows.clear();
            self.histogram.clear();
            self.last_detail_key = None;
            self.last_histogram_key = None;
            let stale_context = self
                .context
                .as_ref()
                .is_some_and(|c| !c.matches(&event.snapshot));
            if stale_context {
                self.distributions.clear();
            }
        }

        match event.trigger {
            Trigger::Search => {
                self.pending = None;
                self.execute(event, true)
            }
            Trigger::Pagination => self.load_page(event),
            Trigger::Edit if event.changes.is_empty() => Dispatch::Unchanged,
            Trigger::Edit => {
                let deadline = Instant::now() + self.debounce;
                let event = match self.pending.take() {
                    Some(mut previous) => {
                        previous.event.changes.merge(event.changes);
                        ParamsEvent {
                            changes: previous.event.changes,
                            ..event
                        }
                    }
                    None => event,
                };
                tracing::debug!(sequence = event.sequence, "debouncing query edit");
                self.pending = Some(PendingEdit { event, deadline });
                Dispatch::Debounced
            }
        }
    }

    /// Acts on the debounced edit. Call once [`deadline`](Self::deadline)
    /// has passed.
    pub fn fire_pending(&mut self) -> Dispatch {
        match self.pending.take() {
            Some(pending) => self.execute(pending.event, false),
            None => Dispatch::Ignored,
        }
    }

    /// Replays the event that was waiting for preconditions, if any, against
    /// the current `snapshot`.
    pub fn retry_deferred(&mut self, snapshot: Arc<SearchParams>) -> Option<Dispatch> {
        let mut event = self.deferred.take()?;
        event.snapshot = snapshot;
        let force = event.trigger == Trigger::Search;
        tracing::debug!(sequence = event.sequence, "replaying deferred query");
        Some(match event.trigger {
            Trigger::Pagination => self.load_page(event),
            _ => self.execute(event, force),
        })
    }

    /// Fetches the page at the snapshot's offset, if the buffer can grow.
    pub fn load_page(&mut self, event: ParamsEvent) -> Dispatch {
        if !self.ready(&event.snapshot) {
            self.deferred = Some(event);
            return Dispatch::Deferred;
        }
        if !self.rows.can_load_more() {
            return Dispatch::Ignored;
        }
        let key = ConditionKey::for_details(&event.snapshot, self.time_field());
        let ticket = self.detail_slot.issue(key);
        self.rows.begin_fetch(event.snapshot.offset);
        self.dispatcher.details(ticket, event.snapshot);
        Dispatch::Issued {
            detail: true,
            histogram: false,
            distributions: false,
        }
    }

    fn execute(&mut self, event: ParamsEvent, force: bool) -> Dispatch {
        let snapshot = event.snapshot.clone();
        if !self.ready(&snapshot) {
            tracing::debug!(sequence = event.sequence, "query preconditions unmet, deferring");
            self.deferred = Some(event);
            return Dispatch::Deferred;
        }
        self.deferred = None;

        let time_field = self.time_field().map(str::to_string);
        let detail_key = ConditionKey::for_details(&snapshot, time_field.as_deref());
        let histogram_key = ConditionKey::for_histogram(&snapshot, time_field.as_deref());

        let detail = force || self.last_detail_key != Some(detail_key);
        if detail {
            let ticket = self.detail_slot.issue(detail_key);
            self.last_detail_key = Some(detail_key);
            // a refetch keeps every page loaded so far
            let mut request = (*snapshot).clone();
            if request.offset > 0 {
                request.page_size += request.offset;
                request.offset = 0;
            }
            self.rows.begin_fetch(0);
            self.dispatcher.details(ticket, Arc::new(request));
        } else {
            self.skipped(RequestKind::Detail);
        }

        let histogram = force || self.last_histogram_key != Some(histogram_key);
        if histogram {
            let ticket = self.histogram_slot.issue(histogram_key);
            self.last_histogram_key = Some(histogram_key);
            self.histogram.begin_fetch();
            self.dispatcher.histogram(ticket, snapshot.clone());
        } else {
            self.skipped(RequestKind::Histogram);
        }

        let distributions = self.distributions.refresh(&snapshot) == RequestDecision::Issued;

        if !detail && !histogram && !distributions {
            tracing::debug!(sequence = event.sequence, "query unchanged, nothing issued");
            return Dispatch::Unchanged;
        }
        Dispatch::Issued {
            detail,
            histogram,
            distributions,
        }
    }

    fn ready(&self, params: &SearchParams) -> bool {
        params.has_target() && self.context.as_ref().is_some_and(|c| c.matches(params))
    }

    fn time_field(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.time_field.as_str())
    }

    fn skipped(&self, kind: RequestKind) {
        self.metrics
            .requests_deduplicated_total
            .get_or_create(&kind.into())
            .inc();
    }

    /// Waits for the next completed request.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions.recv().await
    }

    /// Routes a completion to the state it populates. Returns `None` for
    /// superseded and cancelled requests.
    pub fn apply(&mut self, completion: Completion) -> Option<Update> {
        let Completion { ticket, payload } = completion;
        match payload {
            Payload::Detail { offset, outcome } => {
                if !self.detail_slot.settle(&ticket) {
                    self.stale(RequestKind::Detail, outcome.is_cancelled());
                    return None;
                }
                match outcome {
                    FetchOutcome::Ok(page) => {
                        let effect = self.rows.on_batch_arrived(page.rows, offset, page.total_count);
                        self.metrics.buffered_rows.set(self.rows.len() as i64);
                        Some(Update::Rows { effect, offset })
                    }
                    FetchOutcome::Cancelled => {
                        self.rows.fetch_cancelled();
                        None
                    }
                    FetchOutcome::Failed(error) => {
                        tracing::warn!(%error, offset, "detail request failed");
                        self.rows.fetch_failed();
                        self.last_detail_key = None;
                        self.metrics.buffered_rows.set(0);
                        Some(Update::DetailFailed(error))
                    }
                }
            }
            Payload::Histogram(outcome) => {
                if !self.histogram_slot.settle(&ticket) {
                    self.stale(RequestKind::Histogram, outcome.is_cancelled());
                    return None;
                }
                match outcome {
                    FetchOutcome::Cancelled => {
                        self.histogram.fetch_cancelled();
                        None
                    }
                    FetchOutcome::Ok(data) => {
                        self.histogram.apply(FetchOutcome::Ok(data));
                        Some(Update::Histogram)
                    }
                    FetchOutcome::Failed(error) => {
                        self.last_histogram_key = None;
                        self.histogram.apply(FetchOutcome::Failed(error.clone()));
                        Some(Update::HistogramFailed(error))
                    }
                }
            }
            Payload::Distribution {
                scope,
                fields,
                outcome,
            } => self
                .distributions
                .apply(&ticket, &scope, fields, outcome)
                .map(Update::Distributions),
        }
    }

    fn stale(&self, kind: RequestKind, cancelled: bool) {
        if cancelled {
            return;
        }
        tracing::debug!(?kind, "dropping response of superseded request");
        self.metrics
            .responses_stale_total
            .get_or_create(&kind.into())
            .inc();
    }
}
