//! The canonical query state and its single mutation entry point.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::condition::{dedupe_fields, dedupe_keywords, dedupe_predicates, predicate_key};
use crate::model::{SearchParams, SortField, TimeGrouping};
use crate::persist::TabMirror;
use crate::time_range::{TimeRangeResolver, TimeSpec};

const EVENT_CAPACITY: usize = 64;

/// A partial update. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParamsUpdate {
    pub module: Option<String>,
    pub datasource_id: Option<i64>,
    pub time_range: Option<TimeSpec>,
    pub time_grouping: Option<TimeGrouping>,
    pub keywords: Option<Vec<String>>,
    pub where_predicates: Option<Vec<String>>,
    pub active_fields: Option<Vec<String>>,
    pub sort_fields: Option<Vec<SortField>>,
    pub offset: Option<usize>,
    pub page_size: Option<usize>,
}

impl SearchParamsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn datasource_id(mut self, datasource_id: i64) -> Self {
        self.datasource_id = Some(datasource_id);
        self
    }

    pub fn time_range(mut self, spec: TimeSpec) -> Self {
        self.time_range = Some(spec);
        self
    }

    pub fn time_grouping(mut self, grouping: TimeGrouping) -> Self {
        self.time_grouping = Some(grouping);
        self
    }

    pub fn keywords<S: Into<String>>(mut self, keywords: impl IntoIterator<Item = S>) -> Self {
        self.keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    pub fn where_predicates<S: Into<String>>(
        mut self,
        predicates: impl IntoIterator<Item = S>,
    ) -> Self {
        self.where_predicates = Some(predicates.into_iter().map(Into::into).collect());
        self
    }

    pub fn active_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.active_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort_fields(mut self, sort_fields: Vec<SortField>) -> Self {
        self.sort_fields = Some(sort_fields);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Which parts of the snapshot an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub module: bool,
    pub datasource: bool,
    pub time: bool,
    pub time_grouping: bool,
    pub keywords: bool,
    pub predicates: bool,
    pub active_fields: bool,
    pub sort: bool,
    pub offset: bool,
    pub page_size: bool,
}

impl ChangeSet {
    pub fn between(before: &SearchParams, after: &SearchParams) -> Self {
        Self {
            module: before.module != after.module,
            datasource: before.datasource_id != after.datasource_id,
            time: before.time_range != after.time_range
                || before.start_time != after.start_time
                || before.end_time != after.end_time,
            time_grouping: before.time_grouping != after.time_grouping,
            keywords: before.keywords != after.keywords,
            predicates: before.where_predicates != after.where_predicates,
            active_fields: before.active_fields != after.active_fields,
            sort: before.sort_fields != after.sort_fields,
            offset: before.offset != after.offset,
            page_size: before.page_size != after.page_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ChangeSet::default()
    }

    /// A change after which previously shown rows no longer answer the
    /// query: time, predicates, keywords, module or datasource.
    pub fn is_important(&self) -> bool {
        self.module || self.datasource || self.time || self.predicates || self.keywords
    }

    /// Changes that invalidate the current pagination position.
    pub fn resets_offset(&self) -> bool {
        self.is_important() || self.sort || self.page_size
    }

    /// True when the update did nothing but move the pagination offset.
    pub fn is_pagination_only(&self) -> bool {
        self.offset
            && *self
                == ChangeSet {
                    offset: true,
                    ..ChangeSet::default()
                }
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.module |= other.module;
        self.datasource |= other.datasource;
        self.time |= other.time;
        self.time_grouping |= other.time_grouping;
        self.keywords |= other.keywords;
        self.predicates |= other.predicates;
        self.active_fields |= other.active_fields;
        self.sort |= other.sort;
        self.offset |= other.offset;
        self.page_size |= other.page_size;
    }
}

/// Why a snapshot was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// An edit to the query; fetches are debounced.
    Edit,
    /// An explicit search action; fetches run immediately.
    Search,
    /// Only the offset moved to fetch the next page.
    Pagination,
}

/// A committed snapshot and how it differs from its predecessor.
#[derive(Debug, Clone)]
pub struct ParamsEvent {
    pub sequence: u64,
    pub snapshot: Arc<SearchParams>,
    pub changes: ChangeSet,
    pub trigger: Trigger,
}

/// Single writer of [`SearchParams`].
///
/// Every write is normalized (deduplicated predicates, keywords and fields;
/// re-resolved time bounds; offset reset) before it becomes the new snapshot.
/// Subscribers receive one [`ParamsEvent`] per committed change.
pub struct SearchParamsStore {
    current: Arc<SearchParams>,
    resolver: TimeRangeResolver,
    mirror: Option<TabMirror>,
    events: broadcast::Sender<ParamsEvent>,
    sequence: u64,
}

impl SearchParamsStore {
    pub fn new(initial: SearchParams, resolver: TimeRangeResolver) -> Self {
        let mut initial = initial;
        normalize(&mut initial);
        if initial.start_time.is_none() || initial.end_time.is_none() {
            let range = resolver.resolve(&initial.time_range);
            initial.start_time = Some(range.start);
            initial.end_time = Some(range.end);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: Arc::new(initial),
            resolver,
            mirror: None,
            events,
            sequence: 0,
        }
    }

    /// Starts from the tab's mirrored snapshot when there is one, else from
    /// `defaults`. Time bounds are re-resolved; the offset always starts at 0.
    pub fn restore(defaults: SearchParams, resolver: TimeRangeResolver, mirror: TabMirror) -> Self {
        let mut initial = match mirror.load_params() {
            Some(restored) => {
                tracing::info!(tab = mirror.tab_id(), "restored search params from mirror");
                restored
            }
            None => defaults,
        };
        let range = resolver.resolve(&initial.time_range);
        initial.start_time = Some(range.start);
        initial.end_time = Some(range.end);
        initial.offset = 0;
        Self::new(initial, resolver).with_mirror(mirror)
    }

    pub fn with_mirror(mut self, mirror: TabMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn snapshot(&self) -> Arc<SearchParams> {
        self.current.clone()
    }

    pub fn resolver(&self) -> &TimeRangeResolver {
        &self.resolver
    }

    pub fn mirror(&self) -> Option<&TabMirror> {
        self.mirror.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParamsEvent> {
        self.events.subscribe()
    }

    /// Merges `partial` into the current snapshot and returns the result.
    pub fn update(&mut self, partial: SearchParamsUpdate) -> ParamsEvent {
        let mut next = (*self.current).clone();
        let retime = partial.time_range.is_some();

        if let Some(module) = partial.module {
            next.module = Some(module);
        }
        if let Some(datasource_id) = partial.datasource_id {
            next.datasource_id = Some(datasource_id);
        }
        if let Some(spec) = partial.time_range {
            next.time_range = spec;
        }
        if let Some(grouping) = partial.time_grouping {
            next.time_grouping = grouping;
        }
        if let Some(keywords) = partial.keywords {
            next.keywords = keywords;
        }
        if let Some(predicates) = partial.where_predicates {
            next.where_predicates = predicates;
        }
        if let Some(fields) = partial.active_fields {
            next.active_fields = fields;
        }
        if let Some(sort_fields) = partial.sort_fields {
            next.sort_fields = sort_fields;
        }
        if let Some(offset) = partial.offset {
            next.offset = offset;
        }
        if let Some(page_size) = partial.page_size {
            next.page_size = page_size.max(1);
        }

        normalize(&mut next);
        if retime {
            let range = self.resolver.resolve(&next.time_range);
            next.start_time = Some(range.start);
            next.end_time = Some(range.end);
        }
        if ChangeSet::between(&self.current, &next).resets_offset() {
            next.offset = 0;
        }

        let changes = ChangeSet::between(&self.current, &next);
        let trigger = if changes.is_pagination_only() {
            Trigger::Pagination
        } else {
            Trigger::Edit
        };
        self.commit(next, changes, trigger)
    }

    /// An explicit search: re-resolves now-relative time bounds and emits a
    /// [`Trigger::Search`] event even when nothing changed.
    pub fn search(&mut self) -> ParamsEvent {
        let mut next = (*self.current).clone();
        let range = self.resolver.resolve(&next.time_range);
        next.start_time = Some(range.start);
        next.end_time = Some(range.end);
        if ChangeSet::between(&self.current, &next).resets_offset() {
            next.offset = 0;
        }
        let changes = ChangeSet::between(&self.current, &next);
        self.commit(next, changes, Trigger::Search)
    }

    fn commit(&mut self, next: SearchParams, changes: ChangeSet, trigger: Trigger) -> ParamsEvent {
        if !changes.is_empty() {
            self.current = Arc::new(next);
            if let Some(mirror) = &self.mirror {
                mirror.save_params(&self.current);
                if changes.active_fields {
                    mirror.save_active_fields(&self.current.active_fields);
                }
            }
        }
        self.sequence += 1;
        let event = ParamsEvent {
            sequence: self.sequence,
            snapshot: self.current.clone(),
            changes,
            trigger,
        };
        if !changes.is_empty() || trigger == Trigger::Search {
            // no receivers is fine
            let _ = self.events.send(event.clone());
        }
        tracing::debug!(sequence = event.sequence, ?changes, ?trigger, "search params committed");
        event
    }
}

fn normalize(params: &mut SearchParams) {
    params.where_predicates = dedupe_predicates(&params.where_predicates);
    params.keywords = dedupe_keywords(&params.keywords);
    params.active_fields = dedupe_fields(&params.active_fields);
    let mut seen = std::collections::HashSet::new();
    params
        .sort_fields
        .retain(|s| seen.insert(s.field_name.clone()));
    params.page_size = params.page_size.max(1);
}

/// Quotes `value` as a SQL string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Predicates after a sidebar "filter for" (`include`) or "filter out" click
/// on `field = value`: the chosen predicate is added and its opposite removed.
pub fn toggle_value_filter(
    predicates: &[String],
    field: &str,
    value: &str,
    include: bool,
) -> Vec<String> {
    let equals = format!("{} = {}", field, quote(value));
    let not_equals = format!("{} != {}", field, quote(value));
    let (add, remove) = if include {
        (equals, not_equals)
    } else {
        (not_equals, equals)
    };
    let remove_key = predicate_key(&remove);
    let mut next: Vec<String> = predicates
        .iter()
        .filter(|p| predicate_key(p) != remove_key)
        .cloned()
        .collect();
    next.push(add);
    dedupe_predicates(&next)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::MockClock;
    use common::storage::in_memory::InMemoryStore;

    use super::*;
    use crate::time_range::{QuickRange, format_datetime, parse_datetime};

    fn clock() -> Arc<MockClock> {
        let millis = parse_datetime("2024-03-13 10:17:42.123")
            .unwrap()
            .and_utc()
            .timestamp_millis();
        Arc::new(MockClock::with_millis(millis))
    }

    fn store() -> SearchParamsStore {
        SearchParamsStore::new(
            SearchParams {
                module: Some("orders".to_string()),
                datasource_id: Some(1),
                ..SearchParams::default()
            },
            TimeRangeResolver::new(clock()),
        )
    }

    #[test]
    fn should_resolve_initial_time_bounds() {
        let store = store();
        let snapshot = store.snapshot();
        assert_eq!(
            format_datetime(&snapshot.start_time.unwrap()),
            "2024-03-13 10:02:42.123"
        );
    }

    #[test]
    fn should_dedupe_predicates_and_keywords_on_update() {
        // given
        let mut store = store();

        // when
        let event = store.update(
            SearchParamsUpdate::new()
                .where_predicates(["status = 'ERROR'", "status='ERROR'"])
                .keywords(["timeout", " timeout ", ""])
                .active_fields(["log_time", "host", "log_time"]),
        );

        // then
        assert_eq!(event.snapshot.where_predicates, vec!["status = 'ERROR'"]);
        assert_eq!(event.snapshot.keywords, vec!["timeout"]);
        assert_eq!(event.snapshot.active_fields, vec!["log_time", "host"]);
    }

    #[test]
    fn should_reset_offset_when_filter_changes() {
        // given
        let mut store = store();
        store.update(SearchParamsUpdate::new().offset(100));

        // when
        let event = store.update(SearchParamsUpdate::new().where_predicates(["level = 'WARN'"]));

        // then
        assert_eq!(event.snapshot.offset, 0);
        assert!(event.changes.predicates);
        assert!(event.changes.offset);
        assert_eq!(event.trigger, Trigger::Edit);
    }

    #[test]
    fn should_preserve_offset_when_only_active_fields_change() {
        // given
        let mut store = store();
        store.update(SearchParamsUpdate::new().offset(100));

        // when
        let event = store.update(SearchParamsUpdate::new().active_fields(["log_time", "host"]));

        // then
        assert_eq!(event.snapshot.offset, 100);
        assert!(!event.changes.is_important());
    }

    #[test]
    fn should_mark_offset_only_update_as_pagination() {
        let mut store = store();
        let event = store.update(SearchParamsUpdate::new().offset(50));
        assert_eq!(event.trigger, Trigger::Pagination);
        assert!(event.changes.is_pagination_only());
    }

    #[test]
    fn should_re_resolve_time_bounds_when_time_range_set() {
        // given
        let clock = clock();
        let mut store = SearchParamsStore::new(
            SearchParams::default(),
            TimeRangeResolver::new(clock.clone()),
        );

        // when
        clock.advance(Duration::from_secs(60));
        let unchanged = store.update(SearchParamsUpdate::new().keywords(["a"]));
        let retimed =
            store.update(SearchParamsUpdate::new().time_range(TimeSpec::Quick(QuickRange::LastHour)));

        // then
        assert_eq!(
            format_datetime(&unchanged.snapshot.end_time.unwrap()),
            "2024-03-13 10:17:42.123"
        );
        assert_eq!(
            format_datetime(&retimed.snapshot.start_time.unwrap()),
            "2024-03-13 09:18:42.123"
        );
        assert!(retimed.changes.time);
    }

    #[test]
    fn should_refresh_relative_time_on_explicit_search() {
        // given
        let clock = clock();
        let mut store = SearchParamsStore::new(
            SearchParams::default(),
            TimeRangeResolver::new(clock.clone()),
        );

        // when
        clock.advance(Duration::from_secs(5));
        let event = store.search();

        // then
        assert_eq!(event.trigger, Trigger::Search);
        assert!(event.changes.time);
        assert_eq!(
            format_datetime(&event.snapshot.end_time.unwrap()),
            "2024-03-13 10:17:47.123"
        );
    }

    #[test]
    fn should_report_empty_changes_for_no_op_update() {
        let mut store = store();
        let before = store.snapshot();
        let event = store.update(SearchParamsUpdate::new().module("orders"));
        assert!(event.changes.is_empty());
        assert!(Arc::ptr_eq(&before, &event.snapshot));
    }

    #[tokio::test]
    async fn should_broadcast_committed_changes() {
        // given
        let mut store = store();
        let mut events = store.subscribe();

        // when
        store.update(SearchParamsUpdate::new().module("orders"));
        store.update(SearchParamsUpdate::new().keywords(["timeout"]));

        // then
        let event = events.recv().await.unwrap();
        assert!(event.changes.keywords);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn should_mirror_snapshot_and_restore_it() {
        // given
        let kv = Arc::new(InMemoryStore::new());
        let mirror = TabMirror::new(kv.clone(), "tab-1");
        let mut store = store().with_mirror(mirror.clone());
        store.update(
            SearchParamsUpdate::new()
                .where_predicates(["status = 'ERROR'"])
                .active_fields(["log_time", "message"])
                .time_range("now-1h/h ~ now".parse().unwrap()),
        );
        store.update(SearchParamsUpdate::new().offset(50));

        // when
        let restored = SearchParamsStore::restore(
            SearchParams::default(),
            TimeRangeResolver::new(clock()),
            mirror.clone(),
        );

        // then
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.where_predicates, vec!["status = 'ERROR'"]);
        assert_eq!(snapshot.time_range.to_string(), "now-1h/h ~ now");
        assert_eq!(snapshot.offset, 0);
        assert_eq!(
            mirror.load_active_fields(),
            Some(vec!["log_time".to_string(), "message".to_string()])
        );
    }

    #[test]
    fn should_toggle_between_include_and_exclude_filters() {
        // given
        let predicates = vec!["host = 'web-1'".to_string()];

        // when
        let excluded = toggle_value_filter(&predicates, "level", "ERROR", false);
        let included = toggle_value_filter(&excluded, "level", "ERROR", true);

        // then
        assert_eq!(excluded, vec!["host = 'web-1'", "level != 'ERROR'"]);
        assert_eq!(included, vec!["host = 'web-1'", "level = 'ERROR'"]);
    }

    #[test]
    fn should_escape_quotes_in_filter_values() {
        let predicates = toggle_value_filter(&[], "message", "it's", true);
        assert_eq!(predicates, vec!["message = 'it''s'"]);
    }
}
