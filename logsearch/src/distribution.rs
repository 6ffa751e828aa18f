//! Sidebar field value distributions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::condition::ConditionKey;
use crate::error::{Error, FetchOutcome};
use crate::metrics::RequestKind;
use crate::model::{DistributionResponse, FieldDistribution, SearchParams, ValueDistribution};
use crate::request::{DistributionScope, Dispatcher, RequestSlot, Ticket};

/// Whether a distribution request went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Issued,
    /// The same fields were already requested under the same condition.
    Deduplicated,
    /// None of the requested fields exist in the current module.
    NoFields,
}

/// A change to the cache caused by a completed request.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionChange {
    Updated { fields: Vec<String> },
    Failed { fields: Vec<String>, error: Error },
}

struct Tracked {
    slot: RequestSlot,
    /// Shared condition of the in-flight request.
    shared: Option<ConditionKey>,
    /// Key of the last request issued (or completed) through this slot.
    last_key: Option<ConditionKey>,
    /// Fields of the in-flight request.
    fields: Vec<String>,
}

impl Tracked {
    fn new() -> Self {
        Self {
            slot: RequestSlot::new(RequestKind::Distribution),
            shared: None,
            last_key: None,
            fields: Vec::new(),
        }
    }

    fn cancel(&mut self) -> bool {
        self.shared = None;
        self.last_key = None;
        self.fields.clear();
        self.slot.cancel()
    }
}

/// Per-field value distributions with loading flags.
///
/// Two request paths exist. A bulk refresh asks for every expanded field at
/// once whenever the query condition changes. Expanding a single field in
/// the sidebar asks for that field alone, in its own slot, so it never
/// cancels another field's request unless the shared condition moved on.
pub struct DistributionCache {
    dispatcher: Dispatcher,
    available: Option<HashSet<String>>,
    expanded: Vec<String>,
    distributions: BTreeMap<String, FieldDistribution>,
    loading: BTreeSet<String>,
    bulk: Tracked,
    fields: HashMap<String, Tracked>,
}

impl DistributionCache {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            available: None,
            expanded: Vec::new(),
            distributions: BTreeMap::new(),
            loading: BTreeSet::new(),
            bulk: Tracked::new(),
            fields: HashMap::new(),
        }
    }

    /// Restricts requests to columns of the current module.
    pub fn set_available_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available = Some(fields.into_iter().map(Into::into).collect());
    }

    pub fn distribution(&self, field: &str) -> Option<&FieldDistribution> {
        self.distributions.get(field)
    }

    pub fn distributions(&self) -> &BTreeMap<String, FieldDistribution> {
        &self.distributions
    }

    pub fn is_loading(&self, field: &str) -> bool {
        self.loading.contains(field)
    }

    pub fn expanded_fields(&self) -> &[String] {
        &self.expanded
    }

    pub fn in_flight(&self) -> bool {
        self.bulk.slot.in_flight() || self.fields.values().any(|t| t.slot.in_flight())
    }

    /// Requests distributions for `fields` under the condition in `params`.
    ///
    /// A repeat of the previous bulk request (same fields, same condition) is
    /// a no-op. Otherwise the previous bulk request is cancelled, as is any
    /// single-field request for one of `fields` or issued under a different
    /// condition.
    pub fn request_distribution<S: AsRef<str>>(
        &mut self,
        fields: &[S],
        params: &SearchParams,
    ) -> RequestDecision {
        let fields = self.validate(fields);
        if fields.is_empty() {
            return RequestDecision::NoFields;
        }
        let key = ConditionKey::for_distribution(params, &fields);
        if self.bulk.last_key == Some(key) {
            self.deduplicated();
            return RequestDecision::Deduplicated;
        }
        let shared = ConditionKey::for_shared_condition(params);

        let previous = std::mem::take(&mut self.bulk.fields);
        self.bulk.cancel();
        let superseded: Vec<String> = self
            .fields
            .iter()
            .filter(|(field, tracked)| {
                tracked.slot.in_flight()
                    && (tracked.shared != Some(shared) || fields.contains(*field))
            })
            .map(|(field, _)| field.clone())
            .collect();
        for field in superseded {
            if let Some(tracked) = self.fields.get_mut(&field) {
                tracked.cancel();
            }
            if !fields.contains(&field) {
                self.loading.remove(&field);
            }
        }

        // fields the cancelled bulk request was loading and nothing else is
        for field in previous {
            let field_in_flight = self.fields.get(&field).is_some_and(|t| t.slot.in_flight());
            if !fields.contains(&field) && !field_in_flight {
                self.loading.remove(&field);
            }
        }

        self.loading.extend(fields.iter().cloned());
        let ticket = self.bulk.slot.issue(key);
        self.bulk.shared = Some(shared);
        self.bulk.last_key = Some(key);
        self.bulk.fields = fields.clone();
        self.dispatch(ticket, DistributionScope::Bulk, params, fields);
        RequestDecision::Issued
    }

    /// Re-requests every expanded field under a new condition.
    ///
    /// Fields whose own request already answers `params` (in flight or
    /// cached) are left out.
    pub fn refresh(&mut self, params: &SearchParams) -> RequestDecision {
        if self.expanded.is_empty() {
            return RequestDecision::NoFields;
        }
        let outdated: Vec<String> = self
            .expanded
            .iter()
            .filter(|field| !self.field_answers(field, params))
            .cloned()
            .collect();
        if outdated.is_empty() {
            self.deduplicated();
            return RequestDecision::Deduplicated;
        }
        self.request_distribution(&outdated, params)
    }

    fn field_answers(&self, field: &str, params: &SearchParams) -> bool {
        let key = ConditionKey::for_distribution(params, &[field]);
        self.fields.get(field).is_some_and(|tracked| {
            tracked.last_key == Some(key)
                && (tracked.slot.in_flight() || self.distributions.contains_key(field))
        })
    }

    /// Expands `field` in the sidebar and requests its distribution alone.
    pub fn expand_field(&mut self, field: &str, params: &SearchParams) -> RequestDecision {
        if self.validate(&[field]).is_empty() {
            return RequestDecision::NoFields;
        }
        if !self.expanded.iter().any(|f| f == field) {
            self.expanded.push(field.to_string());
        }
        self.request_field(field, params)
    }

    pub fn request_field(&mut self, field: &str, params: &SearchParams) -> RequestDecision {
        if self.validate(&[field]).is_empty() {
            return RequestDecision::NoFields;
        }
        let key = ConditionKey::for_distribution(params, &[field]);
        let shared = ConditionKey::for_shared_condition(params);
        let tracked = self.fields.entry(field.to_string()).or_insert_with(Tracked::new);
        if tracked.last_key == Some(key)
            && (tracked.slot.in_flight() || self.distributions.contains_key(field))
        {
            self.deduplicated();
            return RequestDecision::Deduplicated;
        }

        let stale: Vec<String> = self
            .fields
            .iter()
            .filter(|(other, tracked)| {
                other.as_str() != field && tracked.slot.in_flight() && tracked.shared != Some(shared)
            })
            .map(|(other, _)| other.clone())
            .collect();
        for other in stale {
            if let Some(tracked) = self.fields.get_mut(&other) {
                tracked.cancel();
            }
            self.loading.remove(&other);
        }

        let tracked = self.fields.entry(field.to_string()).or_insert_with(Tracked::new);
        let ticket = tracked.slot.issue(key);
        tracked.shared = Some(shared);
        tracked.last_key = Some(key);
        tracked.fields = vec![field.to_string()];
        self.loading.insert(field.to_string());
        self.dispatch(
            ticket,
            DistributionScope::Field(field.to_string()),
            params,
            vec![field.to_string()],
        );
        RequestDecision::Issued
    }

    /// Collapses `field`: its request is cancelled and its loading flag
    /// cleared. Its last distribution stays cached.
    pub fn collapse_field(&mut self, field: &str) {
        self.expanded.retain(|f| f != field);
        if let Some(tracked) = self.fields.get_mut(field) {
            tracked.cancel();
        }
        self.loading.remove(field);
    }

    /// Drops everything. Used when the module changes.
    pub fn clear(&mut self) {
        self.bulk.cancel();
        for tracked in self.fields.values_mut() {
            tracked.cancel();
        }
        self.fields.clear();
        self.expanded.clear();
        self.distributions.clear();
        self.loading.clear();
        self.available = None;
    }

    /// Applies a completed request. Returns `None` when the completion was
    /// stale or cancelled and nothing changed.
    pub fn apply(
        &mut self,
        ticket: &Ticket,
        scope: &DistributionScope,
        fields: Vec<String>,
        outcome: FetchOutcome<DistributionResponse>,
    ) -> Option<DistributionChange> {
        let tracked = match scope {
            DistributionScope::Bulk => &mut self.bulk,
            DistributionScope::Field(field) => self.fields.get_mut(field)?,
        };
        if !tracked.slot.settle(ticket) {
            if !outcome.is_cancelled() {
                self.dispatcher
                    .metrics()
                    .responses_stale_total
                    .get_or_create(&RequestKind::Distribution.into())
                    .inc();
                tracing::debug!(?scope, key = %ticket.key, "dropping stale distribution response");
            }
            return None;
        }
        tracked.fields.clear();

        match outcome {
            FetchOutcome::Ok(response) => {
                let sample_size = response.sample_size;
                for data in response.field_distributions {
                    self.distributions.insert(
                        data.field_name.clone(),
                        FieldDistribution::from_wire(data, sample_size),
                    );
                }
                for field in &fields {
                    self.loading.remove(field);
                }
                Some(DistributionChange::Updated { fields })
            }
            FetchOutcome::Cancelled => None,
            FetchOutcome::Failed(error) => {
                tracked.last_key = None;
                tracked.shared = None;
                for field in &fields {
                    self.distributions.remove(field);
                    self.loading.remove(field);
                }
                tracing::warn!(?fields, %error, "distribution request failed");
                Some(DistributionChange::Failed { fields, error })
            }
        }
    }

    fn validate<S: AsRef<str>>(&self, fields: &[S]) -> Vec<String> {
        let mut valid = Vec::new();
        for field in fields {
            let field = field.as_ref();
            match &self.available {
                Some(available) if !available.contains(field) => {
                    tracing::warn!(field, "skipping distribution for unknown field");
                }
                _ => {
                    if !valid.iter().any(|f: &String| f == field) {
                        valid.push(field.to_string());
                    }
                }
            }
        }
        valid
    }

    fn dispatch(
        &self,
        ticket: Ticket,
        scope: DistributionScope,
        params: &SearchParams,
        fields: Vec<String>,
    ) {
        let mut request = params.clone();
        request.active_fields = fields;
        request.offset = 0;
        self.dispatcher
            .distributions(ticket, scope, Arc::new(request));
    }

    fn deduplicated(&self) {
        self.dispatcher
            .metrics()
            .requests_deduplicated_total
            .get_or_create(&RequestKind::Distribution.into())
            .inc();
    }
}

/// Sum of the counts of the given top values.
pub fn sum_counts(values: &[ValueDistribution]) -> u64 {
    values.iter().map(|v| v.count).sum()
}

/// True when the distribution has at least one non-zero value bucket.
pub fn has_distribution_data(distribution: Option<&FieldDistribution>) -> bool {
    distribution.is_some_and(|d| sum_counts(&d.top_values) > 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::FieldDistributionData;

    fn distribution(field: &str, count: u64) -> FieldDistribution {
        FieldDistribution::from_wire(
            FieldDistributionData {
                field_name: field.to_string(),
                value_distributions: vec![ValueDistribution {
                    value: json!("x"),
                    count,
                    percentage: 100.0,
                }],
                total_count: count,
                non_null_count: count,
                null_count: 0,
                unique_count: 1,
            },
            count,
        )
    }

    #[test]
    fn should_detect_distribution_data() {
        assert!(has_distribution_data(Some(&distribution("level", 3))));
        assert!(!has_distribution_data(Some(&distribution("level", 0))));
        assert!(!has_distribution_data(None));
    }
}
