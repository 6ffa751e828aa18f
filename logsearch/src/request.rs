//! Cancellable request slots and the task dispatcher.
//!
//! Each logical request type owns a [`RequestSlot`]. Issuing through a slot
//! cancels whatever the slot held before, then hands out a [`Ticket`] that
//! travels with the spawned fetch and comes back attached to its
//! [`Completion`]. A completion is applied only if its ticket is still the one
//! the slot holds, so late responses from superseded requests are dropped even
//! when the backend ignored the cancellation.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::SearchBackend;
use crate::condition::ConditionKey;
use crate::error::{FetchOutcome, Result};
use crate::metrics::{Metrics, RequestKind};
use crate::model::{DetailPage, DistributionResponse, HistogramData, SearchParams};

/// Identity of one issued request.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub kind: RequestKind,
    pub generation: u64,
    pub key: ConditionKey,
    token: CancellationToken,
}

impl Ticket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn same_request(&self, other: &Ticket) -> bool {
        self.generation == other.generation && self.key == other.key
    }
}

/// At most one in-flight request of a kind.
#[derive(Debug)]
pub struct RequestSlot {
    kind: RequestKind,
    generation: u64,
    in_flight: Option<Ticket>,
}

impl RequestSlot {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            generation: 0,
            in_flight: None,
        }
    }

    /// Cancels the current request, if any, and reserves the slot for a new
    /// one under `key`.
    pub fn issue(&mut self, key: ConditionKey) -> Ticket {
        self.cancel();
        self.generation += 1;
        let ticket = Ticket {
            kind: self.kind,
            generation: self.generation,
            key,
            token: CancellationToken::new(),
        };
        self.in_flight = Some(ticket.clone());
        ticket
    }

    /// Cancels the in-flight request. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.in_flight.take() {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Releases the slot if `ticket` is the request it holds. A `false`
    /// return means the completion belongs to a superseded request.
    pub fn settle(&mut self, ticket: &Ticket) -> bool {
        match &self.in_flight {
            Some(current) if current.same_request(ticket) => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn current_key(&self) -> Option<ConditionKey> {
        self.in_flight.as_ref().map(|t| t.key)
    }
}

/// Which distribution request a completion answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DistributionScope {
    /// Refresh of every expanded field after the query condition changed.
    Bulk,
    /// A single field expanded in the sidebar.
    Field(String),
}

/// The result of a spawned fetch.
#[derive(Debug)]
pub enum Payload {
    Detail {
        offset: usize,
        outcome: FetchOutcome<DetailPage>,
    },
    Histogram(FetchOutcome<HistogramData>),
    Distribution {
        scope: DistributionScope,
        fields: Vec<String>,
        outcome: FetchOutcome<DistributionResponse>,
    },
}

#[derive(Debug)]
pub struct Completion {
    pub ticket: Ticket,
    pub payload: Payload,
}

/// Spawns backend fetches and reports each one exactly once on the
/// completion channel, as a success, failure or cancellation.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn SearchBackend>,
    completions: mpsc::UnboundedSender<Completion>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                completions,
                metrics,
            },
            rx,
        )
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn details(&self, ticket: Ticket, params: Arc<SearchParams>) {
        let backend = self.backend.clone();
        let token = ticket.token.clone();
        let offset = params.offset;
        self.spawn(
            ticket,
            async move { backend.fetch_log_details(&params, &token).await },
            move |outcome| Payload::Detail { offset, outcome },
        );
    }

    pub fn histogram(&self, ticket: Ticket, params: Arc<SearchParams>) {
        let backend = self.backend.clone();
        let token = ticket.token.clone();
        self.spawn(
            ticket,
            async move { backend.fetch_log_histogram(&params, &token).await },
            Payload::Histogram,
        );
    }

    /// `params.active_fields` must already hold the fields to fetch.
    pub fn distributions(
        &self,
        ticket: Ticket,
        scope: DistributionScope,
        params: Arc<SearchParams>,
    ) {
        let backend = self.backend.clone();
        let token = ticket.token.clone();
        let fields = params.active_fields.clone();
        self.spawn(
            ticket,
            async move { backend.fetch_distributions(&params, &token).await },
            move |outcome| Payload::Distribution {
                scope,
                fields,
                outcome,
            },
        );
    }

    fn spawn<T, F, W>(&self, ticket: Ticket, fetch: F, wrap: W)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        W: FnOnce(FetchOutcome<T>) -> Payload + Send + 'static,
    {
        self.metrics
            .requests_issued_total
            .get_or_create(&ticket.kind.into())
            .inc();
        tracing::debug!(
            kind = ?ticket.kind,
            generation = ticket.generation,
            key = %ticket.key,
            "issuing request"
        );

        let completions = self.completions.clone();
        let metrics = self.metrics.clone();
        let token = ticket.token.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => FetchOutcome::Cancelled,
                result = fetch => FetchOutcome::from(result),
            };
            match &outcome {
                FetchOutcome::Cancelled => {
                    metrics
                        .requests_cancelled_total
                        .get_or_create(&ticket.kind.into())
                        .inc();
                }
                FetchOutcome::Failed(err) => {
                    tracing::debug!(kind = ?ticket.kind, error = %err, "request failed");
                    metrics
                        .requests_failed_total
                        .get_or_create(&ticket.kind.into())
                        .inc();
                }
                FetchOutcome::Ok(_) => {}
            }
            let payload = wrap(outcome);
            // the receiver only goes away when the owning session is dropped
            let _ = completions.send(Completion { ticket, payload });
        });
    }
}
