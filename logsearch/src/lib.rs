//! Log Search - the orchestration engine behind an interactive log search
//! console.
//!
//! A user edits a query (module, time range, keywords, SQL predicates,
//! columns, sort). The engine turns each edit into the smallest set of
//! backend requests that answers it: a page of rows, a time histogram and
//! per-field value distributions.
//!
//! # Architecture
//!
//! [`SearchParamsStore`] is the only writer of the query. Every committed
//! change is an event carrying the new snapshot and what changed.
//! [`RequestOrchestrator`] debounces those events, derives a
//! [`ConditionKey`] per request type and issues a request only when its key
//! differs from the one last issued. Each request runs as a spawned task
//! that reports back on a channel; a newer request of the same type cancels
//! the older one and late answers are dropped.
//!
//! Results land in the [`IncrementalRowAccumulator`], [`HistogramState`] and
//! [`DistributionCache`]. [`VirtualizedTableState`] keeps column, sort and
//! row expansion state on top of the rows without ever changing them.
//!
//! [`SearchSession`] wires it all together for a single owner.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use logsearch::{SearchSession, SessionOptions, SearchParamsUpdate};
//! use logsearch::http::HttpBackend;
//!
//! let backend = HttpBackend::new("http://localhost:8080", Duration::from_secs(30))?;
//! let mut session = SearchSession::new(Arc::new(backend), SessionOptions::default());
//! session.select_module("orders", 1).await?;
//! session.update(SearchParamsUpdate::new().where_predicates(["status = 'ERROR'"]));
//! while let Some(event) = session.next_event().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod accumulator;
mod backend;
pub mod condition;
pub mod config;
pub mod distribution;
mod error;
pub mod histogram;
#[cfg(feature = "http-client")]
pub mod http;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod persist;
pub mod request;
pub mod session;
pub mod share;
pub mod table;
pub mod time_range;

pub use accumulator::{BatchEffect, IncrementalRowAccumulator, RecordKey, RowRecord};
pub use backend::SearchBackend;
pub use condition::ConditionKey;
pub use config::{CliArgs, ConsoleConfig};
pub use distribution::{DistributionCache, DistributionChange, RequestDecision};
pub use error::{Error, FetchOutcome, Result};
pub use histogram::HistogramState;
pub use metrics::{Metrics, RequestKind};
pub use model::{
    ColumnInfo, DetailPage, DistributionResponse, FieldDistribution, HistogramData,
    ModuleQueryConfig, SearchParams, SortDirection, SortField, TimeGrouping,
};
pub use orchestrator::{Dispatch, ModuleContext, RequestOrchestrator};
pub use params::{ChangeSet, ParamsEvent, SearchParamsStore, SearchParamsUpdate, Trigger};
pub use persist::TabMirror;
pub use session::{SearchSession, SessionEvent, SessionOptions};
pub use table::VirtualizedTableState;
pub use time_range::{QuickRange, TimeRangeResolver, TimeSpec};
