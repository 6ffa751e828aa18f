//! The remote search backend and the [`SearchBackend`] trait.
//!
//! The console never talks to the network directly; every fetch goes through
//! this trait so the orchestration logic can be exercised against scripted
//! backends in tests and against [`HttpBackend`](crate::http::HttpBackend) in
//! production.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{
    ColumnInfo, DetailPage, DistributionResponse, HistogramData, ModuleQueryConfig, SearchParams,
};

/// Operations the console consumes from the log search backend.
///
/// # Cancellation
///
/// The three query operations receive a [`CancellationToken`]. Implementations
/// should stop work and return [`Error::Cancelled`](crate::Error::Cancelled)
/// once the token fires. Callers do not rely on this: a response that arrives
/// after its token was cancelled is discarded by the orchestrator anyway.
///
/// # Example
///
/// ```ignore
/// use logsearch::{SearchBackend, SearchParams};
/// use tokio_util::sync::CancellationToken;
///
/// async fn count(backend: &dyn SearchBackend, params: &SearchParams) -> Result<u64> {
///     let page = backend.fetch_log_details(params, &CancellationToken::new()).await?;
///     Ok(page.total_count)
/// }
/// ```
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Fetches one page of rows at `params.offset`, `params.page_size` long,
    /// restricted to `params.active_fields` when non-empty.
    async fn fetch_log_details(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DetailPage>;

    /// Fetches the time histogram for the query, bucketed by
    /// `params.time_grouping`.
    async fn fetch_log_histogram(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<HistogramData>;

    /// Fetches value distributions for each field in `params.active_fields`.
    async fn fetch_distributions(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DistributionResponse>;

    /// Lists the columns of a module's table.
    async fn fetch_columns(&self, datasource_id: i64, module: &str) -> Result<Vec<ColumnInfo>>;

    /// Loads the per-module query configuration.
    async fn get_module_query_config(&self, module: &str) -> Result<ModuleQueryConfig>;
}
