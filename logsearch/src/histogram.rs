use crate::error::{Error, FetchOutcome};
use crate::model::HistogramData;

/// The histogram shown above the detail table.
#[derive(Debug, Default)]
pub struct HistogramState {
    data: Option<HistogramData>,
    loading: bool,
    error: Option<Error>,
}

impl HistogramState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> Option<&HistogramData> {
        self.data.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Total number of matching records across all buckets.
    pub fn total_count(&self) -> u64 {
        self.data.as_ref().map_or(0, HistogramData::total_count)
    }

    pub fn begin_fetch(&mut self) {
        self.loading = true;
    }

    /// The in-flight request was cancelled without a replacement.
    pub fn fetch_cancelled(&mut self) {
        self.loading = false;
    }

    /// Applies the outcome of the current request. Returns whether visible
    /// state changed.
    pub fn apply(&mut self, outcome: FetchOutcome<HistogramData>) -> bool {
        self.loading = false;
        match outcome {
            FetchOutcome::Ok(data) => {
                self.data = Some(data);
                self.error = None;
                true
            }
            FetchOutcome::Cancelled => false,
            FetchOutcome::Failed(error) => {
                tracing::warn!(%error, "histogram request failed");
                self.data = None;
                self.error = Some(error);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
