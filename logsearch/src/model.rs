//! Query and response types shared by the console and its backend.
//!
//! Field names follow the backend's camelCase JSON contract so the same types
//! serve as request bodies, response payloads and mirror documents.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::time_range::{TimeSpec, optional_datetime};

/// Default number of rows requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Histogram bucket width requested from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrouping {
    Second,
    Minute,
    Hour,
    Day,
    #[default]
    Auto,
}

impl TimeGrouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrouping::Second => "second",
            TimeGrouping::Minute => "minute",
            TimeGrouping::Hour => "hour",
            TimeGrouping::Day => "day",
            TimeGrouping::Auto => "auto",
        }
    }
}

impl FromStr for TimeGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "second" => Ok(TimeGrouping::Second),
            "minute" => Ok(TimeGrouping::Minute),
            "hour" => Ok(TimeGrouping::Hour),
            "day" => Ok(TimeGrouping::Day),
            "auto" => Ok(TimeGrouping::Auto),
            other => Err(format!("unknown time grouping {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortField {
    pub field_name: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn new(field_name: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field_name: field_name.into(),
            direction,
        }
    }
}

/// The canonical query. Only [`SearchParamsStore`](crate::SearchParamsStore)
/// produces new values of this type; everyone else holds snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<i64>,

    #[serde(default, with = "optional_datetime")]
    pub start_time: Option<NaiveDateTime>,

    #[serde(default, with = "optional_datetime")]
    pub end_time: Option<NaiveDateTime>,

    #[serde(default)]
    pub time_range: TimeSpec,

    #[serde(default)]
    pub time_grouping: TimeGrouping,

    #[serde(default)]
    pub keywords: Vec<String>,

    /// SQL predicates AND-ed by the backend.
    #[serde(default, rename = "whereSqls")]
    pub where_predicates: Vec<String>,

    /// Columns requested from the backend, in display order.
    #[serde(default, rename = "fields")]
    pub active_fields: Vec<String>,

    #[serde(default)]
    pub sort_fields: Vec<SortField>,

    #[serde(default)]
    pub offset: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            module: None,
            datasource_id: None,
            start_time: None,
            end_time: None,
            time_range: TimeSpec::default(),
            time_grouping: TimeGrouping::default(),
            keywords: Vec::new(),
            where_predicates: Vec::new(),
            active_fields: Vec::new(),
            sort_fields: Vec::new(),
            offset: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchParams {
    /// True once a module and datasource are both selected.
    pub fn has_target(&self) -> bool {
        self.module.is_some() && self.datasource_id.is_some()
    }
}

/// One page of rows from the detail endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailPage {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramPoint {
    pub time_point: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramData {
    #[serde(default)]
    pub distribution_data: Vec<HistogramPoint>,
    #[serde(default)]
    pub time_unit: String,
    #[serde(default)]
    pub time_interval: u64,
}

impl HistogramData {
    pub fn total_count(&self) -> u64 {
        self.distribution_data.iter().map(|p| p.count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueDistribution {
    pub value: Value,
    pub count: u64,
    #[serde(default)]
    pub percentage: f64,
}

/// Per-field statistics as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDistributionData {
    pub field_name: String,
    #[serde(default)]
    pub value_distributions: Vec<ValueDistribution>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub non_null_count: u64,
    #[serde(default)]
    pub null_count: u64,
    #[serde(default)]
    pub unique_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionResponse {
    #[serde(default)]
    pub field_distributions: Vec<FieldDistributionData>,
    #[serde(default)]
    pub sample_size: u64,
}

/// A field's value distribution as held by the sidebar.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDistribution {
    pub field_name: String,
    pub total_count: u64,
    pub non_null_count: u64,
    pub null_count: u64,
    pub unique_count: u64,
    pub sample_size: u64,
    pub top_values: Vec<ValueDistribution>,
}

impl FieldDistribution {
    pub fn from_wire(data: FieldDistributionData, sample_size: u64) -> Self {
        Self {
            field_name: data.field_name,
            total_count: data.total_count,
            non_null_count: data.non_null_count,
            null_count: data.null_count,
            unique_count: data.unique_count,
            sample_size,
            top_values: data.value_distributions,
        }
    }
}

/// A column as reported by the backend schema endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
    #[serde(default)]
    pub is_fixed: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn new(column_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            data_type: data_type.into(),
            is_fixed: false,
            is_primary_key: false,
            is_nullable: true,
        }
    }

    pub fn fixed(mut self) -> Self {
        self.is_fixed = true;
        self
    }
}

/// Per-module query settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleQueryConfig {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub time_field: Option<String>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    #[serde(default)]
    pub keyword_fields: Vec<Value>,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => f.write_str("ASC"),
            SortDirection::Desc => f.write_str("DESC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_range::{QuickRange, parse_datetime};

    #[test]
    fn should_serialize_search_params_with_backend_field_names() {
        // given
        let params = SearchParams {
            module: Some("orders".to_string()),
            datasource_id: Some(7),
            start_time: parse_datetime("2024-03-13 10:00:00.000"),
            end_time: parse_datetime("2024-03-13 10:15:00.000"),
            time_range: TimeSpec::Quick(QuickRange::Last15Minutes),
            where_predicates: vec!["status = 'ERROR'".to_string()],
            active_fields: vec!["log_time".to_string(), "message".to_string()],
            sort_fields: vec![SortField::new("log_time", SortDirection::Desc)],
            ..SearchParams::default()
        };

        // when
        let json = serde_json::to_value(&params).unwrap();

        // then
        assert_eq!(json["datasourceId"], 7);
        assert_eq!(json["startTime"], "2024-03-13 10:00:00.000");
        assert_eq!(json["timeRange"], "last_15m");
        assert_eq!(json["timeGrouping"], "auto");
        assert_eq!(json["whereSqls"][0], "status = 'ERROR'");
        assert_eq!(json["fields"][1], "message");
        assert_eq!(json["sortFields"][0]["direction"], "DESC");
        assert_eq!(json["pageSize"], 50);
    }

    #[test]
    fn should_round_trip_search_params_through_json() {
        // given
        let params = SearchParams {
            module: Some("orders".to_string()),
            time_range: "now-1h/h ~ now".parse().unwrap(),
            keywords: vec!["timeout".to_string()],
            ..SearchParams::default()
        };

        // when
        let json = serde_json::to_string(&params).unwrap();
        let back: SearchParams = serde_json::from_str(&json).unwrap();

        // then
        assert_eq!(back, params);
    }

    #[test]
    fn should_decode_distribution_response() {
        // given
        let json = r#"{
            "fieldDistributions": [{
                "fieldName": "level",
                "valueDistributions": [{"value": "ERROR", "count": 12, "percentage": 60.0}],
                "totalCount": 20, "nonNullCount": 20, "nullCount": 0, "uniqueCount": 3
            }],
            "sampleSize": 20,
            "success": true
        }"#;

        // when
        let response: DistributionResponse = serde_json::from_str(json).unwrap();
        let field = FieldDistribution::from_wire(
            response.field_distributions[0].clone(),
            response.sample_size,
        );

        // then
        assert_eq!(field.field_name, "level");
        assert_eq!(field.sample_size, 20);
        assert_eq!(field.top_values[0].count, 12);
    }
}
