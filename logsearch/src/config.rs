//! Console configuration and command-line arguments.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Weekday};
use clap::Parser;
use common::storage::config::MirrorConfig;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{DEFAULT_PAGE_SIZE, TimeGrouping};
use crate::time_range::{QuickRange, TimeSpec};

/// CLI arguments for the `logsearch` binary.
#[derive(Parser, Debug)]
#[command(name = "logsearch")]
#[command(about = "Run a log search against a log search backend")]
pub struct CliArgs {
    /// Path to the console YAML configuration file
    #[arg(short, long, env = "LOGSEARCH_CONFIG_FILE")]
    pub config: Option<String>,

    /// Backend base URL, overrides the configuration file
    #[arg(long, env = "LOGSEARCH_BASE_URL")]
    pub base_url: Option<String>,

    /// Module to search
    #[arg(short, long)]
    pub module: String,

    /// Datasource the module belongs to
    #[arg(short, long)]
    pub datasource_id: i64,

    /// Time range: a quick key (`last_1h`), `now-2h ~ now`, or
    /// `2024-03-13 10:00:00 ~ 2024-03-13 11:00:00`
    #[arg(short, long)]
    pub time_range: Option<String>,

    /// SQL predicate, may be repeated
    #[arg(short = 'w', long = "where")]
    pub where_predicates: Vec<String>,

    /// Keyword, may be repeated
    #[arg(short, long = "keyword")]
    pub keywords: Vec<String>,

    /// Extra columns to show, may be repeated
    #[arg(short, long = "field")]
    pub fields: Vec<String>,

    /// Number of pages to load
    #[arg(long, default_value = "1")]
    pub pages: usize,

    /// Print value distributions of these fields, may be repeated
    #[arg(long = "distribution")]
    pub distributions: Vec<String>,

    /// Print request metrics after the search
    #[arg(long)]
    pub metrics: bool,
}

/// Root of the console configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    /// Quiet period before a query edit is fetched, e.g. `300ms`.
    #[serde(default = "default_debounce")]
    pub debounce: String,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Time range used when nothing was restored.
    #[serde(default = "default_time_range")]
    pub default_time_range: String,

    #[serde(default)]
    pub time_grouping: TimeGrouping,

    /// Offset of the console's time zone from UTC.
    #[serde(default)]
    pub utc_offset_secs: i32,

    /// First day of the week for `this_week` and `last_week`.
    #[serde(default = "default_week_start")]
    pub week_start: String,

    /// Interval between automatic searches; disabled when unset.
    #[serde(default)]
    pub auto_refresh: Option<String>,

    /// Where per-tab state is mirrored.
    #[serde(default)]
    pub mirror: MirrorConfig,

    #[serde(default = "default_tab_id")]
    pub tab_id: String,
}

fn default_debounce() -> String {
    "300ms".to_string()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_time_range() -> String {
    QuickRange::Last15Minutes.key().to_string()
}

fn default_week_start() -> String {
    "monday".to_string()
}

fn default_tab_id() -> String {
    "default".to_string()
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            debounce: default_debounce(),
            page_size: default_page_size(),
            default_time_range: default_time_range(),
            time_grouping: TimeGrouping::default(),
            utc_offset_secs: 0,
            week_start: default_week_start(),
            auto_refresh: None,
            mirror: MirrorConfig::default(),
            tab_id: default_tab_id(),
        }
    }
}

impl ConsoleConfig {
    pub fn debounce(&self) -> Result<Duration> {
        parse_duration(&self.debounce)
    }

    pub fn auto_refresh(&self) -> Result<Option<Duration>> {
        self.auto_refresh.as_deref().map(parse_duration).transpose()
    }

    /// The default time range; an unparsable value falls back to `last_15m`.
    pub fn default_time_range(&self) -> TimeSpec {
        self.default_time_range.parse().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "invalid default time range, using last_15m");
            TimeSpec::default()
        })
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_secs)
            .ok_or_else(|| Error::Config(format!("utc offset out of range: {}", self.utc_offset_secs)))
    }

    pub fn week_start(&self) -> Result<Weekday> {
        Weekday::from_str(&self.week_start)
            .map_err(|_| Error::Config(format!("invalid week start: {}", self.week_start)))
    }
}

/// Connection to the log search backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Sent as a bearer token when set.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            token: None,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.request_timeout)
    }
}

/// Load the console configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ConsoleConfig> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

    serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))
}

/// Parse a duration string such as `300ms`, `15s`, `1m` or `2h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration string".to_string()));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if num_end == 0 {
        return Err(Error::Config(format!("duration must start with a number: {}", s)));
    }

    let value: f64 = s[..num_end]
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration number: {}", s)))?;
    let millis_per_unit = match &s[num_end..] {
        "ms" => 1.0,
        "s" | "" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        unit => {
            return Err(Error::Config(format!("unknown duration unit: {}", unit)));
        }
    };

    Ok(Duration::from_millis((value * millis_per_unit).round() as u64))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::milliseconds("300ms", 300)]
    #[case::seconds("15s", 15_000)]
    #[case::minutes("1m", 60_000)]
    #[case::hours("2h", 7_200_000)]
    #[case::no_unit("30", 30_000)]
    #[case::fractional("1.5s", 1_500)]
    fn should_parse_duration(#[case] input: &str, #[case] expected_millis: u128) {
        // when
        let result = parse_duration(input).unwrap();

        // then
        assert_eq!(result.as_millis(), expected_millis);
    }

    #[rstest]
    #[case::empty("")]
    #[case::invalid_unit("15x")]
    #[case::no_number("s")]
    fn should_fail_to_parse_invalid_duration(#[case] input: &str) {
        assert!(matches!(parse_duration(input), Err(Error::Config(_))));
    }

    #[test]
    fn should_use_defaults_for_empty_config() {
        // when
        let config: ConsoleConfig = serde_yaml::from_str("{}").unwrap();

        // then
        assert_eq!(config.debounce().unwrap(), Duration::from_millis(300));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.default_time_range(), TimeSpec::Quick(QuickRange::Last15Minutes));
        assert_eq!(config.time_grouping, TimeGrouping::Auto);
        assert_eq!(config.week_start().unwrap(), Weekday::Mon);
        assert_eq!(config.auto_refresh().unwrap(), None);
        assert_eq!(config.mirror, MirrorConfig::InMemory);
        assert_eq!(config.backend.base_url, "http://localhost:8080");
    }

    #[test]
    fn should_parse_console_config() {
        // given
        let yaml = r#"
backend:
  base_url: https://logs.example.com
  request_timeout: 10s
debounce: 150ms
page_size: 100
default_time_range: "now-2h ~ now"
time_grouping: minute
utc_offset_secs: 28800
week_start: sunday
auto_refresh: 30s
mirror:
  type: File
  path: /tmp/logsearch
tab_id: tab-1
"#;

        // when
        let config: ConsoleConfig = serde_yaml::from_str(yaml).unwrap();

        // then
        assert_eq!(config.backend.request_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.debounce().unwrap(), Duration::from_millis(150));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.default_time_range().to_string(), "now-2h ~ now");
        assert_eq!(config.time_grouping, TimeGrouping::Minute);
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), 28800);
        assert_eq!(config.week_start().unwrap(), Weekday::Sun);
        assert_eq!(config.auto_refresh().unwrap(), Some(Duration::from_secs(30)));
        assert!(matches!(config.mirror, MirrorConfig::File(_)));
    }

    #[test]
    fn should_fall_back_on_invalid_default_time_range() {
        let config = ConsoleConfig {
            default_time_range: "yesterday-ish".to_string(),
            ..ConsoleConfig::default()
        };
        assert_eq!(config.default_time_range(), TimeSpec::default());
    }
}
