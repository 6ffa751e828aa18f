//! Symbolic time ranges and their resolution against the current instant.
//!
//! A console time range is one of three shapes:
//!
//! - **quick**: a named window such as `last_15m` or `today`;
//! - **relative**: two expressions such as `now-15m/m ~ now`, each an offset
//!   from now that may be truncated to a unit boundary;
//! - **absolute**: two concrete timestamps, `2024-03-13 10:00:00.000 ~ ...`.
//!
//! Quick and relative ranges are functions of "now" and are resolved afresh
//! every time; nothing here caches a resolved range. The serialized text of a
//! [`TimeSpec`] is all that is needed to rebuild it, which is what makes it
//! safe to put in shared links and the per-tab mirror.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime};
use chrono::{Offset, TimeDelta, Timelike, Utc, Weekday};
use common::Clock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Format used for every resolved timestamp sent to the backend.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Separator between the two sides of a relative or absolute range.
pub const RANGE_SEPARATOR: &str = " ~ ";

const PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub fn format_datetime(time: &NaiveDateTime) -> String {
    time.format(DATE_TIME_FORMAT).to_string()
}

/// Parses `YYYY-MM-DD HH:MM:SS[.fff]` (a `T` separator is also accepted).
/// Sub-millisecond digits are dropped.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let normalized = text.trim().replacen('T', " ", 1);
    let parsed = NaiveDateTime::parse_from_str(&normalized, PARSE_FORMAT).ok()?;
    truncate_to_millis(parsed)
}

fn truncate_to_millis(time: NaiveDateTime) -> Option<NaiveDateTime> {
    let millis = time.nanosecond() / 1_000_000;
    time.with_nanosecond(millis * 1_000_000)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time range {input:?}: {reason}")]
pub struct TimeParseError {
    pub input: String,
    pub reason: &'static str,
}

impl TimeParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Named windows relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuickRange {
    Last5Minutes,
    Last15Minutes,
    Last30Minutes,
    LastHour,
    Last8Hours,
    Last24Hours,
    Last7Days,
    /// Fourteen calendar days including today.
    LastTwoWeeks,
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
}

impl QuickRange {
    pub const ALL: [QuickRange; 12] = [
        QuickRange::Last5Minutes,
        QuickRange::Last15Minutes,
        QuickRange::Last30Minutes,
        QuickRange::LastHour,
        QuickRange::Last8Hours,
        QuickRange::Last24Hours,
        QuickRange::Last7Days,
        QuickRange::LastTwoWeeks,
        QuickRange::Today,
        QuickRange::Yesterday,
        QuickRange::ThisWeek,
        QuickRange::LastWeek,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            QuickRange::Last5Minutes => "last_5m",
            QuickRange::Last15Minutes => "last_15m",
            QuickRange::Last30Minutes => "last_30m",
            QuickRange::LastHour => "last_1h",
            QuickRange::Last8Hours => "last_8h",
            QuickRange::Last24Hours => "last_24h",
            QuickRange::Last7Days => "last_7d",
            QuickRange::LastTwoWeeks => "last_2week",
            QuickRange::Today => "today",
            QuickRange::Yesterday => "yesterday",
            QuickRange::ThisWeek => "this_week",
            QuickRange::LastWeek => "last_week",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QuickRange::Last5Minutes => "Last 5 minutes",
            QuickRange::Last15Minutes => "Last 15 minutes",
            QuickRange::Last30Minutes => "Last 30 minutes",
            QuickRange::LastHour => "Last 1 hour",
            QuickRange::Last8Hours => "Last 8 hours",
            QuickRange::Last24Hours => "Last 24 hours",
            QuickRange::Last7Days => "Last 7 days",
            QuickRange::LastTwoWeeks => "Last 2 weeks",
            QuickRange::Today => "Today",
            QuickRange::Yesterday => "Yesterday",
            QuickRange::ThisWeek => "This week",
            QuickRange::LastWeek => "Last week",
        }
    }

    pub fn from_key(key: &str) -> Option<QuickRange> {
        QuickRange::ALL.into_iter().find(|q| q.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn symbol(&self) -> char {
        match self {
            TimeUnit::Second => 's',
            TimeUnit::Minute => 'm',
            TimeUnit::Hour => 'h',
            TimeUnit::Day => 'd',
            TimeUnit::Week => 'w',
            TimeUnit::Month => 'M',
            TimeUnit::Year => 'y',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<TimeUnit> {
        match symbol {
            's' => Some(TimeUnit::Second),
            'm' => Some(TimeUnit::Minute),
            'h' => Some(TimeUnit::Hour),
            'd' => Some(TimeUnit::Day),
            'w' => Some(TimeUnit::Week),
            'M' => Some(TimeUnit::Month),
            'y' => Some(TimeUnit::Year),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ago,
    Later,
}

/// An offset from now, optionally truncated to the start of its unit.
///
/// `{count: 0, unit: Second, exact: false}` is the canonical "now" and
/// serializes as the bare `now` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeExpr {
    pub count: u32,
    pub unit: TimeUnit,
    pub direction: Direction,
    pub exact: bool,
}

impl RelativeExpr {
    pub fn now() -> Self {
        Self {
            count: 0,
            unit: TimeUnit::Second,
            direction: Direction::Ago,
            exact: false,
        }
    }

    pub fn ago(count: u32, unit: TimeUnit) -> Self {
        Self {
            count,
            unit,
            direction: Direction::Ago,
            exact: false,
        }
    }

    pub fn later(count: u32, unit: TimeUnit) -> Self {
        Self {
            count,
            unit,
            direction: Direction::Later,
            exact: false,
        }
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn is_now(&self) -> bool {
        self.count == 0 && !self.exact
    }

    fn label(&self) -> String {
        if self.is_now() {
            return "now".to_string();
        }
        let mut label = if self.count == 0 {
            "now".to_string()
        } else {
            let plural = if self.count == 1 { "" } else { "s" };
            let direction = match self.direction {
                Direction::Ago => "ago",
                Direction::Later => "from now",
            };
            format!("{} {}{} {}", self.count, self.unit.name(), plural, direction)
        };
        if self.exact {
            label.push_str(&format!(" (start of {})", self.unit.name()));
        }
        label
    }
}

impl fmt::Display for RelativeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "now")?;
        if self.count > 0 {
            let sign = match self.direction {
                Direction::Ago => '-',
                Direction::Later => '+',
            };
            write!(f, "{}{}{}", sign, self.count, self.unit.symbol())?;
        }
        if self.exact {
            write!(f, "/{}", self.unit.symbol())?;
        }
        Ok(())
    }
}

impl FromStr for RelativeExpr {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let rest = text
            .strip_prefix("now")
            .ok_or_else(|| TimeParseError::new(text, "relative expression must start with now"))?;

        let (offset, rounding) = match rest.split_once('/') {
            Some((offset, rounding)) => (offset, Some(rounding)),
            None => (rest, None),
        };
        let rounding = match rounding {
            Some(r) => {
                let mut chars = r.chars();
                match (chars.next().and_then(TimeUnit::from_symbol), chars.next()) {
                    (Some(unit), None) => Some(unit),
                    _ => return Err(TimeParseError::new(text, "unknown rounding unit")),
                }
            }
            None => None,
        };

        if offset.is_empty() {
            return Ok(match rounding {
                Some(unit) => RelativeExpr {
                    count: 0,
                    unit,
                    direction: Direction::Ago,
                    exact: true,
                },
                None => RelativeExpr::now(),
            });
        }

        let direction = match offset.chars().next() {
            Some('-') => Direction::Ago,
            Some('+') => Direction::Later,
            _ => return Err(TimeParseError::new(text, "expected + or - after now")),
        };
        let body = &offset[1..];
        let unit = body
            .chars()
            .last()
            .and_then(TimeUnit::from_symbol)
            .ok_or_else(|| TimeParseError::new(text, "unknown offset unit"))?;
        let digits = &body[..body.len() - 1];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeParseError::new(text, "offset count must be a number"));
        }
        let count: u32 = digits
            .parse()
            .map_err(|_| TimeParseError::new(text, "offset count out of range"))?;

        if rounding.is_some_and(|rounding| rounding != unit) {
            return Err(TimeParseError::new(
                text,
                "rounding unit must match offset unit",
            ));
        }

        Ok(RelativeExpr {
            count,
            unit,
            direction,
            exact: rounding.is_some(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeMode {
    Quick,
    Relative,
    Absolute,
}

/// The symbolic descriptor of a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeSpec {
    Quick(QuickRange),
    Relative {
        start: RelativeExpr,
        end: RelativeExpr,
    },
    Absolute {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

impl Default for TimeSpec {
    fn default() -> Self {
        TimeSpec::Quick(QuickRange::Last15Minutes)
    }
}

impl TimeSpec {
    pub fn mode(&self) -> TimeMode {
        match self {
            TimeSpec::Quick(_) => TimeMode::Quick,
            TimeSpec::Relative { .. } => TimeMode::Relative,
            TimeSpec::Absolute { .. } => TimeMode::Absolute,
        }
    }

    /// True when resolving this spec depends on the current instant.
    pub fn is_relative_to_now(&self) -> bool {
        !matches!(self, TimeSpec::Absolute { .. })
    }

    pub fn label(&self) -> String {
        match self {
            TimeSpec::Quick(quick) => quick.label().to_string(),
            TimeSpec::Relative { start, end } => {
                format!("{}{}{}", start.label(), RANGE_SEPARATOR, end.label())
            }
            TimeSpec::Absolute { start, end } => format!(
                "{}{}{}",
                format_datetime(start),
                RANGE_SEPARATOR,
                format_datetime(end)
            ),
        }
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Quick(quick) => f.write_str(quick.key()),
            TimeSpec::Relative { start, end } => write!(f, "{}{}{}", start, RANGE_SEPARATOR, end),
            TimeSpec::Absolute { start, end } => write!(
                f,
                "{}{}{}",
                format_datetime(start),
                RANGE_SEPARATOR,
                format_datetime(end)
            ),
        }
    }
}

impl FromStr for TimeSpec {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Some(quick) = QuickRange::from_key(text) {
            return Ok(TimeSpec::Quick(quick));
        }
        let (left, right) = text
            .split_once('~')
            .ok_or_else(|| TimeParseError::new(text, "unknown quick range"))?;

        if let (Ok(start), Ok(end)) = (left.parse::<RelativeExpr>(), right.parse::<RelativeExpr>())
        {
            return Ok(TimeSpec::Relative { start, end });
        }

        match (parse_datetime(left), parse_datetime(right)) {
            (Some(start), Some(end)) if start <= end => Ok(TimeSpec::Absolute { start, end }),
            (Some(_), Some(_)) => Err(TimeParseError::new(text, "start is after end")),
            _ => Err(TimeParseError::new(
                text,
                "sides are neither relative expressions nor date-times",
            )),
        }
    }
}

impl Serialize for TimeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Concrete bounds, both inclusive, in the console's local time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// A time spec together with its resolution at a particular instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeOption {
    pub mode: TimeMode,
    pub spec: TimeSpec,
    pub range: ResolvedRange,
    pub label: String,
}

impl TimeOption {
    pub fn serialize(&self) -> String {
        self.spec.to_string()
    }
}

/// Resolves [`TimeSpec`]s against a clock in a fixed time zone.
#[derive(Clone)]
pub struct TimeRangeResolver {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    week_start: Weekday,
}

impl TimeRangeResolver {
    /// A resolver in UTC with weeks starting on Monday.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            offset: Utc.fix(),
            week_start: Weekday::Mon,
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_week_start(mut self, week_start: Weekday) -> Self {
        self.week_start = week_start;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The current instant in local time, at millisecond precision.
    pub fn now(&self) -> NaiveDateTime {
        let utc = DateTime::<Utc>::from_timestamp_millis(self.clock.epoch_millis())
            .unwrap_or_else(|| DateTime::<Utc>::from(self.clock.now()));
        utc.with_timezone(&self.offset).naive_local()
    }

    pub fn resolve_quick(&self, quick: QuickRange) -> ResolvedRange {
        let now = self.now();
        let back = |count: u32, unit: TimeUnit| ResolvedRange {
            start: shift(now, count, unit, Direction::Ago),
            end: now,
        };
        match quick {
            QuickRange::Last5Minutes => back(5, TimeUnit::Minute),
            QuickRange::Last15Minutes => back(15, TimeUnit::Minute),
            QuickRange::Last30Minutes => back(30, TimeUnit::Minute),
            QuickRange::LastHour => back(1, TimeUnit::Hour),
            QuickRange::Last8Hours => back(8, TimeUnit::Hour),
            QuickRange::Last24Hours => back(24, TimeUnit::Hour),
            QuickRange::Last7Days => back(7, TimeUnit::Day),
            QuickRange::LastTwoWeeks => back(13, TimeUnit::Day),
            QuickRange::Today => ResolvedRange {
                start: start_of_day(now),
                end: end_of_day(now),
            },
            QuickRange::Yesterday => {
                let yesterday = shift(now, 1, TimeUnit::Day, Direction::Ago);
                ResolvedRange {
                    start: start_of_day(yesterday),
                    end: end_of_day(yesterday),
                }
            }
            QuickRange::ThisWeek => self.week_of(now),
            QuickRange::LastWeek => self.week_of(shift(now, 1, TimeUnit::Week, Direction::Ago)),
        }
    }

    pub fn resolve_relative(&self, start: &RelativeExpr, end: &RelativeExpr) -> ResolvedRange {
        let now = self.now();
        ResolvedRange {
            start: self.apply(now, start),
            end: self.apply(now, end),
        }
    }

    pub fn resolve(&self, spec: &TimeSpec) -> ResolvedRange {
        match spec {
            TimeSpec::Quick(quick) => self.resolve_quick(*quick),
            TimeSpec::Relative { start, end } => self.resolve_relative(start, end),
            TimeSpec::Absolute { start, end } => ResolvedRange {
                start: *start,
                end: *end,
            },
        }
    }

    pub fn option(&self, spec: TimeSpec) -> TimeOption {
        TimeOption {
            mode: spec.mode(),
            range: self.resolve(&spec),
            label: spec.label(),
            spec,
        }
    }

    /// Parses serialized text, falling back to the last 15 minutes when the
    /// text is not a quick key, relative pair, or absolute pair.
    pub fn parse_serialized(&self, text: &str) -> TimeOption {
        let spec = match text.parse::<TimeSpec>() {
            Ok(spec) => spec,
            Err(err) => {
                tracing::debug!(error = %err, "falling back to default time range");
                TimeSpec::default()
            }
        };
        self.option(spec)
    }

    pub fn serialize(&self, option: &TimeOption) -> String {
        option.serialize()
    }

    fn apply(&self, now: NaiveDateTime, expr: &RelativeExpr) -> NaiveDateTime {
        let shifted = shift(now, expr.count, expr.unit, expr.direction);
        if expr.exact {
            self.truncate(shifted, expr.unit)
        } else {
            shifted
        }
    }

    fn truncate(&self, time: NaiveDateTime, unit: TimeUnit) -> NaiveDateTime {
        let date = time.date();
        let truncated = match unit {
            TimeUnit::Second => time.with_nanosecond(0),
            TimeUnit::Minute => date.and_hms_opt(time.hour(), time.minute(), 0),
            TimeUnit::Hour => date.and_hms_opt(time.hour(), 0, 0),
            TimeUnit::Day => Some(start_of_day(time)),
            TimeUnit::Week => Some(self.start_of_week(time)),
            TimeUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .map(|d| d.and_time(NaiveTime::MIN)),
            TimeUnit::Year => {
                NaiveDate::from_ymd_opt(date.year(), 1, 1).map(|d| d.and_time(NaiveTime::MIN))
            }
        };
        truncated.unwrap_or(time)
    }

    fn start_of_week(&self, time: NaiveDateTime) -> NaiveDateTime {
        let into_week = (7 + time.weekday().num_days_from_monday()
            - self.week_start.num_days_from_monday())
            % 7;
        start_of_day(time) - TimeDelta::days(i64::from(into_week))
    }

    fn week_of(&self, time: NaiveDateTime) -> ResolvedRange {
        let start = self.start_of_week(time);
        ResolvedRange {
            start,
            end: start + TimeDelta::days(7) - TimeDelta::milliseconds(1),
        }
    }
}

fn start_of_day(time: NaiveDateTime) -> NaiveDateTime {
    time.date().and_time(NaiveTime::MIN)
}

fn end_of_day(time: NaiveDateTime) -> NaiveDateTime {
    start_of_day(time) + TimeDelta::days(1) - TimeDelta::milliseconds(1)
}

fn shift(time: NaiveDateTime, count: u32, unit: TimeUnit, direction: Direction) -> NaiveDateTime {
    let delta = match unit {
        TimeUnit::Second => TimeDelta::try_seconds(i64::from(count)),
        TimeUnit::Minute => TimeDelta::try_minutes(i64::from(count)),
        TimeUnit::Hour => TimeDelta::try_hours(i64::from(count)),
        TimeUnit::Day => TimeDelta::try_days(i64::from(count)),
        TimeUnit::Week => TimeDelta::try_weeks(i64::from(count)),
        TimeUnit::Month | TimeUnit::Year => {
            let months = if unit == TimeUnit::Year {
                count.saturating_mul(12)
            } else {
                count
            };
            let shifted = match direction {
                Direction::Ago => time.checked_sub_months(Months::new(months)),
                Direction::Later => time.checked_add_months(Months::new(months)),
            };
            return shifted.unwrap_or(time);
        }
    };
    let shifted = delta.and_then(|delta| match direction {
        Direction::Ago => time.checked_sub_signed(delta),
        Direction::Later => time.checked_add_signed(delta),
    });
    shifted.unwrap_or(time)
}

/// Serde adapter for optional timestamps in [`DATE_TIME_FORMAT`].
pub(crate) mod optional_datetime {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&super::format_datetime(time)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::parse_datetime(&text)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {:?}", text))),
            None => Ok(None),
        }
    }
}
