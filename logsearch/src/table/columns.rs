//! Column selection, ordering and widths.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::ColumnInfo;

/// Used when a module has no usable time column.
pub const FALLBACK_TIME_FIELD: &str = "log_time";

const COMMON_TIME_FIELDS: [&str; 5] = ["logs_timestamp", "log_time", "timestamp", "time", "@timestamp"];

const UNSORTABLE_TYPES: [&str; 11] = [
    "LONGTEXT",
    "MEDIUMTEXT",
    "TINYTEXT",
    "JSON",
    "BLOB",
    "BITMAP",
    "ARRAY",
    "MAP",
    "STRUCT",
    "JSONB",
    "VARIANT",
];

const NUMERIC_TYPES: [&str; 9] = [
    "INT", "INTEGER", "BIGINT", "TINYINT", "SMALLINT", "FLOAT", "DOUBLE", "DECIMAL", "NUMERIC",
];

const MIN_AUTO_WIDTH: u32 = 120;
const MAX_AUTO_WIDTH: u32 = 400;
const WIDTH_PADDING: u32 = 112;
const SMALL_SCREEN: u32 = 1200;

/// Picks the column rows are timed by.
///
/// The configured field wins when the module actually has it. Otherwise the
/// first well-known time column name, then the first column whose name
/// mentions time, then the first column at all.
pub fn determine_time_field(configured: Option<&str>, columns: &[ColumnInfo]) -> String {
    let has = |name: &str| columns.iter().any(|c| c.column_name == name);

    if let Some(configured) = configured {
        if has(configured) {
            return configured.to_string();
        }
    }
    if let Some(common) = COMMON_TIME_FIELDS.iter().find(|&&name| has(name)) {
        return common.to_string();
    }
    let mentions_time = columns.iter().find(|c| {
        let name = c.column_name.to_lowercase();
        name.contains("time") || name.contains("timestamp")
    });
    if let Some(column) = mentions_time {
        return column.column_name.clone();
    }
    columns
        .first()
        .map(|c| c.column_name.clone())
        .unwrap_or_else(|| FALLBACK_TIME_FIELD.to_string())
}

/// Types that cannot be ordered meaningfully (large text, nested and binary
/// values).
pub fn is_sortable(data_type: &str) -> bool {
    let data_type = base_type(data_type);
    !UNSORTABLE_TYPES.contains(&data_type.as_str())
}

pub fn is_numeric(data_type: &str) -> bool {
    let data_type = base_type(data_type);
    NUMERIC_TYPES.contains(&data_type.as_str())
}

/// `VARCHAR(255)`, `decimal(10, 2)` and `ARRAY<INT>` are typed by their name
/// alone.
fn base_type(data_type: &str) -> String {
    let name = data_type.split(['(', '<']).next().unwrap_or_default();
    name.trim().to_uppercase()
}

/// Estimated rendered width of a header, in pixels.
fn text_width(text: &str) -> u32 {
    text.chars().map(|c| if c.is_ascii() { 8 } else { 14 }).sum()
}

/// Default width of a column that was never resized.
pub fn auto_width(column_name: &str, screen_width: u32) -> u32 {
    let max = if screen_width < SMALL_SCREEN {
        (screen_width.saturating_sub(300) / 4).max(MIN_AUTO_WIDTH)
    } else {
        MAX_AUTO_WIDTH
    };
    (text_width(column_name) + WIDTH_PADDING).clamp(MIN_AUTO_WIDTH, max)
}

/// A column as the table shows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub column_name: String,
    pub data_type: String,
    pub selected: bool,
    pub sortable: bool,
    /// Width set by the user; `None` means auto.
    pub width: Option<u32>,
    /// Logical time the column was last selected; kept on deselection.
    pub created_at: Option<u64>,
    pub is_fixed: bool,
}

impl ColumnDescriptor {
    fn from_info(info: ColumnInfo) -> Self {
        Self {
            sortable: is_sortable(&info.data_type),
            column_name: info.column_name,
            data_type: info.data_type,
            selected: false,
            width: None,
            created_at: None,
            is_fixed: info.is_fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Selected,
    Deselected,
    /// The time column and fixed columns stay selected.
    Locked,
}

/// The columns of the current module.
#[derive(Debug, Clone, Default)]
pub struct ColumnSet {
    columns: Vec<ColumnDescriptor>,
    time_field: String,
    tick: u64,
}

impl ColumnSet {
    /// Builds the set with `active` fields selected in the given order.
    /// Unknown names in `active` are ignored.
    pub fn new(columns: Vec<ColumnInfo>, time_field: impl Into<String>, active: &[String]) -> Self {
        let mut set = Self {
            columns: columns.into_iter().map(ColumnDescriptor::from_info).collect(),
            time_field: time_field.into(),
            tick: 0,
        };
        for name in active {
            set.select(name);
        }
        let time_field = set.time_field.clone();
        set.select(&time_field);
        set
    }

    pub fn time_field(&self) -> &str {
        &self.time_field
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.column_name.as_str())
    }

    pub fn toggle(&mut self, name: &str) -> Result<ToggleOutcome> {
        let time_field = self.time_field.clone();
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.column_name == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown column {}", name)))?;

        if column.column_name == time_field || column.is_fixed {
            tracing::debug!(column = name, "column cannot be deselected");
            return Ok(ToggleOutcome::Locked);
        }
        if column.selected {
            column.selected = false;
            return Ok(ToggleOutcome::Deselected);
        }
        self.select(name);
        Ok(ToggleOutcome::Selected)
    }

    fn select(&mut self, name: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(column) = self.columns.iter_mut().find(|c| c.column_name == name) {
            column.selected = true;
            column.created_at = Some(tick);
        }
    }

    /// Selected columns: the time column first, then in selection order.
    pub fn active_fields(&self) -> Vec<String> {
        let mut selected: Vec<&ColumnDescriptor> = self
            .columns
            .iter()
            .filter(|c| c.selected && c.column_name != self.time_field)
            .collect();
        selected.sort_by_key(|c| c.created_at.unwrap_or(0));

        let mut fields = Vec::with_capacity(selected.len() + 1);
        if self.contains(&self.time_field) {
            fields.push(self.time_field.clone());
        }
        fields.extend(selected.into_iter().map(|c| c.column_name.clone()));
        fields
    }

    /// Drops names that are not columns of this module.
    pub fn retain_known(&self, fields: &[String]) -> Vec<String> {
        fields
            .iter()
            .filter(|f| {
                let known = self.contains(f);
                if !known {
                    tracing::debug!(field = %f, "dropping field missing from module columns");
                }
                known
            })
            .cloned()
            .collect()
    }

    pub fn set_width(&mut self, name: &str, width: u32) -> Result<()> {
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.column_name == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown column {}", name)))?;
        column.width = Some(width);
        Ok(())
    }

    pub fn width(&self, name: &str, screen_width: u32) -> u32 {
        self.get(name)
            .and_then(|c| c.width)
            .unwrap_or_else(|| auto_width(name, screen_width))
    }

    /// Widths set by the user, for persisting.
    pub fn width_overrides(&self) -> HashMap<String, u32> {
        self.columns
            .iter()
            .filter_map(|c| c.width.map(|w| (c.column_name.clone(), w)))
            .collect()
    }
}
