//! Value types for rowsync-rdbc
//!
//! Captured change rows and target rows share one representation: an ordered
//! list of named [`Value`]s. Column lookups are case-insensitive, matching how
//! most relational backends resolve unquoted identifiers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One replicated column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// INTEGER
    Int32(i32),
    /// BIGINT
    Int64(i64),
    /// DOUBLE PRECISION
    Float64(f64),
    /// Character data of any width
    String(String),
    /// Binary column content
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Timestamp without zone
    DateTime(NaiveDateTime),
    /// Zoned timestamp, normalized to UTC
    DateTimeTz(DateTime<Utc>),
}

/// Text layouts accepted when a timestamp arrives as a string
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

impl Value {
    /// SQL NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view: integral numbers and numeric text
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Borrowed text, for string values only
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Point in time, UTC for zoned values; dates are taken at midnight
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(ts) => Some(*ts),
            Self::DateTimeTz(ts) => Some(ts.naive_utc()),
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::String(s) => parse_timestamp(s.trim()),
            _ => None,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

macro_rules! value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(v: $source) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f64 => Float64,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    NaiveDate => Date,
    NaiveDateTime => DateTime,
    DateTime<Utc> => DateTimeTz,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Row as ordered, named column values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Values, parallel to `columns`
    values: Vec<Value>,
}

impl Row {
    /// Row with `column` set to `value`
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// No columns at all
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names, in order
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in column order
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a column position
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value of a column, matched case-insensitively
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.position(name).and_then(|idx| self.values.get(idx))
    }

    /// Whether the row carries a column with this name
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replace the value of an existing column or append a new one
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.position(&column) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    /// Remove a column, returning its value
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.position(name)?;
        self.columns.remove(idx);
        Some(self.values.remove(idx))
    }

    /// Keep only the columns accepted by the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        let mut idx = 0;
        while idx < self.columns.len() {
            if keep(&self.columns[idx], &self.values[idx]) {
                idx += 1;
            } else {
                self.columns.remove(idx);
                self.values.remove(idx);
            }
        }
    }

    /// Iterate over `(column, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Project the named columns, in the requested order, skipping absent ones
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Row {
        let mut row = Row::default();
        for name in names {
            if let Some(value) = self.get_by_name(name.as_ref()) {
                row.set(name.as_ref(), value.clone());
            }
        }
        row
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::default();
        for (k, v) in iter {
            row.set(k, v);
        }
        row
    }
}

/// Target column as described by the database
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Declared SQL type
    pub type_name: String,
    /// Accepts NULL
    pub nullable: bool,
    /// 1-based position in the primary key
    pub primary_key_ordinal: Option<u32>,
    /// Values are generated by the database unless identity insert is on
    pub auto_increment: bool,
}

impl ColumnMetadata {
    /// Nullable, non-key column
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key_ordinal: None,
            auto_increment: false,
        }
    }

    /// Mark the column as the given primary key position
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Mark the column as an identity column
    pub fn identity(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Part of the primary key
    #[inline]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }
}

/// Target table as described by the database
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Table name as the target spells it
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// Table with no columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column
    pub fn with_column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Column by case-insensitive name
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Primary key columns in key order
    pub fn primary_key_columns(&self) -> Vec<&ColumnMetadata> {
        let mut key: Vec<_> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        key.sort_by_key(|c| c.primary_key_ordinal);
        key
    }

    /// Whether any of the given columns is an identity column
    pub fn has_identity_in(&self, row: &Row) -> bool {
        self.columns
            .iter()
            .any(|c| c.auto_increment && row.contains(&c.name))
    }
}
