//! Record model shared by the readers, the flattener and the sink

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

/// A flat cell value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Null,
    Integer(i64),
    Text(String),
}

impl Scalar {
    /// Convert a JSON leaf into a scalar
    ///
    /// Integers that fit in an `i64` stay integers. Floats and booleans keep
    /// their JSON rendering as text. Arrays and objects are rendered into a
    /// single text value, see [`render_list`].
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Integer(i),
                None => Scalar::Text(n.to_string()),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            Value::Bool(b) => Scalar::Text(b.to_string()),
            Value::Array(_) | Value::Object(_) => Scalar::Text(render_list(value)),
        }
    }

    /// Text cell, with the empty string read as null
    pub fn from_field(value: &str) -> Self {
        if value.is_empty() {
            Scalar::Null
        } else {
            Scalar::Text(value.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, accepting text that parses as one
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Scalar::Integer(i) => Some(*i),
            Scalar::Text(s) => s.trim().parse().ok(),
            Scalar::Null => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Integer(_) => "integer",
            Scalar::Text(_) => "text",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "None"),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// Render a list-valued field the way the warehouse has always stored it
///
/// `[1, 2]`, `['a', 'b']`, `[None, True]`, `[{'k': 1}]`.
pub fn render_list(value: &Value) -> String {
    let mut out = String::new();
    write_literal(value, &mut out);
    out
}

fn write_literal(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_quoted(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_quoted(key, out);
                out.push_str(": ");
                write_literal(item, out);
            }
            out.push('}');
        },
    }
}

fn write_quoted(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

/// A single-level row: column name to scalar, in first-seen column order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatRow {
    cells: IndexMap<String, Scalar>,
}

impl FlatRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, keeping its original position when it already exists
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        self.cells.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.cells.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for FlatRow {
    type Item = (String, Scalar);
    type IntoIter = indexmap::map::IntoIter<String, Scalar>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_iter()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for FlatRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = FlatRow::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

/// Where a record came from: its position in the stream and an entry name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    pub index: u64,
    pub name: String,
}

impl RecordOrigin {
    pub fn new(index: u64, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index, self.name)
    }
}

/// Undecoded record content
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Bytes of one archive entry
    Document(Vec<u8>),
    /// One delimited-text row with caller-supplied field names
    Delimited {
        names: Vec<String>,
        values: Vec<String>,
    },
    /// One geospatial feature; geometry is WKT, `None` when it could not be converted
    Feature {
        geometry: Option<String>,
        properties: Vec<(String, Scalar)>,
    },
}

/// A single unit of input, consumed once by the flattener
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub origin: RecordOrigin,
    pub payload: RawPayload,
}

impl RawRecord {
    pub fn new(origin: RecordOrigin, payload: RawPayload) -> Self {
        Self { origin, payload }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_from_json() {
        assert_eq!(Scalar::from_json(&json!(null)), Scalar::Null);
        assert_eq!(Scalar::from_json(&json!(42)), Scalar::Integer(42));
        assert_eq!(Scalar::from_json(&json!(1.5)), Scalar::Text("1.5".into()));
        assert_eq!(Scalar::from_json(&json!(true)), Scalar::Text("true".into()));
        assert_eq!(Scalar::from_json(&json!(u64::MAX)), Scalar::Text(u64::MAX.to_string()));
    }

    #[test]
    fn test_render_list() {
        assert_eq!(render_list(&json!([1, 2])), "[1, 2]");
        assert_eq!(render_list(&json!(["a", "b"])), "['a', 'b']");
        assert_eq!(render_list(&json!([null, true, false])), "[None, True, False]");
        assert_eq!(render_list(&json!([{"k": [1]}])), "[{'k': [1]}]");
        assert_eq!(render_list(&json!(["it's"])), r"['it\'s']");
        assert_eq!(render_list(&json!([])), "[]");
    }

    #[test]
    fn test_scalar_as_integer_is_lax() {
        assert_eq!(Scalar::Text(" 12 ".into()).as_integer(), Some(12));
        assert_eq!(Scalar::Text("twelve".into()).as_integer(), None);
        assert_eq!(Scalar::Null.as_integer(), None);
    }

    #[test]
    fn test_flat_row_keeps_first_position_on_overwrite() {
        let mut row = FlatRow::new();
        row.insert("a", 1i64);
        row.insert("b", 2i64);
        row.insert("a", 3i64);

        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(row.get("a"), Some(&Scalar::Integer(3)));
    }

    #[test]
    fn test_from_field_reads_empty_as_null() {
        assert_eq!(Scalar::from_field(""), Scalar::Null);
        assert_eq!(Scalar::from_field("x"), Scalar::Text("x".into()));
    }
}
