//! Record flattening
//!
//! Turns nested JSON documents, delimited rows and geospatial features into
//! [`FlatRow`]s. Nested mappings become dotted column names; lists are kept as
//! one text value rather than spread across columns.

use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::record::{FlatRow, RawPayload, RawRecord, Scalar};

/// Column name given to a feature's geometry
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Flatten a JSON object into a single-level row
///
/// Mapping values are walked recursively with the path extended by
/// `key + separator`. Everything else, lists included, is assigned to the
/// accumulated path. An empty nested mapping contributes no columns. When two
/// paths collapse onto the same name the later value wins.
pub fn flatten_object(object: &Map<String, Value>, separator: char) -> FlatRow {
    let mut row = FlatRow::new();
    let mut path = String::new();
    walk(object, separator, &mut path, &mut row);
    row
}

fn walk(object: &Map<String, Value>, separator: char, path: &mut String, row: &mut FlatRow) {
    for (key, value) in object {
        let mark = path.len();
        path.push_str(key);

        match value {
            Value::Object(inner) => {
                path.push(separator);
                walk(inner, separator, path, row);
            },
            leaf => row.insert(path.as_str(), Scalar::from_json(leaf)),
        }

        path.truncate(mark);
    }
}

/// Remove a literal prefix from a column name
///
/// The prefix is removed for as long as the name still starts with it, so
/// applying this twice gives the same result as applying it once. An empty
/// prefix leaves the name untouched.
pub fn strip_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return name;
    }

    let mut stripped = name;
    while let Some(rest) = stripped.strip_prefix(prefix) {
        stripped = rest;
    }
    stripped
}

/// Rename every column of a row with [`strip_prefix`]
///
/// A stripped name that would collide with a column already in the row keeps
/// its prefixed name, so no value is ever dropped by the rename.
pub fn strip_column_prefix(row: FlatRow, prefix: &str) -> FlatRow {
    if prefix.is_empty() || !row.columns().any(|c| c.starts_with(prefix)) {
        return row;
    }

    let original: Vec<String> = row.columns().map(str::to_string).collect();
    let mut renamed = FlatRow::new();

    for (column, value) in row {
        let stripped = strip_prefix(&column, prefix);
        let taken = stripped != column
            && (renamed.contains(stripped) || original.iter().any(|c| c == stripped));

        if stripped.is_empty() || taken {
            renamed.insert(column, value);
        } else {
            renamed.insert(stripped, value);
        }
    }

    renamed
}

/// Converts raw records into flat rows for one feed
#[derive(Debug, Clone)]
pub struct Flattener {
    separator: char,
    strip_prefix: String,
}

impl Default for Flattener {
    fn default() -> Self {
        Self {
            separator: '.',
            strip_prefix: String::new(),
        }
    }
}

impl Flattener {
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            ..Self::default()
        }
    }

    /// Strip this prefix from column names after flattening
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = prefix.into();
        self
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// Flatten one record
    ///
    /// Fails only for undecodable input: bytes that are not JSON, or a JSON
    /// document whose root is not an object. Callers treat that as a skip.
    pub fn flatten(&self, record: &RawRecord) -> Result<FlatRow> {
        let row: FlatRow = match &record.payload {
            RawPayload::Document(bytes) => {
                let value: Value = serde_json::from_slice(bytes)?;
                match value {
                    Value::Object(object) => flatten_object(&object, self.separator),
                    other => {
                        return Err(IngestError::Decode(format!(
                            "expected a JSON object, found {}",
                            json_kind(&other)
                        )))
                    },
                }
            },
            RawPayload::Delimited { names, values } => names
                .iter()
                .zip(values)
                .map(|(name, value)| (name.clone(), Scalar::from_field(value)))
                .collect(),
            RawPayload::Feature {
                geometry,
                properties,
            } => {
                let mut row: FlatRow = properties.iter().cloned().collect();
                row.insert(GEOMETRY_COLUMN, Scalar::from(geometry.clone()));
                row
            },
        };

        Ok(strip_column_prefix(row, &self.strip_prefix))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
