//! In-memory batches of flat rows and their columnar form

use indexmap::IndexSet;

use crate::record::{FlatRow, Scalar};

/// Bounded collection of rows awaiting a commit
#[derive(Debug, Clone)]
pub struct Batch {
    rows: Vec<FlatRow>,
    limit: usize,
}

impl Batch {
    /// `limit` is clamped to at least one row
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            rows: Vec::with_capacity(limit.min(16_384)),
            limit,
        }
    }

    /// Append a row; returns `true` once the batch has reached its limit
    pub fn push(&mut self, row: FlatRow) -> bool {
        self.rows.push(row);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn rows(&self) -> &[FlatRow] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Convert to a uniform column table
    ///
    /// Columns listed in `column_order` come first, in that order, whether or
    /// not any row carries them. Every other column follows in the order it was
    /// first seen in the batch. Cells a row does not carry are `Scalar::Null`.
    pub fn to_columnar(&self, column_order: &[String]) -> ColumnarBatch {
        let mut names: IndexSet<&str> = column_order.iter().map(String::as_str).collect();
        for row in &self.rows {
            names.extend(row.columns());
        }

        let columns = names
            .iter()
            .map(|name| {
                self.rows
                    .iter()
                    .map(|row| row.get(name).cloned().unwrap_or(Scalar::Null))
                    .collect()
            })
            .collect();

        ColumnarBatch {
            names: names.into_iter().map(str::to_string).collect(),
            columns,
            num_rows: self.rows.len(),
        }
    }
}

/// Column-major table built from a [`Batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnarBatch {
    names: Vec<String>,
    columns: Vec<Vec<Scalar>>,
    num_rows: usize,
}

impl ColumnarBatch {
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.names.len()
    }

    pub fn column(&self, name: &str) -> Option<&[Scalar]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }

    pub fn column_at(&self, index: usize) -> Option<&[Scalar]> {
        self.columns.get(index).map(Vec::as_slice)
    }
}
