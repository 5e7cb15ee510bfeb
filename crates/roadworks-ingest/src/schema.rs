//! Schema validation over a sample of flattened rows
//!
//! A [`SchemaContract`] declares the fields a feed is expected to carry. The
//! pipeline checks a bounded prefix of the stream against it before loading
//! anything and aborts the run when the report is not empty.

use std::fmt;

use indexmap::IndexMap;

use crate::record::{FlatRow, Scalar};

/// Whether a field must be present and whether it may be null
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optionality {
    /// Present with a non-null value
    Required,
    /// Present, value may be null
    Nullable,
    /// May be absent or null
    Optional,
}

/// Semantic type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Integer, or text that parses as one
    Integer,
    Text,
    Any,
}

impl FieldType {
    fn accepts(self, value: &Scalar) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::Integer => value.as_integer().is_some(),
            FieldType::Text => matches!(value, Scalar::Text(_)),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Integer => write!(f, "integer"),
            FieldType::Text => write!(f, "text"),
            FieldType::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub optionality: Optionality,
    pub field_type: FieldType,
}

/// Expected fields of a feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaContract {
    fields: IndexMap<String, FieldSpec>,
    deny_unknown_fields: bool,
}

impl SchemaContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        optionality: Optionality,
        field_type: FieldType,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                optionality,
                field_type,
            },
        );
        self
    }

    /// Report fields the contract does not declare
    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown_fields = true;
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check one row, returning every violation found
    pub fn check(&self, row: &FlatRow) -> Vec<Violation> {
        let mut violations = Vec::new();

        for (name, spec) in &self.fields {
            match row.get(name) {
                None if spec.optionality == Optionality::Optional => {},
                None => violations.push(Violation::Missing {
                    field: name.clone(),
                }),
                Some(Scalar::Null) if spec.optionality == Optionality::Required => {
                    violations.push(Violation::Null {
                        field: name.clone(),
                    })
                },
                Some(Scalar::Null) => {},
                Some(value) if !spec.field_type.accepts(value) => {
                    violations.push(Violation::WrongType {
                        field: name.clone(),
                        expected: spec.field_type,
                        found: value.kind(),
                    })
                },
                Some(_) => {},
            }
        }

        if self.deny_unknown_fields {
            violations.extend(
                row.columns()
                    .filter(|c| !self.fields.contains_key(*c))
                    .map(|c| Violation::Unexpected {
                        field: c.to_string(),
                    }),
            );
        }

        violations
    }
}

/// A single contract breach within one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing {
        field: String,
    },
    Null {
        field: String,
    },
    WrongType {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
    Unexpected {
        field: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing { field } => write!(f, "missing field '{}'", field),
            Violation::Null { field } => write!(f, "field '{}' is null", field),
            Violation::WrongType {
                field,
                expected,
                found,
            } => write!(f, "field '{}' expected {}, found {}", field, expected, found),
            Violation::Unexpected { field } => write!(f, "unexpected field '{}'", field),
        }
    }
}

/// Violations of one sampled row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowViolations {
    /// Position of the row within the sample
    pub index: usize,
    pub violations: Vec<Violation>,
}

/// Outcome of validating a sample; empty means the contract holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub rows_checked: usize,
    pub failures: Vec<RowViolations>,
}

impl SchemaReport {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failing rows
    pub fn len(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for SchemaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} sampled rows violate the contract",
            self.failures.len(),
            self.rows_checked
        )?;

        if let Some(first) = self.failures.first() {
            let details: Vec<String> = first.violations.iter().map(ToString::to_string).collect();
            write!(f, "; row {}: {}", first.index, details.join(", "))?;
        }

        Ok(())
    }
}

/// Validate a sample of rows against a contract
///
/// The report carries one entry per failing row, identified by its index in
/// `sample`. Rows are not modified.
pub fn validate(sample: &[FlatRow], contract: &SchemaContract) -> SchemaReport {
    let failures = sample
        .iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let violations = contract.check(row);
            (!violations.is_empty()).then_some(RowViolations { index, violations })
        })
        .collect();

    SchemaReport {
        rows_checked: sample.len(),
        failures,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn contract() -> SchemaContract {
        SchemaContract::new()
            .field("event_reference", Optionality::Required, FieldType::Integer)
            .field("event_type", Optionality::Nullable, FieldType::Text)
            .field("town", Optionality::Optional, FieldType::Text)
    }

    fn row(reference: Scalar, event_type: Scalar) -> FlatRow {
        [("event_reference", reference), ("event_type", event_type)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_valid_sample_gives_empty_report() {
        let sample = vec![
            row(Scalar::Integer(1), Scalar::Text("WORK_START".into())),
            row(Scalar::Text("2".into()), Scalar::Null),
        ];

        let report = validate(&sample, &contract());
        assert!(report.is_empty());
        assert_eq!(report.rows_checked, 2);
    }

    #[test]
    fn test_missing_required_field_reports_row_index() {
        let mut broken = FlatRow::new();
        broken.insert("event_type", "WORK_STOP");

        let sample = vec![
            row(Scalar::Integer(1), Scalar::Null),
            broken,
            row(Scalar::Integer(3), Scalar::Null),
        ];

        let report = validate(&sample, &contract());
        assert_eq!(report.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(
            report.failures[0].violations,
            vec![Violation::Missing {
                field: "event_reference".into()
            }]
        );
    }

    #[test]
    fn test_type_and_null_violations() {
        let sample = vec![
            row(Scalar::Text("abc".into()), Scalar::Integer(5)),
            row(Scalar::Null, Scalar::Null),
        ];

        let report = validate(&sample, &contract());
        assert_eq!(report.len(), 2);
        assert_eq!(report.failures[0].violations.len(), 2);
        assert!(matches!(
            report.failures[1].violations[0],
            Violation::Null { .. }
        ));
    }

    #[test]
    fn test_unknown_fields_only_reported_when_denied() {
        let mut extra = row(Scalar::Integer(1), Scalar::Null);
        extra.insert("surprise", "x");

        assert!(validate(std::slice::from_ref(&extra), &contract()).is_empty());

        let strict = contract().deny_unknown_fields();
        let report = validate(&[extra], &strict);
        assert_eq!(
            report.failures[0].violations,
            vec![Violation::Unexpected {
                field: "surprise".into()
            }]
        );
    }

    #[test]
    fn test_report_display_mentions_first_failure() {
        let report = validate(&[FlatRow::new()], &contract());
        let text = report.to_string();
        assert!(text.starts_with("1 of 1 sampled rows"));
        assert!(text.contains("row 0: missing field 'event_reference'"));
    }
}
