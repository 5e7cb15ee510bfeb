//! Destination gateway
//!
//! The [`Warehouse`] trait is the seam between the sink and the analytical
//! store. [`DuckDbWarehouse`] implements it for MotherDuck and local DuckDB
//! files.

pub mod duckdb;

use std::fmt;

use async_trait::async_trait;

use crate::batch::ColumnarBatch;
use crate::error::Result;

pub use self::duckdb::DuckDbWarehouse;

/// Schema and table name of a load target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationTable {
    pub schema: String,
    pub name: String,
}

impl DestinationTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"schema"."name"`, safe to splice into SQL
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(&self.name))
    }
}

impl fmt::Display for DestinationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Declared column type; every column is nullable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    BigInt,
    Other(String),
}

impl ColumnType {
    pub fn sql(&self) -> &str {
        match self {
            ColumnType::Varchar => "VARCHAR",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Other(name) => name,
        }
    }

    /// Parse a type name as reported by `information_schema.columns`
    pub fn from_sql(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "VARCHAR" | "TEXT" | "STRING" => ColumnType::Varchar,
            "BIGINT" | "INT8" | "LONG" => ColumnType::BigInt,
            _ => ColumnType::Other(name.trim().to_string()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// Ordered column layout of a destination table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDefinition {
    columns: Vec<(String, ColumnType)>,
}

impl TableDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push((name.into(), column_type));
        self
    }

    /// Every named column as `VARCHAR`
    pub fn varchar<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: names
                .into_iter()
                .map(|n| (n.into(), ColumnType::Varchar))
                .collect(),
        }
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `CREATE OR REPLACE TABLE` statement for this layout
    pub fn create_or_replace_sql(&self, table: &DestinationTable) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_identifier(name), ty))
            .collect();

        format!(
            "CREATE OR REPLACE TABLE {} ({})",
            table.qualified(),
            columns.join(", ")
        )
    }
}

/// Double-quote an SQL identifier
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An analytical store the sink can load batches into
///
/// Implementations hold one connection for the whole run and are never used
/// concurrently.
#[async_trait]
pub trait Warehouse: Send {
    /// Create the schema if it does not exist yet
    async fn ensure_schema(&mut self, schema: &str) -> Result<()>;

    /// Create the table, replacing any previous table of that name
    async fn create_or_replace_table(
        &mut self,
        table: &DestinationTable,
        definition: &TableDefinition,
    ) -> Result<()>;

    /// Append one batch atomically, returning the number of rows written
    async fn insert_batch(&mut self, table: &DestinationTable, batch: &ColumnarBatch)
        -> Result<u64>;

    /// Schema then table, run once at the start of a load
    async fn provision(
        &mut self,
        table: &DestinationTable,
        definition: &TableDefinition,
    ) -> Result<()> {
        self.ensure_schema(&table.schema).await?;
        self.create_or_replace_table(table, definition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name_is_quoted() {
        let table = DestinationTable::new("raw_data_2025", "03_2025");
        assert_eq!(table.qualified(), r#""raw_data_2025"."03_2025""#);
        assert_eq!(table.to_string(), "raw_data_2025.03_2025");
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_create_or_replace_sql() {
        let definition = TableDefinition::new()
            .column("usrn", ColumnType::BigInt)
            .column("street_type", ColumnType::Varchar);
        let sql = definition.create_or_replace_sql(&DestinationTable::new("s", "t"));

        assert_eq!(
            sql,
            r#"CREATE OR REPLACE TABLE "s"."t" ("usrn" BIGINT, "street_type" VARCHAR)"#
        );
    }

    #[test]
    fn test_column_type_from_sql() {
        assert_eq!(ColumnType::from_sql("varchar"), ColumnType::Varchar);
        assert_eq!(ColumnType::from_sql("BIGINT"), ColumnType::BigInt);
        assert_eq!(ColumnType::from_sql("DATE"), ColumnType::Other("DATE".into()));
    }
}
