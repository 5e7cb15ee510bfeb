//! DuckDB / MotherDuck implementation of [`Warehouse`]

use std::collections::HashMap;

use ::duckdb::types::Value;
use ::duckdb::{appender_params_from_iter, params, Connection};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{quote_identifier, ColumnType, DestinationTable, TableDefinition, Warehouse};
use crate::batch::ColumnarBatch;
use crate::config::WarehouseConfig;
use crate::error::{IngestError, Result};
use crate::record::Scalar;

/// Single DuckDB connection held for the duration of a run
///
/// The connection closes when the warehouse is dropped, whatever path the run
/// took. [`DuckDbWarehouse::close`] does the same but reports close errors.
pub struct DuckDbWarehouse {
    conn: Connection,
    layouts: HashMap<DestinationTable, Vec<(String, ColumnType)>>,
}

impl DuckDbWarehouse {
    /// Open the configured database; failures are not retried
    pub fn connect(config: &WarehouseConfig) -> Result<Self> {
        let conn = match config.connection_string() {
            Some(target) => Connection::open(target)?,
            None => Connection::open_in_memory()?,
        };

        info!(warehouse = %config.target, "Connected to warehouse");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            layouts: HashMap::new(),
        }
    }

    /// Underlying connection, for ad-hoc queries
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of rows currently in a table
    pub fn row_count(&self, table: &DestinationTable) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.qualified());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| IngestError::DuckDb(err))?;
        debug!("Warehouse connection closed");
        Ok(())
    }

    /// Declared column layout, looked up once per table
    fn layout(&mut self, table: &DestinationTable) -> Result<Vec<(String, ColumnType)>> {
        if let Some(layout) = self.layouts.get(table) {
            return Ok(layout.clone());
        }

        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )?;
        let layout = stmt
            .query_map(params![table.schema, table.name], |row| {
                let name: String = row.get(0)?;
                let data_type: String = row.get(1)?;
                Ok((name, ColumnType::from_sql(&data_type)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if layout.is_empty() {
            return Err(IngestError::Destination(format!(
                "Table {} does not exist",
                table
            )));
        }

        self.layouts.insert(table.clone(), layout.clone());
        Ok(layout)
    }
}

impl std::fmt::Debug for DuckDbWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbWarehouse")
            .field("tables", &self.layouts.len())
            .finish_non_exhaustive()
    }
}

/// For each destination column, the batch column feeding it
///
/// Names match case-insensitively. A batch column with no destination column,
/// or two batch columns feeding the same one, is an error.
fn project(
    layout: &[(String, ColumnType)],
    batch: &ColumnarBatch,
    table: &DestinationTable,
) -> Result<Vec<Option<usize>>> {
    let mut positions = vec![None; layout.len()];

    for (index, name) in batch.column_names().iter().enumerate() {
        let target = layout
            .iter()
            .position(|(column, _)| column.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                IngestError::Destination(format!(
                    "Column '{}' does not exist in {}",
                    name, table
                ))
            })?;

        if positions[target].replace(index).is_some() {
            return Err(IngestError::Destination(format!(
                "Column '{}' is supplied twice for {}",
                layout[target].0, table
            )));
        }
    }

    Ok(positions)
}

/// Convert a cell for a column of the given type
fn to_value(cell: &Scalar, column: &str, column_type: &ColumnType) -> Result<Value> {
    Ok(match (cell, column_type) {
        (Scalar::Null, _) => Value::Null,
        (Scalar::Integer(i), ColumnType::Varchar) => Value::Text(i.to_string()),
        (Scalar::Integer(i), _) => Value::BigInt(*i),
        (Scalar::Text(s), ColumnType::BigInt) if s.trim().is_empty() => Value::Null,
        (Scalar::Text(s), ColumnType::BigInt) => {
            Value::BigInt(s.trim().parse().map_err(|_| {
                IngestError::Destination(format!(
                    "Value '{}' for column '{}' is not an integer",
                    s, column
                ))
            })?)
        },
        (Scalar::Text(s), _) => Value::Text(s.clone()),
    })
}

#[async_trait]
impl Warehouse for DuckDbWarehouse {
    async fn ensure_schema(&mut self, schema: &str) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(schema)
        ))?;
        debug!(schema = %schema, "Schema ready");
        Ok(())
    }

    async fn create_or_replace_table(
        &mut self,
        table: &DestinationTable,
        definition: &TableDefinition,
    ) -> Result<()> {
        if definition.is_empty() {
            return Err(IngestError::Config(format!(
                "Table {} has no columns declared",
                table
            )));
        }

        self.conn
            .execute_batch(&definition.create_or_replace_sql(table))?;
        self.layouts
            .insert(table.clone(), definition.columns().to_vec());

        info!(table = %table, columns = definition.columns().len(), "Table created or replaced");
        Ok(())
    }

    async fn insert_batch(&mut self, table: &DestinationTable, batch: &ColumnarBatch) -> Result<u64> {
        let layout = self.layout(table)?;
        let positions = project(&layout, batch, table)?;

        let tx = self.conn.transaction()?;
        {
            let mut appender = tx.appender_to_db(&table.name, &table.schema)?;

            for row in 0..batch.num_rows() {
                let mut values = Vec::with_capacity(layout.len());
                for ((column, column_type), position) in layout.iter().zip(&positions) {
                    let value = match position.and_then(|i| batch.column_at(i)) {
                        Some(cells) => to_value(&cells[row], column, column_type)?,
                        None => Value::Null,
                    };
                    values.push(value);
                }
                appender.append_row(appender_params_from_iter(values))?;
            }

            appender.flush()?;
        }
        tx.commit()?;

        debug!(table = %table, rows = batch.num_rows(), "Batch appended");
        Ok(batch.num_rows() as u64)
    }
}
