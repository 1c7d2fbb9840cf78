//! Bulk table import: replays every existing row of a table through the
//! callback registry as a synthetic `INSERT`, so the same handlers that
//! process live changes can seed or re-validate a downstream store.
//!
//! Unlike the journal follower, the importer never touches the dispatcher -
//! it calls `callbacks.execute` directly and synchronously, matching the
//! original tool's `InitialQuery.run_callback`. Each table's rows are its own
//! failure domain: one table's error is logged and skipped, the rest proceed.

use mygrate_callbacks::CallbackRegistry;
use mygrate_errors::ImporterError;
use mygrate_schema::ConnectionParams;
use mygrate_types::{ColumnMap, Event, TableId, Value};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row, Value as SqlValue};
use tracing::{error, info};

/// Imports every table in `tables`, or every table with a registered
/// callback if `tables` is empty, isolating failures per table.
pub async fn import_tables(
    conn_params: &ConnectionParams,
    tables: &[TableId],
    registry: &CallbackRegistry,
    stream: bool,
) {
    let targets: Vec<TableId> = if tables.is_empty() {
        registry.registered_tables().cloned().collect()
    } else {
        tables.to_vec()
    };

    for table in targets {
        if let Err(error) = process_table(conn_params, &table, stream, registry).await {
            error!(table = %table, error = format!("{error:#}"), "table import failed");
        }
    }
}

/// Streams (or fully buffers, if `stream` is false) every row of `table` and
/// replays it through the registry as an `INSERT`.
///
/// The table should be quiescent for the duration of this call; concurrent
/// writes may produce duplicate or missing rows downstream.
pub async fn process_table(
    conn_params: &ConnectionParams,
    table: &TableId,
    stream: bool,
    registry: &CallbackRegistry,
) -> anyhow::Result<()> {
    let (db, tbl) = table
        .split()
        .ok_or_else(|| ImporterError::MalformedTableId(table.to_string()))?;

    let mut conn = Conn::new(conn_params.opts_for_db(db))
        .await
        .map_err(|source| ImporterError::Connect {
            db: db.to_owned(),
            source,
        })?;

    // Per the import contract, the session charset is UTF-8 - explicit
    // rather than relying on whatever `mysql_async` negotiates by default.
    conn.query_drop("SET NAMES utf8mb4")
        .await
        .map_err(|source| ImporterError::Connect {
            db: db.to_owned(),
            source,
        })?;

    let sql = format!("SELECT * FROM `{tbl}`");
    info!(%table, stream, "starting table import");

    let mut rows_seen = 0usize;
    if stream {
        let mut result = conn.query_iter(sql).await.map_err(|source| ImporterError::Query {
            table: table.to_string(),
            source,
        })?;
        while let Some(row) = result.next().await.map_err(|source| ImporterError::Query {
            table: table.to_string(),
            source,
        })? {
            emit_row(table, row, registry)?;
            rows_seen += 1;
        }
    } else {
        let rows: Vec<Row> = conn.query(sql).await.map_err(|source| ImporterError::Query {
            table: table.to_string(),
            source,
        })?;
        for row in rows {
            emit_row(table, row, registry)?;
            rows_seen += 1;
        }
    }

    info!(%table, rows = rows_seen, "finished table import");
    Ok(())
}

fn emit_row(table: &TableId, row: Row, registry: &CallbackRegistry) -> anyhow::Result<()> {
    let set = row_to_columns(row);
    registry.execute(&Event::Insert {
        table: table.clone(),
        set,
    })?;
    Ok(())
}

fn row_to_columns(row: Row) -> ColumnMap {
    let columns = row.columns();
    let values = row.unwrap();
    columns
        .iter()
        .zip(values)
        .map(|(col, value)| (col.name_str().into_owned(), convert_value(value)))
        .collect()
}

fn convert_value(value: SqlValue) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
        SqlValue::Int(i) => Value::Int(i),
        SqlValue::UInt(u) => Value::Int(u as i64),
        SqlValue::Float(f) => Value::Float(f as f64),
        SqlValue::Double(d) => Value::Float(d),
        SqlValue::Date(year, month, day, hour, minute, second, micros) => Value::Text(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        SqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            Value::Text(format!(
                "{sign}{days}d{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_scalar_variants() {
        assert_eq!(convert_value(SqlValue::NULL), Value::Null);
        assert_eq!(convert_value(SqlValue::Int(-7)), Value::Int(-7));
        assert_eq!(convert_value(SqlValue::UInt(7)), Value::Int(7));
        assert_eq!(convert_value(SqlValue::Double(1.5)), Value::Float(1.5));
        assert_eq!(
            convert_value(SqlValue::Bytes(b"hello".to_vec())),
            Value::Text("hello".to_owned())
        );
    }
}
