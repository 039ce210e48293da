//! PostgreSQL connector
//!
//! Wraps a single `sqlx` connection per handle; pooling happens a layer
//! up where heterogeneous driver connections share one slot accounting.

use super::{Driver, DriverConnection, DriverQueryOutput};
use crate::classify::{classify_connect_error, classify_execute_error};
use async_trait::async_trait;
use serde_json::Value;
use shared::models::{ConnectionParams, DatabaseEndpoint, SchemaSnapshot, TableSchema};
use shared::{GatewayError, Result};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, PgConnection, Row, TypeInfo};
use std::time::Duration;

/// Built-in PostgreSQL driver
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn kind_name(&self) -> &str {
        "postgres"
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        let mut options = PgConnectOptions::new()
            .host(&endpoint.host)
            .database(&params.database);
        if let Some(port) = endpoint.port {
            options = options.port(port);
        }
        if let Some(ref username) = params.username {
            options = options.username(username);
        }
        if let Some(ref password) = params.password {
            options = options.password(password);
        }

        let conn = options
            .connect()
            .await
            .map_err(|e| classify_connect_error(&e))?;

        Ok(Box::new(PostgresConnection { conn }))
    }
}

struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }

        let rows = match tokio::time::timeout(deadline, query.fetch_all(&mut self.conn)).await {
            Err(_) => {
                // The statement may still be running server-side; the
                // caller discards this connection.
                return Err(GatewayError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
            Ok(Err(e)) => return Err(classify_execute_error(e)),
            Ok(Ok(rows)) => rows,
        };

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let row_count = rows.len() as u64;
        let decoded = rows.iter().map(decode_row).collect();

        Ok(DriverQueryOutput {
            columns,
            rows: decoded,
            rows_affected: row_count,
        })
    }

    async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
        let rows = sqlx::query(
            "SELECT table_schema, table_name, column_name, data_type \
             FROM information_schema.columns \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name, ordinal_position",
        )
        .fetch_all(&mut self.conn)
        .await
        .map_err(classify_execute_error)?;

        let mut snapshot = SchemaSnapshot::default();
        for row in rows {
            let schema: String = row.try_get(0).unwrap_or_default();
            let table: String = row.try_get(1).unwrap_or_default();
            let column: String = row.try_get(2).unwrap_or_default();
            let data_type: String = row.try_get(3).unwrap_or_default();

            let qualified = format!("{}.{}", schema, table);
            match snapshot.tables.iter_mut().find(|t| t.name == qualified) {
                Some(entry) => entry.columns.push((column, data_type)),
                None => snapshot.tables.push(TableSchema {
                    name: qualified,
                    columns: vec![(column, data_type)],
                }),
            }
        }
        Ok(snapshot)
    }

    async fn default_schema(&mut self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT current_schema()")
            .fetch_one(&mut self.conn)
            .await
            .map_err(classify_execute_error)?;
        Ok(row.try_get::<Option<String>, _>(0).unwrap_or(None))
    }

    async fn ping(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    async fn close(self: Box<Self>) {
        let _ = self.conn.close().await;
    }
}

/// Bind one JSON parameter positionally
fn bind_value<'q>(
    query: Query<'q, sqlx::Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, sqlx::Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

/// Decode one row into JSON values, by declared column type
fn decode_row(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| decode_column(row, i, column.type_info().name()))
        .collect()
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => opt_json(row.try_get::<Option<bool>, _>(i)),
        "INT2" => opt_json(row.try_get::<Option<i16>, _>(i)),
        "INT4" => opt_json(row.try_get::<Option<i32>, _>(i)),
        "INT8" => opt_json(row.try_get::<Option<i64>, _>(i)),
        "FLOAT4" => opt_json(row.try_get::<Option<f32>, _>(i)),
        "FLOAT8" => opt_json(row.try_get::<Option<f64>, _>(i)),
        // Exact numerics come back as strings to preserve precision
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(i)
            .map(|v| match v {
                Some(d) => Value::String(d.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(i)
            .map(|v| match v {
                Some(u) => Value::String(u.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
            .map(|v| match v {
                Some(t) => Value::String(t.to_rfc3339()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(i)
            .map(|v| match v {
                Some(t) => Value::String(t.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(i)
            .map(|v| match v {
                Some(d) => Value::String(d.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => opt_json(row.try_get::<Option<Value>, _>(i)),
        _ => opt_json(row.try_get::<Option<String>, _>(i)),
    }
}

fn opt_json<T: Into<Value>>(result: std::result::Result<Option<T>, sqlx::Error>) -> Value {
    match result {
        Ok(Some(v)) => v.into(),
        _ => Value::Null,
    }
}
