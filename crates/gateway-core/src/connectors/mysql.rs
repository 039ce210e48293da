//! MySQL connector

use super::{Driver, DriverConnection, DriverQueryOutput};
use crate::classify::{classify_connect_error, classify_execute_error};
use async_trait::async_trait;
use serde_json::Value;
use shared::models::{ConnectionParams, DatabaseEndpoint, SchemaSnapshot, TableSchema};
use shared::{GatewayError, Result};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, MySqlConnection, Row, TypeInfo};
use std::time::Duration;

/// Built-in MySQL driver
pub struct MysqlDriver;

#[async_trait]
impl Driver for MysqlDriver {
    fn kind_name(&self) -> &str {
        "mysql"
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        let mut options = MySqlConnectOptions::new()
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

        Ok(Box::new(MysqlConnection { conn }))
    }
}

struct MysqlConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl DriverConnection for MysqlConnection {
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
             WHERE table_schema NOT IN \
               ('mysql', 'sys', 'performance_schema', 'information_schema') \
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
        // MySQL's notion of a schema is the current database
        let row = sqlx::query("SELECT DATABASE()")
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

fn bind_value<'q>(
    query: Query<'q, sqlx::MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, sqlx::MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

fn decode_row(row: &MySqlRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| decode_column(row, i, column.type_info().name()))
        .collect()
}

fn decode_column(row: &MySqlRow, i: usize, type_name: &str) -> Value {
    match type_name {
        "BOOLEAN" | "TINYINT(1)" => opt_json(row.try_get::<Option<bool>, _>(i)),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            opt_json(row.try_get::<Option<i64>, _>(i))
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row
            .try_get::<Option<u64>, _>(i)
            .map(|v| match v {
                Some(n) => Value::from(n),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "FLOAT" => opt_json(row.try_get::<Option<f32>, _>(i)),
        "DOUBLE" => opt_json(row.try_get::<Option<f64>, _>(i)),
        "DECIMAL" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(i)
            .map(|v| match v {
                Some(d) => Value::String(d.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "DATETIME" | "TIMESTAMP" => row
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
        "JSON" => opt_json(row.try_get::<Option<Value>, _>(i)),
        _ => opt_json(row.try_get::<Option<String>, _>(i)),
    }
}

fn opt_json<T: Into<Value>>(result: std::result::Result<Option<T>, sqlx::Error>) -> Value {
    match result {
        Ok(Some(v)) => v.into(),
        _ => Value::Null,
    }
}
