//! Snowflake connector
//!
//! Uses the Snowflake SQL API v2. The binding's options carry the
//! `warehouse` and optional `role`; the endpoint host is the account
//! URL and the password field holds the bearer token.

use super::{Driver, DriverConnection, DriverQueryOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::error::sanitize_detail;
use shared::models::{ConnectionParams, DatabaseEndpoint, SchemaSnapshot, TableSchema};
use shared::{ExecuteSubkind, GatewayError, Result};
use std::time::Duration;

/// Built-in Snowflake driver
pub struct SnowflakeDriver {
    client: reqwest::Client,
}

impl SnowflakeDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SnowflakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SnowflakeDriver {
    fn kind_name(&self) -> &str {
        "snowflake"
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        let token = params.password.clone().ok_or_else(|| {
            GatewayError::config("snowflake binding requires a bearer token in the password field")
        })?;
        let base = if endpoint.host.starts_with("http") {
            endpoint.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.host)
        };

        Ok(Box::new(SnowflakeConnection {
            client: self.client.clone(),
            base,
            database: params.database.clone(),
            schema: "PUBLIC".to_string(),
            warehouse: params
                .options
                .get("warehouse")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            role: params
                .options
                .get("role")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            token,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    result_set_meta_data: Option<ResultSetMetaData>,
    data: Option<Vec<Vec<Option<String>>>>,
}

struct SnowflakeConnection {
    client: reqwest::Client,
    base: String,
    database: String,
    schema: String,
    warehouse: Option<String>,
    role: Option<String>,
    token: String,
}

impl SnowflakeConnection {
    async fn run_statement(&self, sql: &str, deadline: Duration) -> Result<StatementResponse> {
        let mut body = json!({
            "statement": sql,
            "timeout": deadline.as_secs().max(1),
            "database": self.database,
            "schema": self.schema,
        });
        if let Some(ref warehouse) = self.warehouse {
            body["warehouse"] = json!(warehouse);
        }
        if let Some(ref role) = self.role {
            body["role"] = json!(role);
        }

        let response = self
            .client
            .post(format!("{}/api/v2/statements", self.base))
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        deadline_ms: deadline.as_millis() as u64,
                    }
                } else if e.is_connect() {
                    GatewayError::Connect {
                        detail: sanitize_detail(&e.to_string()),
                    }
                } else {
                    GatewayError::Execute {
                        detail: sanitize_detail(&e.to_string()),
                        subkind: ExecuteSubkind::Other,
                        dead_letter_ref: None,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Execute {
                detail: sanitize_detail(&format!("snowflake {}: {}", status, message)),
                subkind: ExecuteSubkind::Statement,
                dead_letter_ref: None,
            });
        }

        response.json().await.map_err(|e| GatewayError::Execute {
            detail: sanitize_detail(&e.to_string()),
            subkind: ExecuteSubkind::Other,
            dead_letter_ref: None,
        })
    }
}

#[async_trait]
impl DriverConnection for SnowflakeConnection {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput> {
        let parsed = self.run_statement(sql, deadline).await?;

        let row_types = parsed
            .result_set_meta_data
            .map(|m| m.row_type)
            .unwrap_or_default();
        let columns: Vec<String> = row_types.iter().map(|r| r.name.clone()).collect();
        let rows: Vec<Vec<Value>> = parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(row_types.iter())
                    .map(|(cell, row_type)| coerce_cell(cell, &row_type.column_type))
                    .collect()
            })
            .collect();

        let rows_affected = rows.len() as u64;
        Ok(DriverQueryOutput {
            columns,
            rows,
            rows_affected,
        })
    }

    async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
        let sql = "SELECT table_schema, table_name, column_name, data_type \
                   FROM information_schema.columns \
                   WHERE table_schema <> 'INFORMATION_SCHEMA' \
                   ORDER BY table_schema, table_name, ordinal_position";
        let parsed = self.run_statement(sql, Duration::from_secs(30)).await?;

        let mut snapshot = SchemaSnapshot::default();
        for row in parsed.data.unwrap_or_default() {
            let text = |idx: usize| row.get(idx).cloned().flatten().unwrap_or_default();
            let qualified = format!("{}.{}", text(0), text(1));
            let column = (text(2), text(3));
            match snapshot.tables.iter_mut().find(|t| t.name == qualified) {
                Some(entry) => entry.columns.push(column),
                None => snapshot.tables.push(TableSchema {
                    name: qualified,
                    columns: vec![column],
                }),
            }
        }
        Ok(snapshot)
    }

    async fn default_schema(&mut self) -> Result<Option<String>> {
        Ok(Some(self.schema.clone()))
    }

    async fn ping(&mut self) -> bool {
        self.run_statement("SELECT 1", Duration::from_secs(5))
            .await
            .is_ok()
    }

    async fn close(self: Box<Self>) {}
}

/// Snowflake serializes result cells as strings; coerce by column type
fn coerce_cell(cell: Option<String>, column_type: &str) -> Value {
    let Some(text) = cell else {
        return Value::Null;
    };
    match column_type.to_ascii_uppercase().as_str() {
        "FIXED" | "INTEGER" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "REAL" | "FLOAT" | "DOUBLE" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "BOOLEAN" => match text.as_str() {
            "true" | "TRUE" | "1" => Value::Bool(true),
            "false" | "FALSE" | "0" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}
