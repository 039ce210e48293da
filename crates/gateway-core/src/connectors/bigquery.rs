//! BigQuery connector
//!
//! Speaks the BigQuery REST jobs.query API. The binding's options carry
//! `project_id` and `dataset`; the password field holds the OAuth
//! bearer token minted by the surrounding deployment.

use super::{Driver, DriverConnection, DriverQueryOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::error::sanitize_detail;
use shared::models::{ConnectionParams, DatabaseEndpoint, SchemaSnapshot, TableSchema};
use shared::{ExecuteSubkind, GatewayError, Result};
use std::time::Duration;

const DEFAULT_BASE: &str = "https://bigquery.googleapis.com";

/// Built-in BigQuery driver
pub struct BigQueryDriver {
    client: reqwest::Client,
}

impl BigQueryDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for BigQueryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for BigQueryDriver {
    fn kind_name(&self) -> &str {
        "bigquery"
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        let project_id = params
            .options
            .get("project_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::config("bigquery binding requires options.project_id"))?
            .to_string();
        let dataset = params.database.clone();
        let token = params.password.clone().ok_or_else(|| {
            GatewayError::config("bigquery binding requires a bearer token in the password field")
        })?;

        let base = if endpoint.host.starts_with("http") {
            endpoint.host.trim_end_matches('/').to_string()
        } else if endpoint.host.is_empty() {
            DEFAULT_BASE.to_string()
        } else {
            format!("https://{}", endpoint.host)
        };

        Ok(Box::new(BigQueryConnection {
            client: self.client.clone(),
            base,
            project_id,
            dataset,
            token,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct QueryField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    v: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    schema: Option<QuerySchema>,
    rows: Option<Vec<QueryRow>>,
    #[serde(rename = "totalRows")]
    total_rows: Option<String>,
}

struct BigQueryConnection {
    client: reqwest::Client,
    base: String,
    project_id: String,
    dataset: String,
    token: String,
}

impl BigQueryConnection {
    async fn run_query(&self, sql: &str, deadline: Duration) -> Result<QueryResponse> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.base, self.project_id
        );
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": deadline.as_millis() as u64,
            "defaultDataset": {"projectId": self.project_id, "datasetId": self.dataset},
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Execute {
                detail: sanitize_detail(&format!("bigquery {}: {}", status, message)),
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
impl DriverConnection for BigQueryConnection {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput> {
        let parsed = self.run_query(sql, deadline).await?;

        let fields = parsed.schema.map(|s| s.fields).unwrap_or_default();
        let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        let rows = parsed
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.f
                    .into_iter()
                    .zip(fields.iter())
                    .map(|(cell, field)| coerce_cell(cell.v, &field.field_type))
                    .collect()
            })
            .collect::<Vec<_>>();

        let rows_affected = parsed
            .total_rows
            .and_then(|t| t.parse().ok())
            .unwrap_or(rows.len() as u64);

        Ok(DriverQueryOutput {
            columns,
            rows,
            rows_affected,
        })
    }

    async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
        let sql = format!(
            "SELECT table_name, column_name, data_type \
             FROM `{}.{}`.INFORMATION_SCHEMA.COLUMNS \
             ORDER BY table_name, ordinal_position",
            self.project_id, self.dataset
        );
        let parsed = self.run_query(&sql, Duration::from_secs(30)).await?;

        let mut snapshot = SchemaSnapshot::default();
        for row in parsed.rows.unwrap_or_default() {
            let text = |idx: usize| -> String {
                row.f
                    .get(idx)
                    .and_then(|c| c.v.as_ref())
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let qualified = format!("{}.{}", self.dataset, text(0));
            let column = (text(1), text(2));
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
        Ok(Some(self.dataset.clone()))
    }

    async fn ping(&mut self) -> bool {
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}",
            self.base, self.project_id, self.dataset
        );
        self.client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn close(self: Box<Self>) {}
}

/// BigQuery serializes every cell as a string; coerce by declared type
fn coerce_cell(value: Option<Value>, field_type: &str) -> Value {
    let Some(value) = value else {
        return Value::Null;
    };
    let Some(text) = value.as_str().map(|s| s.to_string()) else {
        return value;
    };

    match field_type {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "FLOAT" | "FLOAT64" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "BOOLEAN" | "BOOL" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

fn request_error(err: reqwest::Error, deadline: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            deadline_ms: deadline.as_millis() as u64,
        }
    } else if err.is_connect() {
        GatewayError::Connect {
            detail: sanitize_detail(&err.to_string()),
        }
    } else {
        GatewayError::Execute {
            detail: sanitize_detail(&err.to_string()),
            subkind: ExecuteSubkind::Other,
            dead_letter_ref: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_coercion_by_type() {
        assert_eq!(
            coerce_cell(Some(Value::String("42".into())), "INTEGER"),
            Value::from(42)
        );
        assert_eq!(
            coerce_cell(Some(Value::String("2.5".into())), "FLOAT64"),
            Value::from(2.5)
        );
        assert_eq!(
            coerce_cell(Some(Value::String("true".into())), "BOOLEAN"),
            Value::Bool(true)
        );
        assert_eq!(
            coerce_cell(Some(Value::String("hello".into())), "STRING"),
            Value::String("hello".into())
        );
        assert_eq!(coerce_cell(None, "INTEGER"), Value::Null);
    }

    #[test]
    fn test_query_response_parsing() {
        let raw = r#"{
            "schema": {"fields": [{"name": "count", "type": "INTEGER"}]},
            "rows": [{"f": [{"v": "17"}]}],
            "totalRows": "1"
        }"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.schema.unwrap().fields[0].name, "count");
        assert_eq!(parsed.rows.unwrap().len(), 1);
    }
}
