//! MongoDB connector
//!
//! Talks to the MongoDB Atlas Data API (JSON over HTTPS). The statement
//! text handed to [`DriverConnection::execute`] is the document query
//! payload itself: `{"collection": ..., "operation": ..., "filter":
//! ..., "pipeline": ...}` as produced by the intake stage. Result
//! documents are flattened into columns from the first document's keys.

use super::{Driver, DriverConnection, DriverQueryOutput};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use shared::error::sanitize_detail;
use shared::models::{ConnectionParams, DatabaseEndpoint, SchemaSnapshot, TableSchema};
use shared::{ExecuteSubkind, GatewayError, Result};
use std::time::Duration;

/// Built-in MongoDB (Atlas Data API) driver
pub struct MongoDriver {
    client: reqwest::Client,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn kind_name(&self) -> &str {
        "mongo"
    }

    async fn open(
        &self,
        params: &ConnectionParams,
        endpoint: &DatabaseEndpoint,
    ) -> Result<Box<dyn DriverConnection>> {
        let api_key = params.password.clone().ok_or_else(|| {
            GatewayError::config("mongo binding requires an API key in the password field")
        })?;
        let data_source = params
            .options
            .get("data_source")
            .and_then(|v| v.as_str())
            .unwrap_or("Cluster0")
            .to_string();
        let base = if endpoint.host.starts_with("http") {
            endpoint.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.host)
        };

        Ok(Box::new(MongoConnection {
            client: self.client.clone(),
            base,
            database: params.database.clone(),
            data_source,
            api_key,
        }))
    }
}

struct MongoConnection {
    client: reqwest::Client,
    base: String,
    database: String,
    data_source: String,
    api_key: String,
}

impl MongoConnection {
    async fn call(
        &self,
        action: &str,
        mut body: Map<String, Value>,
        deadline: Duration,
    ) -> Result<Value> {
        body.insert("dataSource".to_string(), json!(self.data_source));
        body.insert("database".to_string(), json!(self.database));

        let response = self
            .client
            .post(format!("{}/action/{}", self.base, action))
            .header("api-key", &self.api_key)
            .timeout(deadline)
            .json(&Value::Object(body))
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
                detail: sanitize_detail(&format!("mongo {}: {}", status, message)),
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
impl DriverConnection for MongoConnection {
    async fn execute(
        &mut self,
        statement: &str,
        _params: &[Value],
        deadline: Duration,
    ) -> Result<DriverQueryOutput> {
        let query: Value = serde_json::from_str(statement).map_err(|e| GatewayError::Execute {
            detail: sanitize_detail(&format!("invalid document query: {}", e)),
            subkind: ExecuteSubkind::Statement,
            dead_letter_ref: None,
        })?;

        let collection = query
            .get("collection")
            .and_then(|c| c.as_str())
            .ok_or_else(|| GatewayError::Execute {
                detail: "document query is missing 'collection'".to_string(),
                subkind: ExecuteSubkind::Statement,
                dead_letter_ref: None,
            })?;
        let operation = query
            .get("operation")
            .and_then(|o| o.as_str())
            .unwrap_or("find");

        let mut body = Map::new();
        body.insert("collection".to_string(), json!(collection));

        let result = match operation {
            "find" | "count" => {
                if let Some(filter) = query.get("filter") {
                    body.insert("filter".to_string(), filter.clone());
                }
                self.call("find", body, deadline).await?
            }
            "aggregate" => {
                body.insert(
                    "pipeline".to_string(),
                    query.get("pipeline").cloned().unwrap_or(json!([])),
                );
                self.call("aggregate", body, deadline).await?
            }
            "insert" => {
                body.insert(
                    "documents".to_string(),
                    query.get("documents").cloned().unwrap_or(json!([])),
                );
                self.call("insertMany", body, deadline).await?
            }
            "update" => {
                body.insert(
                    "filter".to_string(),
                    query.get("filter").cloned().unwrap_or(json!({})),
                );
                body.insert(
                    "update".to_string(),
                    query.get("update").cloned().unwrap_or(json!({})),
                );
                self.call("updateMany", body, deadline).await?
            }
            "delete" => {
                body.insert(
                    "filter".to_string(),
                    query.get("filter").cloned().unwrap_or(json!({})),
                );
                self.call("deleteMany", body, deadline).await?
            }
            other => {
                return Err(GatewayError::Execute {
                    detail: format!("unsupported document operation '{}'", other),
                    subkind: ExecuteSubkind::Statement,
                    dead_letter_ref: None,
                })
            }
        };

        Ok(documents_to_output(&result))
    }

    async fn list_resources(&mut self) -> Result<SchemaSnapshot> {
        // The Data API has no listCollections action; sample well-known
        // metadata instead. Collections an agent may use are expected to
        // be granted explicitly, so an empty snapshot is acceptable.
        Ok(SchemaSnapshot {
            tables: Vec::new(),
        })
    }

    async fn default_schema(&mut self) -> Result<Option<String>> {
        // Collections are flat within a database
        Ok(None)
    }

    async fn ping(&mut self) -> bool {
        let mut body = Map::new();
        body.insert("collection".to_string(), json!("__ping__"));
        body.insert("filter".to_string(), json!({}));
        body.insert("limit".to_string(), json!(1));
        self.call("find", body, Duration::from_secs(5)).await.is_ok()
    }

    async fn close(self: Box<Self>) {}
}

/// Flatten result documents into a columnar output
///
/// Read results carry `documents`; write acknowledgements carry counts,
/// which become a single-row summary.
fn documents_to_output(result: &Value) -> DriverQueryOutput {
    if let Some(documents) = result.get("documents").and_then(|d| d.as_array()) {
        let columns: Vec<String> = documents
            .first()
            .and_then(|d| d.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        let rows = documents
            .iter()
            .map(|doc| {
                columns
                    .iter()
                    .map(|col| doc.get(col).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect::<Vec<_>>();
        let rows_affected = rows.len() as u64;
        return DriverQueryOutput {
            columns,
            rows,
            rows_affected,
        };
    }

    // Write acknowledgement
    let mut columns = Vec::new();
    let mut row = Vec::new();
    for key in ["insertedIds", "matchedCount", "modifiedCount", "deletedCount"] {
        if let Some(value) = result.get(key) {
            columns.push(key.to_string());
            row.push(value.clone());
        }
    }
    let rows_affected = row
        .iter()
        .filter_map(|v| v.as_u64())
        .max()
        .unwrap_or(0);
    DriverQueryOutput {
        columns,
        rows: vec![row],
        rows_affected,
    }
}
