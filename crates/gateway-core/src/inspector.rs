//! SQL inspection
//!
//! Parses statement text for a driver dialect, classifies the statement
//! kind, and extracts every referenced table as a fully-qualified name.
//! Unqualified names are resolved against the agent's default schema so
//! permission checks always see the same identifier space.
//!
//! Document stores do not speak SQL; their structured query payloads go
//! through [`SqlInspector::inspect_document`] instead.

use shared::models::{DriverKind, StatementKind};
use shared::{GatewayError, Result};
use sqlparser::ast::{visit_relations, ObjectName, Statement};
use sqlparser::dialect::{
    BigQueryDialect, Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SnowflakeDialect,
};
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

/// What the inspector found in one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlInspection {
    pub statement_kind: StatementKind,
    /// Ordered unique fully-qualified table names
    pub tables: Vec<String>,
    /// Whether any reference lacked a schema before resolution
    pub has_unqualified_references: bool,
}

/// Stateless statement inspector
pub struct SqlInspector;

impl SqlInspector {
    /// Inspect SQL text for a driver
    ///
    /// `default_schema` qualifies bare table names; when `None`, bare
    /// names pass through unqualified (and the flag is still set).
    pub fn inspect(
        sql: &str,
        driver: &DriverKind,
        default_schema: Option<&str>,
    ) -> Result<SqlInspection> {
        if sql.trim().is_empty() {
            return Err(parse_error("statement is empty", sql));
        }

        let dialect = dialect_for(driver);
        let statements = Parser::parse_sql(dialect.as_ref(), sql)
            .map_err(|e| parse_error(&e.to_string(), sql))?;

        let statement = match statements.as_slice() {
            [] => return Err(parse_error("statement is empty", sql)),
            [single] => single,
            _ => {
                return Err(parse_error(
                    "multiple statements are not accepted; submit one statement per call",
                    sql,
                ))
            }
        };

        let statement_kind = classify(statement);
        if statement_kind == StatementKind::Other {
            return Err(parse_error(
                "statement kind is not supported by the gateway",
                sql,
            ));
        }

        let cte_names = cte_aliases(statement);

        let mut tables: Vec<String> = Vec::new();
        let mut has_unqualified = false;
        let _ = visit_relations(statement, |relation: &ObjectName| {
            let segments = name_segments(relation);
            // References to CTE aliases are not tables
            if segments.len() == 1 && cte_names.contains(&segments[0]) {
                return ControlFlow::<()>::Continue(());
            }

            let qualified = match segments.len() {
                1 => {
                    has_unqualified = true;
                    match default_schema {
                        Some(schema) => format!("{}.{}", schema, segments[0]),
                        None => segments[0].clone(),
                    }
                }
                _ => segments.join("."),
            };
            if !tables.contains(&qualified) {
                tables.push(qualified);
            }
            ControlFlow::Continue(())
        });

        Ok(SqlInspection {
            statement_kind,
            tables,
            has_unqualified_references: has_unqualified,
        })
    }

    /// Inspect a document-store query payload
    ///
    /// Expected shape: `{"collection": "...", "operation": "find" |
    /// "aggregate" | "insert" | "update" | "delete", "pipeline": [...]}`.
    /// `$lookup` stages contribute their joined collections.
    pub fn inspect_document(query: &serde_json::Value) -> Result<SqlInspection> {
        let collection = query
            .get("collection")
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                parse_error("document query is missing a 'collection' field", "")
            })?;

        let operation = query
            .get("operation")
            .and_then(|o| o.as_str())
            .unwrap_or("find");

        let statement_kind = match operation {
            "find" | "aggregate" | "count" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            other => {
                return Err(parse_error(
                    &format!("unsupported document operation '{}'", other),
                    "",
                ))
            }
        };

        let mut tables = vec![collection.to_string()];
        if let Some(stages) = query.get("pipeline").and_then(|p| p.as_array()) {
            for stage in stages {
                if let Some(from) = stage
                    .get("$lookup")
                    .and_then(|l| l.get("from"))
                    .and_then(|f| f.as_str())
                {
                    if !tables.iter().any(|t| t == from) {
                        tables.push(from.to_string());
                    }
                }
            }
        }

        Ok(SqlInspection {
            statement_kind,
            tables,
            has_unqualified_references: false,
        })
    }
}

fn dialect_for(driver: &DriverKind) -> Box<dyn Dialect> {
    match driver {
        DriverKind::Postgres => Box::new(PostgreSqlDialect {}),
        DriverKind::Mysql => Box::new(MySqlDialect {}),
        DriverKind::Bigquery => Box::new(BigQueryDialect {}),
        DriverKind::Snowflake => Box::new(SnowflakeDialect {}),
        DriverKind::Mongo | DriverKind::Plugin(_) => Box::new(GenericDialect {}),
    }
}

fn classify(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert(_) => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete(_) => StatementKind::Delete,
        Statement::CreateTable(_)
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}

/// Top-level CTE aliases, which must not be mistaken for tables
fn cte_aliases(statement: &Statement) -> Vec<String> {
    match statement {
        Statement::Query(query) => query
            .with
            .as_ref()
            .map(|with| {
                with.cte_tables
                    .iter()
                    .map(|cte| cte.alias.name.value.clone())
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Dotted segments of an object name with quoting stripped
fn name_segments(name: &ObjectName) -> Vec<String> {
    name.to_string()
        .split('.')
        .map(strip_quotes)
        .filter(|s| !s.is_empty())
        .collect()
}

fn strip_quotes(segment: &str) -> String {
    segment
        .trim()
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}

fn parse_error(detail: &str, sql: &str) -> GatewayError {
    let fragment: String = sql.chars().take(120).collect();
    let detail = if fragment.is_empty() {
        detail.to_string()
    } else {
        format!("{} (in: {})", detail, fragment.trim())
    };
    GatewayError::Parse {
        detail,
        generated_sql: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_pg(sql: &str) -> Result<SqlInspection> {
        SqlInspector::inspect(sql, &DriverKind::Postgres, Some("public"))
    }

    #[test]
    fn test_select_classification_and_tables() {
        let result = inspect_pg("SELECT * FROM public.sales").unwrap();
        assert_eq!(result.statement_kind, StatementKind::Select);
        assert_eq!(result.tables, vec!["public.sales"]);
        assert!(!result.has_unqualified_references);
    }

    #[test]
    fn test_join_extracts_every_table_in_order() {
        let result = inspect_pg(
            "SELECT * FROM public.sales JOIN public.customers USING (cid)",
        )
        .unwrap();
        assert_eq!(result.tables, vec!["public.sales", "public.customers"]);
    }

    #[test]
    fn test_unqualified_names_resolve_to_default_schema() {
        let result = inspect_pg("SELECT COUNT(*) FROM sales").unwrap();
        assert_eq!(result.tables, vec!["public.sales"]);
        assert!(result.has_unqualified_references);
    }

    #[test]
    fn test_unqualified_without_default_schema_passes_through() {
        let result = SqlInspector::inspect("SELECT 1 FROM sales", &DriverKind::Postgres, None)
            .unwrap();
        assert_eq!(result.tables, vec!["sales"]);
        assert!(result.has_unqualified_references);
    }

    #[test]
    fn test_write_statements_classified() {
        assert_eq!(
            inspect_pg("INSERT INTO public.sales (id) VALUES (1)")
                .unwrap()
                .statement_kind,
            StatementKind::Insert
        );
        assert_eq!(
            inspect_pg("UPDATE public.sales SET amount = 2 WHERE id = 1")
                .unwrap()
                .statement_kind,
            StatementKind::Update
        );
        assert_eq!(
            inspect_pg("DELETE FROM public.sales WHERE id = 1")
                .unwrap()
                .statement_kind,
            StatementKind::Delete
        );
    }

    #[test]
    fn test_ddl_classified() {
        assert_eq!(
            inspect_pg("CREATE TABLE public.t (id INT)")
                .unwrap()
                .statement_kind,
            StatementKind::Ddl
        );
        assert_eq!(
            inspect_pg("DROP TABLE public.t").unwrap().statement_kind,
            StatementKind::Ddl
        );
        assert_eq!(
            inspect_pg("TRUNCATE TABLE public.t")
                .unwrap()
                .statement_kind,
            StatementKind::Ddl
        );
    }

    #[test]
    fn test_empty_and_comment_only_rejected() {
        assert!(inspect_pg("").is_err());
        assert!(inspect_pg("   \n\t").is_err());
        assert!(inspect_pg("-- just a comment").is_err());
    }

    #[test]
    fn test_garbage_rejected_with_fragment() {
        let err = inspect_pg("SELEKT * FORM sales").unwrap_err();
        match err {
            GatewayError::Parse { detail, .. } => {
                assert!(detail.contains("SELEKT"), "detail was: {}", detail);
            }
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert!(inspect_pg("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_unsupported_statement_rejected() {
        // Session control is not a gateway operation
        assert!(inspect_pg("SET search_path TO analytics").is_err());
    }

    #[test]
    fn test_duplicate_references_deduplicated() {
        let result = inspect_pg(
            "SELECT a.id FROM public.sales a JOIN public.sales b ON a.id = b.id",
        )
        .unwrap();
        assert_eq!(result.tables, vec!["public.sales"]);
    }

    #[test]
    fn test_cte_alias_not_reported_as_table() {
        let result = inspect_pg(
            "WITH totals AS (SELECT cid, SUM(amount) s FROM public.sales GROUP BY cid) \
             SELECT * FROM totals WHERE s > 100",
        )
        .unwrap();
        assert_eq!(result.tables, vec!["public.sales"]);
    }

    #[test]
    fn test_quoted_identifiers_stripped() {
        let result = inspect_pg(r#"SELECT * FROM "Public"."Sales""#).unwrap();
        assert_eq!(result.tables, vec!["Public.Sales"]);
    }

    #[test]
    fn test_subquery_tables_extracted() {
        let result = inspect_pg(
            "SELECT * FROM public.sales WHERE cid IN (SELECT cid FROM public.customers)",
        )
        .unwrap();
        assert_eq!(result.tables, vec!["public.sales", "public.customers"]);
    }

    #[test]
    fn test_mysql_backtick_identifiers() {
        let result =
            SqlInspector::inspect("SELECT * FROM `shop`.`orders`", &DriverKind::Mysql, None)
                .unwrap();
        assert_eq!(result.tables, vec!["shop.orders"]);
    }

    #[test]
    fn test_document_find_extracts_collection() {
        let query = serde_json::json!({
            "collection": "orders",
            "operation": "find",
            "filter": {"status": "open"}
        });
        let result = SqlInspector::inspect_document(&query).unwrap();
        assert_eq!(result.statement_kind, StatementKind::Select);
        assert_eq!(result.tables, vec!["orders"]);
    }

    #[test]
    fn test_document_lookup_contributes_collections() {
        let query = serde_json::json!({
            "collection": "orders",
            "operation": "aggregate",
            "pipeline": [
                {"$match": {"status": "open"}},
                {"$lookup": {"from": "customers", "localField": "cid",
                             "foreignField": "_id", "as": "customer"}}
            ]
        });
        let result = SqlInspector::inspect_document(&query).unwrap();
        assert_eq!(result.tables, vec!["orders", "customers"]);
    }

    #[test]
    fn test_document_write_operations() {
        let insert = serde_json::json!({"collection": "orders", "operation": "insert"});
        assert_eq!(
            SqlInspector::inspect_document(&insert)
                .unwrap()
                .statement_kind,
            StatementKind::Insert
        );

        let unknown = serde_json::json!({"collection": "orders", "operation": "mapReduce"});
        assert!(SqlInspector::inspect_document(&unknown).is_err());
    }

    #[test]
    fn test_document_missing_collection_rejected() {
        let query = serde_json::json!({"operation": "find"});
        assert!(SqlInspector::inspect_document(&query).is_err());
    }
}
