//! Natural-language to SQL conversion
//!
//! Builds a schema-scoped prompt, dispatches it through the provider
//! manager, and validates the generated text with the SQL inspector.
//! The schema snapshot handed in must already be filtered to the
//! agent's readable resources; nothing else may reach the prompt.
//!
//! A generation that fails to parse gets exactly one repair pass with
//! the parser error appended; a second failure surfaces `generation`
//! with the raw output truncated and rephrasing hints.

use crate::classify::classify_provider_error;
use crate::inspector::{SqlInspection, SqlInspector};
use once_cell::sync::Lazy;
use provider_manager::{CompletionOptions, ProviderManager, SwitchRecord, TokenUsage};
use regex::Regex;
use shared::models::{DriverKind, SchemaSnapshot};
use shared::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Longest accepted natural-language question, in characters
const MAX_NL_LENGTH: usize = 2000;

/// Raw provider output is truncated to this length in error reports
const RAW_OUTPUT_LIMIT: usize = 300;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

/// A validated generation
#[derive(Debug)]
pub struct GeneratedSql {
    pub sql: String,
    pub inspection: SqlInspection,
    /// Crude lexical-overlap confidence in 0..=1
    pub confidence: f64,
    pub provider_id: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Provider failovers performed during generation, for auditing
    pub failovers: Vec<SwitchRecord>,
}

/// The converter
pub struct NlSqlConverter {
    providers: Arc<ProviderManager>,
}

impl NlSqlConverter {
    pub fn new(providers: Arc<ProviderManager>) -> Self {
        Self { providers }
    }

    /// Convert a question into validated SQL for an agent
    pub async fn convert(
        &self,
        agent_id: &str,
        question: &str,
        snapshot: &SchemaSnapshot,
        driver: &DriverKind,
        default_schema: Option<&str>,
        deadline: Duration,
    ) -> Result<GeneratedSql> {
        let question = question.trim();
        if question.is_empty() {
            return Err(GatewayError::Parse {
                detail: "question is empty".to_string(),
                generated_sql: None,
            });
        }
        if question.len() > MAX_NL_LENGTH {
            return Err(GatewayError::Parse {
                detail: format!(
                    "question is {} characters, the limit is {}",
                    question.len(),
                    MAX_NL_LENGTH
                ),
                generated_sql: None,
            });
        }

        let system = system_prompt(snapshot, driver);
        let options = CompletionOptions {
            max_tokens: 512,
            temperature: 0.0,
            system: Some(system.clone()),
        };

        let first = self
            .providers
            .complete(agent_id, question, &options, deadline)
            .await
            .map_err(classify_provider_error)?;

        let mut failovers = first.failovers;
        let mut usage = first.completion.usage;
        let mut cost_usd = first.cost_usd;
        let provider_id = first.provider_id;
        let model = first.model;

        let raw = first.completion.text;
        let candidate = extract_sql(&raw);

        let parse_error = match SqlInspector::inspect(&candidate, driver, default_schema) {
            Ok(inspection) => {
                return Ok(GeneratedSql {
                    confidence: confidence(question, &candidate),
                    sql: candidate,
                    inspection,
                    provider_id,
                    model,
                    usage,
                    cost_usd,
                    failovers,
                });
            }
            Err(e) => e,
        };

        // One repair pass: hand the parser error back to the model
        tracing::debug!(
            agent_id = agent_id,
            error = %parse_error,
            "Generated SQL did not parse, attempting repair pass"
        );
        metrics::counter!("nl2sql_repair_passes_total").increment(1);

        let repair_prompt = format!(
            "{}\n\nThe previous answer was:\n{}\n\nIt failed to parse: {}.\n\
             Answer again with one corrected SQL statement.",
            question,
            candidate,
            parse_error
        );

        let second = self
            .providers
            .complete(agent_id, &repair_prompt, &options, deadline)
            .await
            .map_err(classify_provider_error)?;

        failovers.extend(second.failovers);
        usage.prompt_tokens += second.completion.usage.prompt_tokens;
        usage.completion_tokens += second.completion.usage.completion_tokens;
        cost_usd += second.cost_usd;

        let repaired_raw = second.completion.text;
        let repaired = extract_sql(&repaired_raw);

        match SqlInspector::inspect(&repaired, driver, default_schema) {
            Ok(inspection) => Ok(GeneratedSql {
                confidence: confidence(question, &repaired),
                sql: repaired,
                inspection,
                provider_id: second.provider_id,
                model: second.model,
                usage,
                cost_usd,
                failovers,
            }),
            Err(e) => {
                metrics::counter!("nl2sql_generation_failures_total").increment(1);
                Err(GatewayError::Generation {
                    detail: format!("generated SQL did not parse after repair: {}", e),
                    raw_output: truncate(&repaired_raw, RAW_OUTPUT_LIMIT),
                    rephrasings: rephrasings(question, snapshot),
                })
            }
        }
    }
}

fn system_prompt(snapshot: &SchemaSnapshot, driver: &DriverKind) -> String {
    let mut schema_block = String::new();
    for table in &snapshot.tables {
        schema_block.push_str(&format!("TABLE {} (", table.name));
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|(name, data_type)| format!("{} {}", name, data_type))
            .collect();
        schema_block.push_str(&columns.join(", "));
        schema_block.push_str(")\n");
    }

    format!(
        "You translate questions into SQL for a {} database.\n\
         Answer with exactly one SQL statement and nothing else.\n\
         Only use the tables and columns listed below.\n\n{}",
        driver, schema_block
    )
}

/// Pull the statement out of a model answer
///
/// Strips markdown fences and surrounding prose; the first fenced block
/// wins, otherwise the whole trimmed text is the candidate.
fn extract_sql(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some(open) = trimmed.find("```") {
        let after = &trimmed[open + 3..];
        // Skip a language tag like "sql"
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let end = body.find("```").unwrap_or(body.len());
        return body[..end].trim().to_string();
    }

    trimmed.trim_end_matches(';').trim().to_string()
}

/// Fraction of question words echoed in the generated statement
///
/// Stop-short words are ignored; this is a rough signal for audit
/// records, not a calibrated probability.
fn confidence(question: &str, sql: &str) -> f64 {
    let sql_lower = sql.to_ascii_lowercase();
    let words: Vec<String> = WORD
        .find_iter(&question.to_ascii_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() >= 4)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| sql_lower.contains(w.as_str())).count();
    hits as f64 / words.len() as f64
}

/// Rephrasing hints from lexical overlap with schema names
fn rephrasings(question: &str, snapshot: &SchemaSnapshot) -> Vec<String> {
    let question_words: Vec<String> = WORD
        .find_iter(&question.to_ascii_lowercase())
        .map(|m| m.as_str().to_string())
        .collect();

    let mut hints = Vec::new();
    for table in &snapshot.tables {
        let bare = table.name.rsplit('.').next().unwrap_or(&table.name);
        let overlaps = question_words.iter().any(|w| {
            bare.to_ascii_lowercase().contains(w.as_str()) && w.len() >= 4
        });
        if overlaps {
            hints.push(format!("how many rows are in {}", table.name));
        }
        if hints.len() >= 3 {
            break;
        }
    }

    if hints.is_empty() {
        if let Some(table) = snapshot.tables.first() {
            hints.push(format!("how many rows are in {}", table.name));
        }
    }
    hints
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(limit).collect();
        out.push('…');
        out
    }
}
