//! Error taxonomy and the user-visible error envelope
//!
//! Every failure in the gateway collapses into one of the closed set of
//! [`ErrorKind`]s. Internally errors travel as [`GatewayError`]; the only
//! thing a caller ever sees is an [`ErrorReport`], which carries a
//! sanitized message, suggested fixes, and enough detail to diagnose
//! without exposing credentials or connection internals.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Closed set of error kinds surfaced by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or unknown API key
    Auth,
    /// API key known but the agent was revoked
    Revoked,
    /// SQL text could not be parsed or classified
    Parse,
    /// One or more referenced tables lack the required capability
    PermissionDenied,
    /// Referenced table is not present in the agent's binding
    SchemaUnknown,
    /// NL-to-SQL produced unparseable output
    Generation,
    /// Could not acquire a pooled connection in time
    PoolTimeout,
    /// Driver failed to connect
    Connect,
    /// Driver reported an execution failure
    Execute,
    /// Deadline exceeded
    Timeout,
    /// Caller cancelled the request
    Cancelled,
    /// Provider or agent rate limit exceeded
    RateLimited,
    /// Provider terminal error after retries and failover
    ProviderUnavailable,
    /// Air-gapped policy violation
    Blocked,
    /// Misconfiguration detected
    Config,
    /// Invariant violation
    Internal,
}

impl ErrorKind {
    /// Stable wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Revoked => "revoked",
            ErrorKind::Parse => "parse",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::SchemaUnknown => "schema_unknown",
            ErrorKind::Generation => "generation",
            ErrorKind::PoolTimeout => "pool_timeout",
            ErrorKind::Connect => "connect",
            ErrorKind::Execute => "execute",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gateway error types
///
/// Variants mirror the taxonomy one-to-one; data-bearing variants carry
/// what the classifier needs to build an [`ErrorReport`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or unknown API key
    #[error("authentication failed")]
    Auth,

    /// Key resolved to a revoked agent
    #[error("agent has been revoked")]
    Revoked,

    /// SQL could not be parsed
    #[error("failed to parse statement: {detail}")]
    Parse {
        /// Parser message or offending fragment
        detail: String,
        /// SQL produced by NL generation, if this was an NL call
        generated_sql: Option<String>,
    },

    /// One or more resources lack the required capability
    #[error("permission denied on {} resource(s)", denied.len())]
    PermissionDenied {
        /// Every denied resource, not just the first
        denied: Vec<String>,
        /// SQL produced by NL generation, if this was an NL call
        generated_sql: Option<String>,
    },

    /// Referenced table not present in the binding's schema
    #[error("unknown resource: {resource}")]
    SchemaUnknown {
        /// The unresolvable identifier
        resource: String,
        /// Known resources with similar names
        suggestions: Vec<String>,
    },

    /// NL-to-SQL output was unusable
    #[error("generation failed: {detail}")]
    Generation {
        /// What went wrong
        detail: String,
        /// Raw provider output, truncated
        raw_output: String,
        /// Rephrasings derived from schema-name overlap
        rephrasings: Vec<String>,
    },

    /// Pool saturated past the acquire timeout
    #[error("no connection available within {waited_ms}ms")]
    PoolTimeout {
        /// How long the caller waited
        waited_ms: u64,
        /// Hint for when a slot is likely to free up
        retry_after_ms: u64,
    },

    /// Driver connection failure (all endpoints exhausted)
    #[error("failed to connect: {detail}")]
    Connect {
        /// Sanitized driver message
        detail: String,
    },

    /// Driver execution failure
    #[error("execution failed: {detail}")]
    Execute {
        /// Sanitized driver message
        detail: String,
        /// Driver-specific subkind (statement, constraint, ...)
        subkind: ExecuteSubkind,
        /// Dead-letter reference if the query was parked
        dead_letter_ref: Option<String>,
    },

    /// Deadline exceeded
    #[error("deadline of {deadline_ms}ms exceeded")]
    Timeout {
        /// The deadline that was exceeded
        deadline_ms: u64,
    },

    /// Caller cancelled
    #[error("request cancelled by caller")]
    Cancelled,

    /// Rate limit exceeded
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds until the bucket refills
        retry_after_ms: u64,
    },

    /// Provider terminally unavailable after retries and failover
    #[error("provider unavailable: {detail}")]
    ProviderUnavailable {
        /// Last terminal error, sanitized
        detail: String,
        /// Dead-letter reference if the call was parked
        dead_letter_ref: Option<String>,
    },

    /// Air-gapped policy violation
    #[error("blocked by air-gapped policy: {detail}")]
    Blocked {
        /// Which policy tripped
        detail: String,
    },

    /// Misconfiguration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation; surfaced opaquely
    #[error("internal error")]
    Internal(String),
}

/// Driver execution failure subkinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteSubkind {
    /// Statement rejected by the database (syntax, unknown column, ...)
    Statement,
    /// Constraint or integrity violation
    Constraint,
    /// Connection dropped or database shut down mid-query
    ConnectionLost,
    /// Anything else the driver reported
    Other,
}

impl fmt::Display for ExecuteSubkind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecuteSubkind::Statement => "statement",
            ExecuteSubkind::Constraint => "constraint",
            ExecuteSubkind::ConnectionLost => "connection_lost",
            ExecuteSubkind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

impl GatewayError {
    /// The taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Auth => ErrorKind::Auth,
            GatewayError::Revoked => ErrorKind::Revoked,
            GatewayError::Parse { .. } => ErrorKind::Parse,
            GatewayError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            GatewayError::SchemaUnknown { .. } => ErrorKind::SchemaUnknown,
            GatewayError::Generation { .. } => ErrorKind::Generation,
            GatewayError::PoolTimeout { .. } => ErrorKind::PoolTimeout,
            GatewayError::Connect { .. } => ErrorKind::Connect,
            GatewayError::Execute { .. } => ErrorKind::Execute,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            GatewayError::Blocked { .. } => ErrorKind::Blocked,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may usefully retry the same request
    ///
    /// Pool saturation and rate limits are transient from the caller's
    /// side. Connect and provider failures are retried internally; once
    /// they surface here, internal recovery is already exhausted but the
    /// condition itself may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::PoolTimeout { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::Connect { .. }
                | GatewayError::ProviderUnavailable { .. }
        )
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

/// User-visible error envelope
///
/// This is the failure half of the ingress contract. Field contents are
/// always safe for display: no encrypted credentials, keys, or raw
/// provider secrets ever land here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Taxonomy kind name
    pub error: ErrorKind,
    /// Internal-facing message (sanitized)
    pub message: String,
    /// Message safe to show an end user
    pub user_friendly_message: String,
    /// Concrete next steps for the caller
    pub suggested_fixes: Vec<String>,
    /// Diagnostic detail (offending identifier, parser position, ...)
    pub actionable_details: String,
    /// Every denied resource, present only for permission denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_resources: Option<Vec<String>>,
    /// SQL produced by NL generation, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    /// Reference into the dead-letter queue, when the query was parked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_ref: Option<String>,
    /// Retry hint in milliseconds for transient failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorReport {
    /// Build a report from an internal error
    ///
    /// `generated_sql` captured earlier in the pipeline is attached when
    /// the variant itself does not already carry it.
    pub fn from_error(err: &GatewayError, generated_sql: Option<&str>) -> Self {
        let mut report = Self {
            error: err.kind(),
            message: err.to_string(),
            user_friendly_message: user_message(err),
            suggested_fixes: suggested_fixes(err),
            actionable_details: actionable_details(err),
            denied_resources: None,
            generated_sql: generated_sql.map(|s| s.to_string()),
            dead_letter_ref: None,
            retry_after_ms: None,
        };

        match err {
            GatewayError::PermissionDenied {
                denied,
                generated_sql,
            } => {
                report.denied_resources = Some(denied.clone());
                if report.generated_sql.is_none() {
                    report.generated_sql = generated_sql.clone();
                }
            }
            GatewayError::Parse { generated_sql, .. } => {
                if report.generated_sql.is_none() {
                    report.generated_sql = generated_sql.clone();
                }
            }
            GatewayError::Execute {
                dead_letter_ref, ..
            }
            | GatewayError::ProviderUnavailable {
                dead_letter_ref, ..
            } => {
                report.dead_letter_ref = dead_letter_ref.clone();
            }
            GatewayError::RateLimited { retry_after_ms } => {
                report.retry_after_ms = Some(*retry_after_ms);
            }
            GatewayError::PoolTimeout { retry_after_ms, .. } => {
                report.retry_after_ms = Some(*retry_after_ms);
            }
            _ => {}
        }

        report
    }
}

/// Message safe to show an end user, free of implementation detail
fn user_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Auth => "Authentication failed. Check your API key.".to_string(),
        GatewayError::Revoked => "This agent has been revoked.".to_string(),
        GatewayError::Parse { .. } => "The query could not be understood.".to_string(),
        GatewayError::PermissionDenied { denied, .. } => {
            format!("You do not have access to: {}.", denied.join(", "))
        }
        GatewayError::SchemaUnknown { resource, .. } => {
            format!("The table '{}' does not exist in your database.", resource)
        }
        GatewayError::Generation { .. } => {
            "Could not turn your question into a query.".to_string()
        }
        GatewayError::PoolTimeout { .. } => "The database is busy. Try again shortly.".to_string(),
        GatewayError::Connect { .. } => "Could not reach the database.".to_string(),
        GatewayError::Execute { .. } => "The database rejected the query.".to_string(),
        GatewayError::Timeout { .. } => "The query took too long and was stopped.".to_string(),
        GatewayError::Cancelled => "The request was cancelled.".to_string(),
        GatewayError::RateLimited { .. } => "Rate limit reached. Try again shortly.".to_string(),
        GatewayError::ProviderUnavailable { .. } => {
            "The AI provider is currently unavailable.".to_string()
        }
        GatewayError::Blocked { .. } => {
            "This operation is not permitted in air-gapped mode.".to_string()
        }
        GatewayError::Config(_) => "The gateway is misconfigured.".to_string(),
        GatewayError::Internal(_) => "An internal error occurred.".to_string(),
    }
}

fn suggested_fixes(err: &GatewayError) -> Vec<String> {
    match err {
        GatewayError::Auth => vec![
            "Verify the API key was copied in full".to_string(),
            "Generate a new key if this one may have been revoked".to_string(),
        ],
        GatewayError::Revoked => vec!["Register a new agent to continue".to_string()],
        GatewayError::Parse { .. } => vec![
            "Check the SQL syntax near the reported fragment".to_string(),
            "Only SELECT/INSERT/UPDATE/DELETE/DDL statements are accepted".to_string(),
        ],
        GatewayError::PermissionDenied { denied, .. } => vec![
            format!("Request access to: {}", denied.join(", ")),
            "Rewrite the query against tables you can read".to_string(),
        ],
        GatewayError::SchemaUnknown { suggestions, .. } => {
            if suggestions.is_empty() {
                vec!["List available resources to find the right name".to_string()]
            } else {
                vec![format!("Did you mean: {}?", suggestions.join(", "))]
            }
        }
        GatewayError::Generation { rephrasings, .. } => {
            if rephrasings.is_empty() {
                vec!["Rephrase the question using table and column names".to_string()]
            } else {
                rephrasings
                    .iter()
                    .map(|r| format!("Try asking: {}", r))
                    .collect()
            }
        }
        GatewayError::PoolTimeout { .. } | GatewayError::RateLimited { .. } => {
            vec!["Retry after the indicated delay".to_string()]
        }
        GatewayError::Connect { .. } => vec![
            "Verify the database endpoint is reachable".to_string(),
            "Update the agent's database binding if credentials changed".to_string(),
        ],
        GatewayError::Execute { .. } => {
            vec!["Inspect the statement against the reported detail".to_string()]
        }
        GatewayError::Timeout { .. } => vec!["Narrow the query or raise the deadline".to_string()],
        GatewayError::Cancelled => vec![],
        GatewayError::ProviderUnavailable { .. } => {
            vec!["Retry later or configure a failover provider".to_string()]
        }
        GatewayError::Blocked { .. } => {
            vec!["Use a local or private-endpoint provider".to_string()]
        }
        GatewayError::Config(_) => vec!["Review the gateway configuration".to_string()],
        GatewayError::Internal(_) => vec!["Contact the operator with the request id".to_string()],
    }
}

fn actionable_details(err: &GatewayError) -> String {
    match err {
        GatewayError::Parse { detail, .. } => detail.clone(),
        GatewayError::SchemaUnknown { resource, .. } => {
            format!("unknown identifier: {}", resource)
        }
        GatewayError::Generation {
            detail, raw_output, ..
        } => format!("{}; raw output: {}", detail, raw_output),
        GatewayError::PoolTimeout { waited_ms, .. } => format!("waited {}ms", waited_ms),
        GatewayError::Connect { detail } => detail.clone(),
        GatewayError::Execute {
            detail, subkind, ..
        } => format!("{} ({})", detail, subkind),
        GatewayError::Timeout { deadline_ms } => format!("deadline {}ms", deadline_ms),
        GatewayError::ProviderUnavailable { detail, .. } => detail.clone(),
        GatewayError::Blocked { detail } => detail.clone(),
        GatewayError::Config(msg) => sanitize_detail(msg),
        // Internal detail is intentionally opaque to the caller
        GatewayError::Internal(_) => String::new(),
        _ => String::new(),
    }
}

/// Sanitize a message for external display
///
/// Strips file paths, control characters, and truncates.
pub fn sanitize_detail(msg: &str) -> String {
    let sanitized = msg
        .split(['/', '\\'])
        .next_back()
        .unwrap_or(msg)
        .chars()
        .take(200)
        .collect::<String>();

    sanitized
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(ErrorKind::PoolTimeout.as_str(), "pool_timeout");
        assert_eq!(
            ErrorKind::ProviderUnavailable.as_str(),
            "provider_unavailable"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(GatewayError::PoolTimeout {
            waited_ms: 100,
            retry_after_ms: 50
        }
        .is_retryable());
        assert!(GatewayError::RateLimited { retry_after_ms: 10 }.is_retryable());

        assert!(!GatewayError::Auth.is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::Timeout { deadline_ms: 5 }.is_retryable());
    }

    #[test]
    fn test_report_carries_all_denied_resources() {
        let err = GatewayError::PermissionDenied {
            denied: vec!["public.customers".into(), "public.orders".into()],
            generated_sql: None,
        };
        let report = ErrorReport::from_error(&err, None);

        assert_eq!(report.error, ErrorKind::PermissionDenied);
        let denied = report.denied_resources.unwrap();
        assert_eq!(denied.len(), 2);
        assert!(denied.contains(&"public.customers".to_string()));
        assert!(denied.contains(&"public.orders".to_string()));
    }

    #[test]
    fn test_report_attaches_generated_sql_from_pipeline() {
        let err = GatewayError::PermissionDenied {
            denied: vec!["public.customers".into()],
            generated_sql: None,
        };
        let report = ErrorReport::from_error(&err, Some("SELECT * FROM customers"));
        assert_eq!(
            report.generated_sql.as_deref(),
            Some("SELECT * FROM customers")
        );
    }

    #[test]
    fn test_rate_limited_report_has_retry_hint() {
        let err = GatewayError::RateLimited {
            retry_after_ms: 1500,
        };
        let report = ErrorReport::from_error(&err, None);
        assert_eq!(report.retry_after_ms, Some(1500));
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let err = GatewayError::Internal("lock poisoned in registry".into());
        let report = ErrorReport::from_error(&err, None);
        assert!(report.actionable_details.is_empty());
        assert!(!report.user_friendly_message.contains("lock"));
    }

    #[test]
    fn test_sanitize_detail_removes_paths() {
        let out = sanitize_detail("/etc/querygate/creds.toml: permission denied");
        assert!(!out.contains("/etc"));
        assert!(out.contains("permission denied"));
    }

    #[test]
    fn test_sanitize_detail_truncates_and_strips_control() {
        let out = sanitize_detail(&format!("x\n{}", "a".repeat(500)));
        assert!(out.len() <= 200);
        assert!(!out.contains('\n'));
    }

    #[test]
    fn test_report_serializes_without_empty_options() {
        let report = ErrorReport::from_error(&GatewayError::Auth, None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"], "auth");
        assert!(json.get("denied_resources").is_none());
        assert!(json.get("dead_letter_ref").is_none());
    }
}
