//! Error classification
//!
//! Maps raw driver and provider errors into the closed gateway
//! taxonomy. Driver messages are sanitized before they can reach a
//! report; provider errors fold into `rate_limited`, `blocked`, or
//! `provider_unavailable`.

use provider_manager::{retry_after_ms, ProviderError};
use shared::error::sanitize_detail;
use shared::{ExecuteSubkind, GatewayError};

/// Classify a sqlx error raised while connecting
pub fn classify_connect_error(err: &sqlx::Error) -> GatewayError {
    GatewayError::Connect {
        detail: sanitize_detail(&err.to_string()),
    }
}

/// Classify a sqlx error raised while executing a statement
pub fn classify_execute_error(err: sqlx::Error) -> GatewayError {
    match &err {
        sqlx::Error::Database(db) => {
            let subkind = match db.code().as_deref() {
                // SQLSTATE class 23: integrity constraint violation
                Some(code) if code.starts_with("23") => ExecuteSubkind::Constraint,
                // Class 42: syntax error or access rule violation
                Some(code) if code.starts_with("42") => ExecuteSubkind::Statement,
                // Class 08: connection exception
                Some(code) if code.starts_with("08") => ExecuteSubkind::ConnectionLost,
                _ => ExecuteSubkind::Other,
            };
            GatewayError::Execute {
                detail: sanitize_detail(db.message()),
                subkind,
                dead_letter_ref: None,
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            GatewayError::Execute {
                detail: sanitize_detail(&err.to_string()),
                subkind: ExecuteSubkind::ConnectionLost,
                dead_letter_ref: None,
            }
        }
        _ => GatewayError::Execute {
            detail: sanitize_detail(&err.to_string()),
            subkind: ExecuteSubkind::Other,
            dead_letter_ref: None,
        },
    }
}

/// Whether an execute failure should poison the connection
pub fn is_fatal_execute(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Timeout { .. }
            | GatewayError::Execute {
                subkind: ExecuteSubkind::ConnectionLost,
                ..
            }
    )
}

/// Fold a provider error into the gateway taxonomy
pub fn classify_provider_error(err: ProviderError) -> GatewayError {
    match err {
        ProviderError::RateLimited { retry_after } => GatewayError::RateLimited {
            retry_after_ms: retry_after_ms(retry_after),
        },
        ProviderError::Blocked(detail) => GatewayError::Blocked {
            detail: sanitize_detail(&detail),
        },
        ProviderError::Config(detail) => GatewayError::Config(sanitize_detail(&detail)),
        other => GatewayError::ProviderUnavailable {
            detail: sanitize_detail(&other.to_string()),
            dead_letter_ref: None,
        },
    }
}

/// Known resources ranked by name similarity to an unknown identifier
///
/// Similarity is bigram overlap (Dice coefficient) over the lower-cased
/// final name segment; cheap and good enough for typo suggestions.
pub fn similar_resources(unknown: &str, known: &[String], limit: usize) -> Vec<String> {
    let target = final_segment(unknown);
    let target_bigrams = bigrams(&target);

    let mut scored: Vec<(f64, &String)> = known
        .iter()
        .map(|candidate| {
            let score = dice(&target_bigrams, &bigrams(&final_segment(candidate)));
            (score, candidate)
        })
        .filter(|(score, _)| *score > 0.3)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, name)| name.clone())
        .collect()
}

fn final_segment(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_ascii_lowercase()
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn dice(a: &[(char, char)], b: &[(char, char)]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut b_remaining: Vec<(char, char)> = b.to_vec();
    let mut matches = 0usize;
    for bigram in a {
        if let Some(pos) = b_remaining.iter().position(|x| x == bigram) {
            b_remaining.swap_remove(pos);
            matches += 1;
        }
    }
    (2.0 * matches as f64) / (a.len() + b.len()) as f64
}
