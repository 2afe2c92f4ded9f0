//! Error taxonomy.
//!
//! One enum covers the whole engine so the propagation policy (which
//! failures abort an iteration, which are logged and swallowed) can match
//! on kinds instead of strings.

use std::time::Duration;

use thiserror::Error;

/// Engine-wide error kinds.
#[derive(Debug, Error)]
pub enum EvolveError {
    /// Static configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sampling from a store or island that holds no programs.
    #[error("island {island} is empty")]
    EmptyPopulation { island: usize },

    /// Island id outside `[0, num_islands)`.
    #[error("invalid island id: {0}")]
    InvalidIsland(usize),

    /// Network or HTTP failure talking to an oracle backend.
    #[error("oracle transport error{}: {message}", fmt_status(.status))]
    OracleTransport { status: Option<u16>, message: String },

    /// Oracle reply could not be turned into a child program.
    #[error("oracle parse error: {0}")]
    OracleParse(String),

    /// A cascade stage exceeded its timeout.
    #[error("stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    /// The external evaluator exited non-zero or failed to spawn.
    #[error("stage {stage} execution failed: {message}")]
    StageExec { stage: String, message: String },

    /// A critical cascade stage scored below its threshold.
    #[error("stage {stage} failed threshold: {score:.3} < {threshold:.3}")]
    StageThreshold {
        stage: String,
        score: f64,
        threshold: f64,
    },

    /// Caller cancelled the operation (pool shutdown, dropped context).
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

impl EvolveError {
    /// Whether an oracle transport failure is worth retrying.
    ///
    /// Client errors that will repeat on resend (bad request, bad
    /// credentials, forbidden) are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            EvolveError::OracleTransport { status, .. } => {
                !matches!(status, Some(400) | Some(401) | Some(403))
            }
            EvolveError::Cancelled => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_formats_status() {
        let err = EvolveError::OracleTransport {
            status: Some(401),
            message: "Unauthorized".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "oracle transport error (status 401): Unauthorized"
        );
    }

    #[test]
    fn retriability() {
        let retriable = EvolveError::OracleTransport {
            status: Some(500),
            message: "server error".into(),
        };
        assert!(retriable.is_retriable());

        for code in [400, 401, 403] {
            let err = EvolveError::OracleTransport {
                status: Some(code),
                message: "client error".into(),
            };
            assert!(!err.is_retriable(), "status {code} must not retry");
        }

        assert!(!EvolveError::Cancelled.is_retriable());
    }

    #[test]
    fn threshold_error_message() {
        let err = EvolveError::StageThreshold {
            stage: "basic".into(),
            score: 0.4,
            threshold: 0.5,
        };
        assert_eq!(
            err.to_string(),
            "stage basic failed threshold: 0.400 < 0.500"
        );
    }
}
