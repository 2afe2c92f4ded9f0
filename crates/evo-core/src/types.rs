//! Core data model shared across the engine.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A program under evolution.
///
/// Immutable once inserted into the store, except for migration which
/// rewrites the island assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Program {
    pub id: String,
    pub code: String,
    /// Behavioral feature vector; rescaled to `[0, 1]` on insertion.
    #[serde(default)]
    pub features: Vec<f64>,
    pub score: f64,
    /// Score plus improvement bonus relative to parent. Ranking aid only.
    #[serde(default)]
    pub fitness: f64,
    #[serde(default)]
    pub generation: u64,
    /// `None` until the store assigns an island.
    #[serde(default)]
    pub island_id: Option<usize>,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Program {
    /// Create a program from source code with everything else unset.
    pub fn from_code(code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            code: code.into(),
            features: Vec::new(),
            score: 0.0,
            fitness: 0.0,
            generation: 0,
            island_id: None,
            artifacts: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Program id truncated for log lines.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(8);
        &self.id[..end]
    }
}

/// Outcome of evaluating one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: String,
    pub score: f64,
    /// Dimension-aligned features, when the evaluator supplies them.
    #[serde(default)]
    pub features: Vec<f64>,
    pub success: bool,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration: Duration,
}

impl EvaluationResult {
    /// An unsuccessful result with everything else empty.
    pub fn failed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            score: 0.0,
            features: Vec::new(),
            success: false,
            artifacts: HashMap::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Message role in an oracle conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in an oracle conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the oracle backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Response from an oracle backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub duration: Duration,
}

/// Running statistics over the evolution process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionStats {
    pub total_evaluations: u64,
    pub successful_evals: u64,
    pub failed_evals: u64,
    pub total_mutations: u64,
    pub avg_score: f64,
    pub best_score: f64,
    #[serde(default)]
    pub duration: Duration,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Default for EvolutionStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total_evaluations: 0,
            successful_evals: 0,
            failed_evals: 0,
            total_mutations: 0,
            avg_score: 0.0,
            best_score: 0.0,
            duration: Duration::ZERO,
            start_time: now,
            last_update: now,
        }
    }
}
