//! Iteration worker: one generation cycle.
//!
//! Sample a parent and inspirations, ask the oracle for a mutation,
//! parse the reply into a child program, evaluate it, and route the
//! child back into the store. Insertion is last, so a failed or
//! cancelled iteration leaves no partial state behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use evo_core::{Config, EvaluationResult, EvolveError, Program};
use evo_db::ProgramStore;
use evo_evaluators::Evaluator;
use evo_llm::Ensemble;

use crate::prompt::{self, PromptData};

/// Fraction of the parent improvement credited as a fitness bonus.
const IMPROVEMENT_BONUS: f64 = 0.1;

/// Runs single evolution iterations.
#[derive(Clone)]
pub struct IterationWorker {
    config: Config,
    store: Arc<ProgramStore>,
    evaluator: Arc<Evaluator>,
    ensemble: Arc<Ensemble>,
}

/// Everything observable about one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationResult {
    pub iteration: u64,
    pub parent: Program,
    pub child: Program,
    pub evaluation: EvaluationResult,
    pub prompt: PromptData,
    pub llm_response: String,
    pub duration: Duration,
    pub artifacts: HashMap<String, String>,
    pub changes: String,
}

impl IterationWorker {
    pub fn new(
        config: Config,
        store: Arc<ProgramStore>,
        evaluator: Arc<Evaluator>,
        ensemble: Arc<Ensemble>,
    ) -> Self {
        Self {
            config,
            store,
            evaluator,
            ensemble,
        }
    }

    /// Execute one evolution iteration.
    pub async fn run_iteration(&self, iteration: u64) -> Result<IterationResult, EvolveError> {
        debug!(iteration, "starting iteration");
        let start = Instant::now();

        let (parent, inspirations) = self.sample_programs()?;

        let prompt_data =
            prompt::build_prompt(&self.config.prompt, &parent, &inspirations, iteration);

        let full_prompt = format!(
            "System: {}\n\nUser: {}",
            prompt_data.system, prompt_data.user
        );
        let llm_response = self.ensemble.generate(&full_prompt).await?;

        let (child_code, changes) = if self.config.prompt.stochasticity > 0.5 {
            prompt::apply_diffs(&llm_response.content)?
        } else {
            let code = prompt::parse_full_rewrite(&llm_response.content).ok_or_else(|| {
                EvolveError::OracleParse("no code blocks found in response".to_string())
            })?;
            (code, "Full rewrite".to_string())
        };

        let max_len = self.config.prompt.max_code_length;
        if child_code.len() > max_len {
            return Err(EvolveError::OracleParse(format!(
                "generated code exceeds maximum length: {} > {max_len}",
                child_code.len()
            )));
        }

        let evaluation = self.evaluator.evaluate(&child_code).await?;

        let features = if evaluation.features.is_empty() {
            // Coarse stand-in when the evaluator supplies no feature
            // vector.
            vec![evaluation.score, evaluation.duration.as_secs_f64()]
        } else {
            evaluation.features.clone()
        };

        let now = Utc::now();
        let child = Program {
            id: Uuid::new_v4().to_string(),
            code: child_code,
            features,
            score: evaluation.score,
            fitness: calculate_fitness(evaluation.score, Some(&parent)),
            generation: parent.generation + 1,
            island_id: parent.island_id,
            artifacts: evaluation.artifacts.clone(),
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.add_program(child, iteration);

        info!(
            iteration,
            score = evaluation.score,
            success = evaluation.success,
            program = stored.short_id(),
            "iteration completed"
        );

        Ok(IterationResult {
            iteration,
            parent: (*parent).clone(),
            child: (*stored).clone(),
            artifacts: evaluation.artifacts.clone(),
            evaluation,
            prompt: prompt_data,
            llm_response: llm_response.content,
            duration: start.elapsed(),
            changes,
        })
    }

    /// Sample a parent from the cursor island, falling back across all
    /// islands, plus up to three inspirations.
    fn sample_programs(&self) -> Result<(Arc<Program>, Vec<Arc<Program>>), EvolveError> {
        let parent = match self.store.sample_from_island(self.store.current_island()) {
            Ok(parent) => parent,
            Err(_) => {
                let mut found = None;
                for island in 0..self.store.num_islands() {
                    if let Ok(parent) = self.store.sample_from_island(island) {
                        found = Some(parent);
                        break;
                    }
                }
                found.ok_or(EvolveError::EmptyPopulation { island: 0 })?
            }
        };

        let inspirations = match self.store.sample_multiple(3) {
            Ok(inspirations) => inspirations,
            Err(e) => {
                warn!(error = %e, "failed to sample inspirations, continuing without them");
                Vec::new()
            }
        };

        Ok((parent, inspirations))
    }
}

/// Score plus a 10% bonus on any improvement over the parent. Regressions
/// carry no penalty.
pub fn calculate_fitness(score: f64, parent: Option<&Program>) -> f64 {
    let mut fitness = score;
    if let Some(parent) = parent {
        let improvement = score - parent.score;
        if improvement > 0.0 {
            fitness += improvement * IMPROVEMENT_BONUS;
        }
    }
    fitness
}

impl IterationResult {
    /// Compact summary for structured logging.
    pub fn stats(&self) -> serde_json::Value {
        let mut stats = json!({
            "iteration": self.iteration,
            "duration_ms": self.duration.as_millis() as u64,
            "parent_score": self.parent.score,
            "child_score": self.evaluation.score,
            "score_improvement": self.evaluation.score - self.parent.score,
            "generation": self.child.generation,
            "changes_type": self.changes,
            "evaluation_success": self.evaluation.success,
        });
        if !self.artifacts.is_empty() {
            stats["artifacts_count"] = json!(self.artifacts.len());
        }
        stats
    }

    /// Pretty JSON view for run logs.
    pub fn to_json(&self) -> Result<String, EvolveError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
