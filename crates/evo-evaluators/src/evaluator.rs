//! Evaluator facade.
//!
//! Owns the worker pool and routes candidates to cascade or direct
//! evaluation. Candidate code is materialized to a scratch file for the
//! external evaluator and removed afterwards.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::info;
use uuid::Uuid;

use evo_core::config::EvaluatorConfig;
use evo_core::{EvaluationResult, EvolveError};

use crate::cascade::CascadeEvaluator;
use crate::worker_pool::{JobHandler, WorkerPool};

/// Program evaluator with a bounded worker pool.
pub struct Evaluator {
    config: EvaluatorConfig,
    pool: WorkerPool,
    pending_artifacts: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").field("config", &self.config).finish()
    }
}

struct EvalBackend {
    cascade: CascadeEvaluator,
    use_cascade: bool,
}

#[async_trait]
impl JobHandler for EvalBackend {
    async fn handle(&self, id: &str, code: &str) -> Result<EvaluationResult, EvolveError> {
        let start = Instant::now();

        let mut scratch = tempfile::Builder::new()
            .prefix(&format!("eval-{id}-"))
            .suffix(".src")
            .tempfile()?;
        scratch.write_all(code.as_bytes())?;
        scratch.flush()?;

        let mut result = if self.use_cascade {
            self.cascade.evaluate(scratch.path()).await
        } else {
            self.cascade.evaluate_direct(scratch.path()).await
        };

        result.id = id.to_string();
        result.duration = start.elapsed();
        Ok(result)
    }
}

impl Evaluator {
    /// Create an evaluator running the external program at
    /// `evaluator_path`.
    pub fn new(
        config: EvaluatorConfig,
        evaluator_path: impl Into<PathBuf>,
    ) -> Result<Self, EvolveError> {
        let evaluator_path = evaluator_path.into();
        if !evaluator_path.exists() {
            return Err(EvolveError::InvalidConfig(format!(
                "evaluation program not found: {}",
                evaluator_path.display()
            )));
        }

        let backend = EvalBackend {
            cascade: CascadeEvaluator::new(
                &config.cascade_stages,
                &evaluator_path,
                config.artifact_max_size,
            ),
            use_cascade: !config.cascade_stages.is_empty(),
        };

        info!(
            program = %evaluator_path.display(),
            workers = config.parallel_workers,
            cascade = backend.use_cascade,
            artifacts = config.collect_artifacts,
            "initialized evaluator"
        );

        Ok(Self {
            pool: WorkerPool::new(config.parallel_workers, Arc::new(backend)),
            config,
            pending_artifacts: Mutex::new(HashMap::new()),
        })
    }

    /// Evaluate one candidate through the worker pool.
    pub async fn evaluate(&self, code: &str) -> Result<EvaluationResult, EvolveError> {
        let job_id = Uuid::new_v4().to_string();
        let result = self.pool.run(&job_id, code).await?;

        if self.config.collect_artifacts && !result.artifacts.is_empty() {
            self.pending_artifacts
                .lock()
                .unwrap()
                .insert(result.id.clone(), result.artifacts.clone());
        }

        Ok(result)
    }

    /// Evaluate a batch concurrently; the pool bounds parallelism. Fails
    /// with the first error once all evaluations have settled.
    pub async fn evaluate_batch(
        &self,
        codes: &[String],
    ) -> Result<Vec<EvaluationResult>, EvolveError> {
        let results = join_all(codes.iter().map(|code| self.evaluate(code))).await;

        let mut out = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results {
            match result {
                Ok(r) => out.push(r),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(_) => {}
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Stored artifacts for a completed evaluation.
    pub fn artifacts(&self, id: &str) -> Option<HashMap<String, String>> {
        self.pending_artifacts.lock().unwrap().get(id).cloned()
    }

    /// Drop stored artifacts for an evaluation.
    pub fn clear_artifacts(&self, id: &str) {
        self.pending_artifacts.lock().unwrap().remove(id);
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Shut down the worker pool, cancelling in-flight evaluations.
    pub async fn close(&self) {
        self.pool.stop().await;
        info!("evaluator shutdown complete");
    }
}
