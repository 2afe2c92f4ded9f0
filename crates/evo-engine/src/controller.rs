//! Evolution controller.
//!
//! Drives iterations up to the configured limits with a bounded number
//! in flight, advances the generation clock, saves checkpoints on an
//! interval, and stops early once the target score is reached.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use evo_core::{Config, EvolveError};
use evo_db::ProgramStore;
use evo_evaluators::Evaluator;
use evo_llm::Ensemble;

use crate::worker::IterationWorker;

/// Outcome of a controller run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub iterations_run: u64,
    pub generations: u64,
    pub best_score: f64,
    pub best_id: Option<String>,
    pub total_evaluations: u64,
    pub target_reached: bool,
}

/// Orchestrates the evolution loop.
pub struct EvolutionController {
    config: Config,
    store: Arc<ProgramStore>,
    worker: IterationWorker,
}

impl EvolutionController {
    pub fn new(
        config: Config,
        store: Arc<ProgramStore>,
        evaluator: Arc<Evaluator>,
        ensemble: Arc<Ensemble>,
    ) -> Self {
        let worker = IterationWorker::new(
            config.clone(),
            Arc::clone(&store),
            evaluator,
            ensemble,
        );
        Self {
            config,
            store,
            worker,
        }
    }

    /// Run the evolution loop to completion.
    pub async fn run(&self) -> Result<RunSummary, EvolveError> {
        if !self.config.controller.resume_from.is_empty() {
            self.store
                .load_checkpoint(&self.config.controller.resume_from)?;
            info!(
                from = %self.config.controller.resume_from,
                iteration = self.store.last_iteration(),
                "resumed from checkpoint"
            );
        }

        let max_iterations = self.config.controller.max_iterations;
        let max_generations = self.config.controller.max_generations;
        let parallel = self.config.controller.parallel_workers.max(1);
        let checkpoint_interval = self.store.config().checkpoint_interval;

        let first_iteration = self.store.last_iteration() + 1;
        let mut next_iteration = first_iteration;
        let mut completed = 0u64;
        let mut target_reached = false;

        let mut in_flight: JoinSet<Result<u64, (u64, EvolveError)>> = JoinSet::new();

        'evolve: loop {
            while in_flight.len() < parallel
                && next_iteration < first_iteration + max_iterations
            {
                let worker = self.worker.clone();
                let iteration = next_iteration;
                next_iteration += 1;
                in_flight.spawn(async move {
                    worker
                        .run_iteration(iteration)
                        .await
                        .map(|result| result.iteration)
                        .map_err(|e| (iteration, e))
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok(Ok(iteration)) => {
                    completed += 1;
                    self.store.update_generation();

                    if checkpoint_interval > 0 && completed % checkpoint_interval == 0 {
                        if let Err(e) = self.store.save_checkpoint(iteration) {
                            warn!(error = %e, "checkpoint save failed");
                        }
                    }
                }
                Ok(Err((iteration, e))) => {
                    // A failed iteration does not kill the run.
                    warn!(iteration, error = %e, "iteration failed");
                    completed += 1;
                    self.store.update_generation();
                }
                Err(e) => warn!(error = %e, "iteration task panicked"),
            }

            if let Some(target) = self.config.controller.target_score {
                let best = self.store.stats().best_score;
                if best >= target {
                    info!(best, target, "target score reached");
                    target_reached = true;
                    break 'evolve;
                }
            }

            if self.store.generation() >= max_generations {
                info!(
                    generation = self.store.generation(),
                    "generation limit reached"
                );
                break 'evolve;
            }
        }

        // Let in-flight iterations finish before the final checkpoint so
        // no evaluated child is lost.
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok(_)) => {
                    completed += 1;
                    self.store.update_generation();
                }
                Ok(Err((iteration, e))) => warn!(iteration, error = %e, "iteration failed"),
                Err(e) => warn!(error = %e, "iteration task panicked"),
            }
        }

        self.store.await_migrations().await;

        let last_iteration = self.store.last_iteration();
        if let Err(e) = self.store.save_checkpoint(last_iteration) {
            warn!(error = %e, "final checkpoint save failed");
        }

        let stats = self.store.stats();
        let best = self.store.global_best();
        Ok(RunSummary {
            iterations_run: completed,
            generations: self.store.generation(),
            best_score: stats.best_score,
            best_id: best.map(|p| p.id.clone()),
            total_evaluations: stats.total_evaluations,
            target_reached,
        })
    }

    pub fn store(&self) -> &Arc<ProgramStore> {
        &self.store
    }
}
