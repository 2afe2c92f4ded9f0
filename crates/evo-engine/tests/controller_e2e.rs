//! Controller loop against a mock oracle and a scripted evaluator.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use evo_core::config::{CascadeStageConfig, Config};
use evo_core::{EvolveError, LlmMessage, LlmResponse, Program, TokenUsage};
use evo_db::ProgramStore;
use evo_engine::EvolutionController;
use evo_evaluators::Evaluator;
use evo_llm::{Ensemble, LlmClient};

/// Oracle whose replies embed a monotonically increasing score marker the
/// evaluator script echoes back.
struct CountingOracle {
    calls: AtomicU64,
}

#[async_trait]
impl LlmClient for CountingOracle {
    async fn generate(&self, _prompt: &str) -> Result<LlmResponse, EvolveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let score = 0.1 + call as f64 * 0.05;
        Ok(LlmResponse {
            content: format!("```python\n# candidate {call}\nprint({score})\n```"),
            model: "counting".to_string(),
            usage: TokenUsage::default(),
            duration: Duration::ZERO,
        })
    }

    async fn generate_with_system(
        &self,
        _system: &str,
        _messages: &[LlmMessage],
    ) -> Result<LlmResponse, EvolveError> {
        self.generate("").await
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

fn write_evaluator(dir: &tempfile::TempDir) -> PathBuf {
    // Scores the candidate by the number embedded in its print call.
    let body = r#"score=$(sed -n 's/.*print(\(.*\)).*/\1/p' "$1")
echo "SCORE: ${score:-0}""#;
    let path = dir.path().join("evaluator.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(checkpoint_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.database.num_islands = 2;
    config.database.migration_interval = 3;
    config.database.checkpoint_interval = 2;
    config.database.output_dir = String::new();
    config.evaluator.cascade_stages = vec![CascadeStageConfig {
        name: "validation".to_string(),
        threshold: 0.0,
        timeout: 10,
        critical: true,
    }];
    config.evaluator.parallel_workers = 2;
    config.controller.max_iterations = 6;
    config.controller.max_generations = 100;
    config.controller.parallel_workers = 1;
    config.controller.checkpoint_dir = checkpoint_dir.to_string_lossy().into_owned();
    config
}

fn build_controller(config: &Config, dir: &tempfile::TempDir) -> EvolutionController {
    let store = Arc::new(
        ProgramStore::new(
            config.database.clone(),
            config.controller.checkpoint_dir.clone(),
        )
        .with_seed(7),
    );

    let mut seed = Program::from_code("print(0.0)");
    seed.id = "seed".to_string();
    seed.score = 0.0;
    seed.features = vec![0.0, 0.0];
    seed.island_id = Some(0);
    store.add_program(seed, 0);

    let evaluator = Arc::new(
        Evaluator::new(config.evaluator.clone(), write_evaluator(dir)).unwrap(),
    );
    let oracle: Arc<dyn LlmClient> = Arc::new(CountingOracle {
        calls: AtomicU64::new(0),
    });
    let ensemble = Arc::new(Ensemble::from_clients(vec![oracle], vec![1.0], 7).unwrap());

    EvolutionController::new(config.clone(), store, evaluator, ensemble)
}

#[tokio::test]
async fn run_completes_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = tempfile::tempdir().unwrap();
    let config = test_config(checkpoints.path());

    let controller = build_controller(&config, &dir);
    let summary = controller.run().await.unwrap();

    assert_eq!(summary.iterations_run, 6);
    assert!(summary.generations >= 6);
    // Scores increase monotonically, so the best comes from the last
    // candidates.
    assert!(summary.best_score > 0.2);
    assert_eq!(summary.total_evaluations, 7); // seed + 6 children

    assert!(checkpoints.path().join("latest.json").exists());

    // The store survives a round-trip through its own checkpoint.
    let restored = Arc::new(
        ProgramStore::new(config.database.clone(), "").with_seed(7),
    );
    restored
        .load_checkpoint(checkpoints.path().join("latest.json"))
        .unwrap();
    assert_eq!(restored.len(), controller.store().len());
    assert_eq!(
        restored.global_best().unwrap().id,
        controller.store().global_best().unwrap().id
    );
}

#[tokio::test]
async fn target_score_stops_the_run_early() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = tempfile::tempdir().unwrap();
    let mut config = test_config(checkpoints.path());
    config.controller.max_iterations = 50;
    config.controller.target_score = Some(0.2);

    let controller = build_controller(&config, &dir);
    let summary = controller.run().await.unwrap();

    assert!(summary.target_reached);
    assert!(summary.iterations_run < 50);
    assert!(summary.best_score >= 0.2);
}
