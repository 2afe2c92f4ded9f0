//! Full iteration cycle against a mock oracle and a scripted evaluator.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use evo_core::config::{CascadeStageConfig, Config};
use evo_core::{EvolveError, LlmMessage, LlmResponse, Program, TokenUsage};
use evo_db::ProgramStore;
use evo_engine::IterationWorker;
use evo_evaluators::Evaluator;
use evo_llm::{Ensemble, LlmClient};

struct ScriptedOracle {
    reply: String,
}

#[async_trait]
impl LlmClient for ScriptedOracle {
    async fn generate(&self, _prompt: &str) -> Result<LlmResponse, EvolveError> {
        Ok(LlmResponse {
            content: self.reply.clone(),
            model: "scripted".to_string(),
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
        "scripted"
    }
}

fn write_evaluator(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("evaluator.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.database.num_islands = 2;
    config.evaluator.cascade_stages = vec![CascadeStageConfig {
        name: "validation".to_string(),
        threshold: 0.0,
        timeout: 10,
        critical: true,
    }];
    config.evaluator.parallel_workers = 2;
    config
}

fn seeded_store(config: &Config) -> Arc<ProgramStore> {
    let store = Arc::new(ProgramStore::new(config.database.clone(), "").with_seed(42));
    let mut seed = Program::from_code("def fib(n): return fib(n-1) + fib(n-2)");
    seed.id = "seed".to_string();
    seed.score = 0.3;
    seed.features = vec![0.3, 0.1];
    seed.island_id = Some(0);
    store.add_program(seed, 0);
    store
}

fn worker_with(
    config: &Config,
    store: &Arc<ProgramStore>,
    evaluator_script: PathBuf,
    oracle_reply: &str,
) -> IterationWorker {
    let evaluator =
        Arc::new(Evaluator::new(config.evaluator.clone(), evaluator_script).unwrap());
    let oracle: Arc<dyn LlmClient> = Arc::new(ScriptedOracle {
        reply: oracle_reply.to_string(),
    });
    let ensemble = Arc::new(Ensemble::from_clients(vec![oracle], vec![1.0], 42).unwrap());
    IterationWorker::new(config.clone(), Arc::clone(store), evaluator, ensemble)
}

#[tokio::test]
async fn iteration_inserts_an_evaluated_child() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(&dir, "echo \"SCORE: 0.8\"");
    let config = test_config();
    let store = seeded_store(&config);

    let worker = worker_with(
        &config,
        &store,
        script,
        "Here is an improvement:\n```python\ndef fib(n):\n    a, b = 0, 1\n    for _ in range(n):\n        a, b = b, a + b\n    return a\n```",
    );

    let result = worker.run_iteration(1).await.unwrap();

    assert_eq!(result.iteration, 1);
    assert_eq!(result.parent.id, "seed");
    assert!(result.child.code.contains("a, b = b, a + b"));
    assert_eq!(result.changes, "Full rewrite");
    assert!((result.evaluation.score - 0.8).abs() < 1e-9);

    // Child landed in the store on the parent's island, one generation
    // deeper, and became the new global best.
    assert_eq!(store.len(), 2);
    let child = store.get_program(&result.child.id).unwrap();
    assert_eq!(child.generation, 1);
    assert_eq!(child.island_id, Some(0));
    assert_eq!(store.global_best().unwrap().id, child.id);

    // Fitness carries the improvement bonus: 0.8 + (0.8 - 0.3) * 0.1.
    assert!((child.fitness - 0.85).abs() < 1e-9);
}

#[tokio::test]
async fn response_without_code_fails_the_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(&dir, "echo \"SCORE: 0.8\"");
    let config = test_config();
    let store = seeded_store(&config);

    let worker = worker_with(&config, &store, script, "I cannot help with that.");

    let err = worker.run_iteration(1).await.unwrap_err();
    assert!(matches!(err, EvolveError::OracleParse(_)));
    // No partial insertion.
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn oversized_child_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(&dir, "echo \"SCORE: 0.8\"");
    let mut config = test_config();
    config.prompt.max_code_length = 64;
    let store = seeded_store(&config);

    let big = format!("```python\n{}\n```", "x = 1\n".repeat(100));
    let worker = worker_with(&config, &store, script, &big);

    let err = worker.run_iteration(1).await.unwrap_err();
    assert!(err.to_string().contains("exceeds maximum length"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn diff_mode_uses_first_block() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(&dir, "echo \"SCORE: 0.5\"");
    let mut config = test_config();
    config.prompt.stochasticity = 0.9;
    let store = seeded_store(&config);

    let worker = worker_with(
        &config,
        &store,
        script,
        "```python\nfirst_block = 1\n```\n```python\nsecond_block_is_much_longer = 2222\n```",
    );

    let result = worker.run_iteration(1).await.unwrap();
    assert_eq!(result.child.code, "first_block = 1");
    assert_eq!(result.changes, "Applied 2 diff(s)");
}

#[tokio::test]
async fn empty_store_fails_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(&dir, "echo \"SCORE: 0.8\"");
    let config = test_config();
    let store = Arc::new(ProgramStore::new(config.database.clone(), "").with_seed(42));

    let worker = worker_with(&config, &store, script, "```python\nx = 1\n```");

    let err = worker.run_iteration(1).await.unwrap_err();
    assert!(matches!(err, EvolveError::EmptyPopulation { .. }));
}

#[tokio::test]
async fn evaluator_features_override_coarse_vector() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_evaluator(
        &dir,
        r#"echo '{"score": 0.9, "success": true, "features": [0.25, 0.75]}'"#,
    );
    let config = test_config();
    let store = seeded_store(&config);

    let worker = worker_with(&config, &store, script, "```python\nx = 1\n```");

    let result = worker.run_iteration(1).await.unwrap();
    // Features are rescaled on insertion, but the child carries the
    // evaluator-supplied arity, not the (score, duration) stand-in.
    assert_eq!(result.child.features.len(), 2);
    assert!((result.evaluation.features[0] - 0.25).abs() < 1e-9);
}
