//! evolve: evolutionary code-optimization CLI.
//!
//! Seeds the population from an initial program, then iterates:
//! sample → prompt → oracle → cascade evaluation → insert, with island
//! migration and periodic checkpoints.
//!
//! ```bash
//! evolve --seed-file initial.py --evaluator ./evaluate.sh
//! evolve --config evolve.yaml --iterations 200 --verbose
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use evo_core::{Config, Program};
use evo_db::ProgramStore;
use evo_engine::EvolutionController;
use evo_evaluators::Evaluator;
use evo_llm::Ensemble;

/// Evolve a program against an external evaluator.
#[derive(Parser, Debug)]
#[command(name = "evolve")]
#[command(about = "Evolutionary code optimization driven by an LLM ensemble")]
struct Cli {
    /// Configuration file (YAML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial program to evolve.
    #[arg(long)]
    seed_file: PathBuf,

    /// External evaluator command (receives the candidate path and, in
    /// cascade mode, --stage=stageN).
    #[arg(long)]
    evaluator: PathBuf,

    /// Override controller.max_iterations.
    #[arg(long)]
    iterations: Option<u64>,

    /// Resume from a checkpoint file.
    #[arg(long)]
    resume_from: Option<String>,

    /// Verbose logging.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        },
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            if let Err(e) = config.validate() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            config
        }
    };

    if let Some(iterations) = cli.iterations {
        config.controller.max_iterations = iterations;
    }
    if let Some(ref resume_from) = cli.resume_from {
        config.controller.resume_from = resume_from.clone();
    }
    if cli.verbose {
        config.controller.verbose = true;
    }

    let seed_code = match std::fs::read_to_string(&cli.seed_file) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: failed to read {}: {e}", cli.seed_file.display());
            process::exit(1);
        }
    };

    let store = Arc::new(
        ProgramStore::new(
            config.database.clone(),
            config.controller.checkpoint_dir.clone(),
        )
        .with_seed(config.controller.seed),
    );

    let evaluator = match Evaluator::new(config.evaluator.clone(), &cli.evaluator) {
        Ok(evaluator) => Arc::new(evaluator),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let ensemble = match Ensemble::new(&config.llm) {
        Ok(ensemble) => Arc::new(ensemble),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    println!("\n{}", "=".repeat(70));
    println!(
        "evolve: {} ({} iterations, {} islands, {} models)",
        cli.seed_file.display(),
        config.controller.max_iterations,
        config.database.num_islands,
        config.llm.models.len(),
    );
    println!(
        "Evaluator: {} | Cascade stages: {} | Workers: {}",
        cli.evaluator.display(),
        config.evaluator.cascade_stages.len(),
        config.evaluator.parallel_workers,
    );
    println!("{}", "=".repeat(70));

    // Score the seed before evolution starts, unless resuming.
    if config.controller.resume_from.is_empty() {
        match evaluator.evaluate(&seed_code).await {
            Ok(result) => {
                println!(
                    "\nSeed: score={:.3} success={}",
                    result.score, result.success
                );
                let mut seed = Program::from_code(seed_code);
                seed.score = result.score;
                seed.features = if result.features.is_empty() {
                    vec![result.score, result.duration.as_secs_f64()]
                } else {
                    result.features
                };
                store.add_program(seed, 0);
            }
            Err(e) => {
                eprintln!("Error: seed evaluation failed: {e}");
                process::exit(1);
            }
        }
    }

    let controller = EvolutionController::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&evaluator),
        ensemble,
    );

    let summary = match controller.run().await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: evolution failed: {e}");
            evaluator.close().await;
            process::exit(1);
        }
    };

    evaluator.close().await;

    println!("\n{}", "=".repeat(70));
    println!("Evolution Complete");
    println!("{}", "=".repeat(70));
    println!("  Iterations:    {}", summary.iterations_run);
    println!("  Generations:   {}", summary.generations);
    println!("  Best score:    {:.3}", summary.best_score);
    println!("  Evaluations:   {}", summary.total_evaluations);
    println!("  Target hit:    {}", summary.target_reached);

    if let Some(best) = store.global_best() {
        let output_dir = PathBuf::from(&config.database.output_dir);
        let _ = std::fs::create_dir_all(&output_dir);
        if let Err(e) = std::fs::write(output_dir.join("best.src"), &best.code) {
            eprintln!("Warning: failed to write best program: {e}");
        }
        match serde_json::to_string_pretty(&*best) {
            Ok(info) => {
                let _ = std::fs::write(output_dir.join("best_info.json"), info);
            }
            Err(e) => eprintln!("Warning: failed to serialize best program: {e}"),
        }
        println!("  Output:        {}", output_dir.display());
    }
}
