//! Configuration tree.
//!
//! Loaded from YAML, adjusted by environment overrides, then validated.
//! Every section carries usable defaults so a minimal file (or none at
//! all) still produces a runnable engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EvolveError;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are an expert programmer helping to evolve and improve code.";
pub const DEFAULT_EVOLUTION_PROMPT: &str = "Please improve the following code:";
pub const DEFAULT_MUTATION_PROMPT: &str = "Please apply a mutation to the following code:";
pub const DEFAULT_OUTPUT_DIR: &str = "evoforge_output";
pub const DEFAULT_CHECKPOINT_SUBDIR: &str = "checkpoints";

pub const DEFAULT_NUM_ISLANDS: usize = 10;
pub const DEFAULT_MAX_ITERATIONS: u64 = 1000;
pub const DEFAULT_MAX_GENERATIONS: u64 = 100;
pub const DEFAULT_PARALLEL_WORKERS: usize = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_MIGRATION_INTERVAL: u64 = 10;
pub const DEFAULT_MIGRATION_RATE: f64 = 0.1;
pub const DEFAULT_GRID_RESOLUTION: usize = 10;
pub const DEFAULT_MAX_PROGRAMS_PER_CELL: usize = 1;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;
pub const DEFAULT_ARTIFACT_MAX_SIZE: usize = 10 * 1024;
pub const DEFAULT_STOCHASTICITY: f64 = 0.1;
pub const DEFAULT_HISTORY_LENGTH: usize = 5;
pub const DEFAULT_MAX_CODE_LENGTH: usize = 50_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub evaluator: EvaluatorConfig,
    pub prompt: PromptConfig,
    pub controller: ControllerConfig,
}

/// Oracle ensemble configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub models: Vec<LlmModelConfig>,
    pub evaluator_models: Vec<LlmModelConfig>,
    pub system_message: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub retries: u32,
    /// Delay between retries in seconds (jittered at runtime).
    pub retry_delay: u64,
    pub random_seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            models: vec![LlmModelConfig {
                name: DEFAULT_MODEL.to_string(),
                weight: 1.0,
                ..LlmModelConfig::default()
            }],
            evaluator_models: Vec::new(),
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            random_seed: 42,
            reasoning_effort: None,
        }
    }
}

/// Configuration for a single oracle backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmModelConfig {
    pub name: String,
    pub weight: f64,
    pub api_base: String,
    pub api_key: String,
    pub system_message: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub timeout: u64,
    pub retries: u32,
    pub retry_delay: u64,
    pub random_seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl Default for LlmModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            weight: 0.0,
            api_base: String::new(),
            api_key: String::new(),
            system_message: String::new(),
            temperature: 0.0,
            top_p: 0.0,
            max_tokens: 0,
            timeout: 0,
            retries: 0,
            retry_delay: 0,
            random_seed: 0,
            reasoning_effort: None,
        }
    }
}

impl LlmModelConfig {
    /// Fill unset fields from the ensemble-level config.
    pub fn with_fallbacks(mut self, llm: &LlmConfig) -> Self {
        if self.name.is_empty() {
            self.name = DEFAULT_MODEL.to_string();
        }
        if self.api_base.is_empty() {
            self.api_base = llm.api_base.clone();
        }
        if self.api_key.is_empty() {
            self.api_key = llm.api_key.clone();
        }
        if self.system_message.is_empty() {
            self.system_message = llm.system_message.clone();
        }
        if self.temperature == 0.0 {
            self.temperature = llm.temperature;
        }
        if self.top_p == 0.0 {
            self.top_p = llm.top_p;
        }
        if self.max_tokens == 0 {
            self.max_tokens = llm.max_tokens;
        }
        if self.timeout == 0 {
            self.timeout = llm.timeout;
        }
        if self.retries == 0 {
            self.retries = llm.retries;
        }
        if self.retry_delay == 0 {
            self.retry_delay = llm.retry_delay;
        }
        if self.reasoning_effort.is_none() {
            self.reasoning_effort = llm.reasoning_effort.clone();
        }
        self
    }
}

/// Population store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub num_islands: usize,
    pub grid_dimensions: Vec<String>,
    pub grid_resolution: HashMap<String, usize>,
    pub grid_bounds: HashMap<String, [f64; 2]>,
    pub migration_interval: u64,
    pub migration_rate: f64,
    pub max_programs_per_cell: usize,
    pub checkpoint_interval: u64,
    pub output_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            num_islands: DEFAULT_NUM_ISLANDS,
            grid_dimensions: vec!["complexity".to_string(), "novelty".to_string()],
            grid_resolution: HashMap::from([
                ("complexity".to_string(), DEFAULT_GRID_RESOLUTION),
                ("novelty".to_string(), DEFAULT_GRID_RESOLUTION),
            ]),
            grid_bounds: HashMap::from([
                ("complexity".to_string(), [0.0, 1.0]),
                ("novelty".to_string(), [0.0, 1.0]),
            ]),
            migration_interval: DEFAULT_MIGRATION_INTERVAL,
            migration_rate: DEFAULT_MIGRATION_RATE,
            max_programs_per_cell: DEFAULT_MAX_PROGRAMS_PER_CELL,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
        }
    }
}

/// A stage in the evaluation cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeStageConfig {
    pub name: String,
    pub threshold: f64,
    /// Stage timeout in seconds.
    pub timeout: u64,
    pub critical: bool,
}

/// Evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub cascade_stages: Vec<CascadeStageConfig>,
    pub parallel_workers: usize,
    pub timeout: u64,
    pub collect_artifacts: bool,
    pub artifact_max_size: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            cascade_stages: vec![
                CascadeStageConfig {
                    name: "validation".to_string(),
                    threshold: 0.0,
                    timeout: 10,
                    critical: true,
                },
                CascadeStageConfig {
                    name: "basic".to_string(),
                    threshold: 0.5,
                    timeout: 30,
                    critical: false,
                },
                CascadeStageConfig {
                    name: "comprehensive".to_string(),
                    threshold: 0.8,
                    timeout: 120,
                    critical: false,
                },
            ],
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            timeout: DEFAULT_TIMEOUT_SECS,
            collect_artifacts: true,
            artifact_max_size: DEFAULT_ARTIFACT_MAX_SIZE,
        }
    }
}

/// A named prompt template with substitution variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub template: String,
    pub variables: HashMap<String, String>,
}

/// Prompt assembly configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    pub templates: Vec<PromptTemplate>,
    pub system_message: String,
    pub evolution_prompt: String,
    pub mutation_prompt: String,
    /// Above 0.5 the iteration worker switches to diff-based parsing.
    pub stochasticity: f64,
    pub include_history: bool,
    pub history_length: usize,
    pub max_code_length: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            evolution_prompt: DEFAULT_EVOLUTION_PROMPT.to_string(),
            mutation_prompt: DEFAULT_MUTATION_PROMPT.to_string(),
            stochasticity: DEFAULT_STOCHASTICITY,
            include_history: true,
            history_length: DEFAULT_HISTORY_LENGTH,
            max_code_length: DEFAULT_MAX_CODE_LENGTH,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_iterations: u64,
    pub max_generations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_score: Option<f64>,
    pub parallel_workers: usize,
    pub checkpoint_dir: String,
    pub resume_from: String,
    pub seed: u64,
    pub verbose: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_generations: DEFAULT_MAX_GENERATIONS,
            target_score: None,
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            checkpoint_dir: Path::new(DEFAULT_OUTPUT_DIR)
                .join(DEFAULT_CHECKPOINT_SUBDIR)
                .to_string_lossy()
                .into_owned(),
            resume_from: String::new(),
            seed: 42,
            verbose: false,
        }
    }
}

impl Config {
    /// Load a configuration file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvolveError> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EvolveError::InvalidConfig(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Config = serde_yaml::from_str(&data)
            .map_err(|e| EvolveError::InvalidConfig(format!("failed to parse config file: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EvolveError> {
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Write a default configuration file.
    pub fn write_default(path: impl AsRef<Path>) -> Result<(), EvolveError> {
        Config::default().save(path)
    }

    /// Apply environment-variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            if !api_base.is_empty() {
                self.llm.api_base = api_base;
            }
        }
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            if !api_key.is_empty() {
                self.llm.api_key = api_key;
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            if !model.is_empty() {
                match self.llm.models.first_mut() {
                    Some(first) => first.name = model,
                    None => self.llm.models.push(LlmModelConfig {
                        name: model,
                        weight: 1.0,
                        ..LlmModelConfig::default()
                    }),
                }
            }
        }
        if let Some(n) = env_parse::<usize>("NUM_ISLANDS") {
            self.database.num_islands = n;
        }
        if let Ok(dir) = std::env::var("OUTPUT_DIR") {
            if !dir.is_empty() {
                self.database.output_dir = dir;
            }
        }
        if let Some(n) = env_parse::<u64>("MAX_ITERATIONS") {
            self.controller.max_iterations = n;
        }
        if let Some(n) = env_parse::<u64>("SEED") {
            self.controller.seed = n;
        }
        if let Ok(verbose) = std::env::var("VERBOSE") {
            self.controller.verbose = verbose.eq_ignore_ascii_case("true");
        }
    }

    /// Validate the configuration, filling derived paths.
    pub fn validate(&mut self) -> Result<(), EvolveError> {
        if self.llm.api_base.is_empty() {
            return Err(EvolveError::InvalidConfig(
                "LLM API base is required".to_string(),
            ));
        }
        if self.llm.models.is_empty() && self.llm.api_key.is_empty() {
            return Err(EvolveError::InvalidConfig(
                "at least one LLM model or API key is required".to_string(),
            ));
        }
        if !self.llm.models.is_empty() {
            let total_weight: f64 = self.llm.models.iter().map(|m| m.weight).sum();
            if total_weight < 0.0 {
                return Err(EvolveError::InvalidConfig(
                    "sum of model weights must not be negative".to_string(),
                ));
            }
        }

        if self.database.num_islands == 0 {
            return Err(EvolveError::InvalidConfig(
                "number of islands must be positive".to_string(),
            ));
        }
        if self.database.grid_dimensions.is_empty() {
            return Err(EvolveError::InvalidConfig(
                "grid dimensions are required".to_string(),
            ));
        }
        if self.database.grid_resolution.len() != self.database.grid_dimensions.len() {
            return Err(EvolveError::InvalidConfig(
                "grid resolution must match dimensions".to_string(),
            ));
        }

        if self.evaluator.parallel_workers == 0 {
            return Err(EvolveError::InvalidConfig(
                "parallel workers must be positive".to_string(),
            ));
        }

        if self.controller.max_iterations == 0 {
            return Err(EvolveError::InvalidConfig(
                "max iterations must be positive".to_string(),
            ));
        }
        if self.controller.parallel_workers == 0 {
            return Err(EvolveError::InvalidConfig(
                "controller parallel workers must be positive".to_string(),
            ));
        }

        if self.database.output_dir.is_empty() {
            self.database.output_dir = DEFAULT_OUTPUT_DIR.to_string();
        }
        if self.controller.checkpoint_dir.is_empty() {
            self.controller.checkpoint_dir = PathBuf::from(&self.database.output_dir)
                .join(DEFAULT_CHECKPOINT_SUBDIR)
                .to_string_lossy()
                .into_owned();
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
