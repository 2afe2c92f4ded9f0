//! Cascade evaluation.
//!
//! Runs the external evaluator through an ordered sequence of
//! threshold-gated stages, each under its own timeout. A timed-out or
//! crashed stage is fatal; a sub-threshold score is fatal only for
//! critical stages. The cascade score is the running maximum over
//! accepted stages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use evo_core::config::CascadeStageConfig;
use evo_core::{EvaluationResult, EvolveError};

/// Sentinel returned when no score can be parsed from stage output.
const UNPARSED_SCORE: f64 = -1.0;

/// Timeout for direct (non-cascade) evaluation.
const DIRECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One stage of the cascade.
#[derive(Debug, Clone)]
pub struct CascadeStage {
    pub name: String,
    pub threshold: f64,
    pub timeout: Duration,
    pub critical: bool,
}

impl From<&CascadeStageConfig> for CascadeStage {
    fn from(config: &CascadeStageConfig) -> Self {
        Self {
            name: config.name.clone(),
            threshold: config.threshold,
            timeout: Duration::from_secs(config.timeout),
            critical: config.critical,
        }
    }
}

/// Structured output the evaluator child may emit on stdout.
#[derive(Debug, Deserialize)]
struct EvaluatorOutput {
    score: f64,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    artifacts: HashMap<String, String>,
    #[serde(default)]
    #[allow(dead_code)]
    metrics: HashMap<String, f64>,
    #[serde(default)]
    features: Vec<f64>,
}

/// Staged scoring pipeline over an external evaluator command.
pub struct CascadeEvaluator {
    stages: Vec<CascadeStage>,
    evaluator_path: PathBuf,
    artifact_max_size: usize,
}

struct StageOutcome {
    score: f64,
    successful: bool,
    artifacts: HashMap<String, String>,
    features: Vec<f64>,
}

impl CascadeEvaluator {
    pub fn new(
        stages: &[CascadeStageConfig],
        evaluator_path: impl Into<PathBuf>,
        artifact_max_size: usize,
    ) -> Self {
        Self {
            stages: stages.iter().map(CascadeStage::from).collect(),
            evaluator_path: evaluator_path.into(),
            artifact_max_size,
        }
    }

    pub fn stages(&self) -> &[CascadeStage] {
        &self.stages
    }

    /// Run the candidate at `program_path` through every stage.
    ///
    /// Fatal stage failures (timeout, crash, critical threshold miss)
    /// produce an unsuccessful result carrying the failing stage name
    /// under the `failure_stage` artifact; non-critical threshold misses
    /// are logged and skipped.
    pub async fn evaluate(&self, program_path: &Path) -> EvaluationResult {
        let start = Instant::now();
        let mut result = EvaluationResult::failed(format!("cascade-{}", Uuid::new_v4()));
        let mut best_accepted: Option<f64> = None;

        for (i, stage) in self.stages.iter().enumerate() {
            let stage_number = i + 1;
            debug!(stage = %stage.name, number = stage_number, "running cascade stage");

            let outcome = match self.run_stage(stage, stage_number, program_path).await {
                Ok(outcome) => outcome,
                Err(failure) => {
                    match &failure {
                        EvolveError::StageTimeout { .. } => {
                            result
                                .artifacts
                                .insert("timeout".to_string(), "true".to_string());
                            result.artifacts.insert(
                                "timeout_duration".to_string(),
                                format!("{:?}", stage.timeout),
                            );
                        }
                        EvolveError::StageExec { message, .. } => {
                            result
                                .artifacts
                                .insert("stderr".to_string(), self.truncate(message));
                            result
                                .artifacts
                                .insert("stage_error".to_string(), self.truncate(message));
                        }
                        _ => {}
                    }
                    result.error = Some(failure.to_string());
                    result
                        .artifacts
                        .insert("failure_stage".to_string(), stage.name.clone());
                    result.duration = start.elapsed();
                    return result;
                }
            };

            if !outcome.successful || outcome.score < stage.threshold {
                if stage.critical {
                    let failure = EvolveError::StageThreshold {
                        stage: stage.name.clone(),
                        score: outcome.score,
                        threshold: stage.threshold,
                    };
                    result.score = outcome.score;
                    result.error = Some(failure.to_string());
                    result
                        .artifacts
                        .insert("failure_stage".to_string(), stage.name.clone());
                    result
                        .artifacts
                        .insert("threshold_failed".to_string(), "true".to_string());
                    result.duration = start.elapsed();
                    return result;
                }

                warn!(
                    stage = %stage.name,
                    score = outcome.score,
                    threshold = stage.threshold,
                    "stage failed threshold, continuing"
                );
                continue;
            }

            // Accepted: the cascade score is the best any stage achieved.
            best_accepted = Some(best_accepted.map_or(outcome.score, |b| b.max(outcome.score)));
            if !outcome.features.is_empty() {
                result.features = outcome.features;
            }
            for (k, v) in outcome.artifacts {
                result.artifacts.insert(k, self.truncate(&v));
            }
        }

        result.score = best_accepted.unwrap_or(0.0);
        result.success = true;
        result.duration = start.elapsed();
        result
    }

    /// Direct evaluation: one evaluator run, no stage argument.
    pub async fn evaluate_direct(&self, program_path: &Path) -> EvaluationResult {
        let start = Instant::now();
        let mut result = EvaluationResult::failed(format!("direct-{}", Uuid::new_v4()));

        let mut cmd = Command::new(&self.evaluator_path);
        cmd.arg(program_path);

        match run_command("evaluation", cmd, DIRECT_TIMEOUT).await {
            Ok(output) => {
                let outcome = self.parse_output(&output);
                result.score = outcome.score;
                result.success = outcome.score >= 0.0;
                result.features = outcome.features;
                result.artifacts = outcome
                    .artifacts
                    .into_iter()
                    .map(|(k, v)| (k, self.truncate(&v)))
                    .collect();
                result
                    .artifacts
                    .entry("stdout".to_string())
                    .or_insert_with(|| self.truncate(&output));
            }
            Err(failure) => {
                if let EvolveError::StageTimeout { .. } = &failure {
                    result
                        .artifacts
                        .insert("timeout".to_string(), "true".to_string());
                } else if let EvolveError::StageExec { message, .. } = &failure {
                    result
                        .artifacts
                        .insert("stderr".to_string(), self.truncate(message));
                }
                result.error = Some(failure.to_string());
            }
        }

        result.duration = start.elapsed();
        result
    }

    async fn run_stage(
        &self,
        stage: &CascadeStage,
        stage_number: usize,
        program_path: &Path,
    ) -> Result<StageOutcome, EvolveError> {
        let mut cmd = Command::new(&self.evaluator_path);
        cmd.arg(program_path);
        cmd.arg(format!("--stage=stage{stage_number}"));

        let output = run_command(&stage.name, cmd, stage.timeout).await?;
        Ok(self.parse_output(&output))
    }

    /// Score extraction: structured JSON first, then `SCORE:` line scan,
    /// then the unparsed sentinel.
    fn parse_output(&self, output: &str) -> StageOutcome {
        if let Ok(parsed) = serde_json::from_str::<EvaluatorOutput>(output.trim()) {
            let mut artifacts = parsed.artifacts;
            if let Some(error) = parsed.error {
                artifacts.insert("error".to_string(), error);
            }
            return StageOutcome {
                score: parsed.score,
                successful: parsed.success.unwrap_or(true),
                artifacts,
                features: parsed.features,
            };
        }

        for line in output.lines() {
            if let Some(rest) = line.strip_prefix("SCORE: ") {
                if let Ok(score) = rest.trim().parse::<f64>() {
                    return StageOutcome {
                        score,
                        successful: true,
                        artifacts: HashMap::from([(
                            "stdout".to_string(),
                            self.truncate(output),
                        )]),
                        features: Vec::new(),
                    };
                }
            }
        }

        warn!(output_len = output.len(), "could not parse score from output");
        StageOutcome {
            score: UNPARSED_SCORE,
            successful: false,
            artifacts: HashMap::from([("stdout".to_string(), self.truncate(output))]),
            features: Vec::new(),
        }
    }

    fn truncate(&self, s: &str) -> String {
        truncate_artifact(s, self.artifact_max_size)
    }
}

/// Run a command to completion under a timeout, returning combined
/// stdout + stderr. A non-zero exit is an execution failure carrying the
/// captured stderr.
async fn run_command(
    stage: &str,
    mut cmd: Command,
    timeout: Duration,
) -> Result<String, EvolveError> {
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| EvolveError::StageTimeout {
            stage: stage.to_string(),
            timeout,
        })?
        .map_err(|e| EvolveError::StageExec {
            stage: stage.to_string(),
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map_or("signal".to_string(), |c| c.to_string());
        return Err(EvolveError::StageExec {
            stage: stage.to_string(),
            message: format!("exit status {code}: {}", stderr.trim()),
        });
    }

    if stderr.is_empty() {
        Ok(stdout.into_owned())
    } else {
        Ok(format!("{stdout}\n{stderr}"))
    }
}

/// Cap artifact size, marking the cut.
pub fn truncate_artifact(s: &str, max_size: usize) -> String {
    if s.len() <= max_size {
        return s.to_string();
    }
    let mut end = max_size;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}
