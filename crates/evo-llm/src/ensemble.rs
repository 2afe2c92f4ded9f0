//! Weighted model ensemble.
//!
//! Routes each request to one backend by weighted random choice. Weights
//! normalize to sum 1; an all-zero weight vector becomes uniform. The RNG
//! is seeded from the first model's `random_seed` when nonzero so runs
//! are reproducible.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use evo_core::config::{LlmConfig, LlmModelConfig};
use evo_core::{EvolveError, LlmMessage, LlmResponse};

use crate::openai::{LlmClient, OpenAiClient};

/// Ensemble of oracle backends with weighted selection.
pub struct Ensemble {
    clients: Vec<Arc<dyn LlmClient>>,
    weights: Vec<f64>,
    total_weight: f64,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble")
            .field("num_clients", &self.clients.len())
            .field("weights", &self.weights)
            .field("total_weight", &self.total_weight)
            .finish()
    }
}

/// Snapshot of the ensemble's routing table.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleStats {
    pub num_clients: usize,
    pub total_weight: f64,
    pub weights: Vec<f64>,
}

impl Ensemble {
    /// Build the ensemble from the LLM section of the configuration,
    /// filling per-model gaps from the section-level values.
    pub fn new(llm: &LlmConfig) -> Result<Self, EvolveError> {
        let configs: Vec<LlmModelConfig> = llm
            .models
            .iter()
            .map(|m| m.clone().with_fallbacks(llm))
            .collect();
        Self::from_model_configs(configs)
    }

    /// Build the ensemble from explicit model configurations.
    pub fn from_model_configs(configs: Vec<LlmModelConfig>) -> Result<Self, EvolveError> {
        if configs.is_empty() {
            return Err(EvolveError::InvalidConfig(
                "at least one model configuration is required".to_string(),
            ));
        }

        let seed = match configs[0].random_seed {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            seed => seed,
        };

        let raw_weights: Vec<f64> = configs.iter().map(|c| c.weight).collect();
        let mut clients: Vec<Arc<dyn LlmClient>> = Vec::with_capacity(configs.len());
        for config in configs {
            clients.push(Arc::new(OpenAiClient::new(config)?));
        }

        Self::from_clients(clients, raw_weights, seed)
    }

    /// Assemble from pre-built clients. Test seam and extension point for
    /// non-OpenAI backends.
    pub fn from_clients(
        clients: Vec<Arc<dyn LlmClient>>,
        raw_weights: Vec<f64>,
        seed: u64,
    ) -> Result<Self, EvolveError> {
        if clients.is_empty() {
            return Err(EvolveError::InvalidConfig(
                "at least one model configuration is required".to_string(),
            ));
        }

        let total: f64 = raw_weights.iter().sum();
        let weights = if total > 0.0 {
            raw_weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / clients.len() as f64; clients.len()]
        };
        let total_weight = if total > 0.0 { total } else { 1.0 };

        info!(models = clients.len(), "initialized LLM ensemble");
        for (client, weight) in clients.iter().zip(&weights) {
            info!(model = client.model_name(), weight = *weight, "ensemble member");
        }

        Ok(Self {
            clients,
            weights,
            total_weight,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Pick a client by weighted random choice.
    ///
    /// Cumulative weights can fall fractionally short of 1.0; the last
    /// client absorbs the shortfall.
    fn select_index(&self) -> usize {
        let r: f64 = self.rng.lock().unwrap().gen();

        let mut cumulative = 0.0;
        for (i, weight) in self.weights.iter().enumerate() {
            cumulative += weight;
            if r <= cumulative {
                debug!(index = i, weight = *weight, "selected ensemble model");
                return i;
            }
        }
        self.clients.len() - 1
    }

    fn select_client(&self) -> Arc<dyn LlmClient> {
        Arc::clone(&self.clients[self.select_index()])
    }

    /// Generate with one weighted-selected client.
    pub async fn generate(&self, prompt: &str) -> Result<LlmResponse, EvolveError> {
        let client = self.select_client();
        let mut response = client.generate(prompt).await?;
        response.model = format!("ensemble[{}]", response.model);
        Ok(response)
    }

    /// Generate with an explicit system message and conversation.
    pub async fn generate_with_system(
        &self,
        system: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, EvolveError> {
        let client = self.select_client();
        let mut response = client.generate_with_system(system, messages).await?;
        response.model = format!("ensemble[{}]", response.model);
        Ok(response)
    }

    /// `n` concurrent generations, each independently selecting a client.
    /// Fails with the first error after all calls settle.
    pub async fn generate_multiple(
        &self,
        prompt: &str,
        n: usize,
    ) -> Result<Vec<LlmResponse>, EvolveError> {
        let results = join_all((0..n).map(|_| self.generate(prompt))).await;
        results.into_iter().collect()
    }

    /// One concurrent generation per prompt.
    pub async fn parallel_generate(
        &self,
        prompts: &[String],
    ) -> Result<Vec<LlmResponse>, EvolveError> {
        let results = join_all(prompts.iter().map(|p| self.generate(p))).await;
        results.into_iter().collect()
    }

    /// Fan out to every client. Each slot carries its own outcome so
    /// partial results survive individual failures.
    pub async fn generate_all(
        &self,
        system: &str,
        messages: &[LlmMessage],
    ) -> Vec<Result<LlmResponse, EvolveError>> {
        join_all(
            self.clients
                .iter()
                .map(|client| client.generate_with_system(system, messages)),
        )
        .await
    }

    pub fn stats(&self) -> EnsembleStats {
        EnsembleStats {
            num_clients: self.clients.len(),
            total_weight: self.total_weight,
            weights: self.weights.clone(),
        }
    }
}
