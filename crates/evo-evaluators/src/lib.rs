//! # evo-evaluators
//!
//! Candidate scoring. Programs run through an ordered cascade of
//! threshold-gated stages (or a single direct evaluation when no cascade
//! is configured), executed by an external evaluator process under
//! per-stage timeouts. A bounded worker pool caps concurrent evaluations.

pub mod cascade;
pub mod evaluator;
pub mod worker_pool;

pub use cascade::{CascadeEvaluator, CascadeStage};
pub use evaluator::Evaluator;
pub use worker_pool::{JobHandler, WorkerPool};
