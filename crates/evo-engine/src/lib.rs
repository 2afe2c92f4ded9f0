//! # evo-engine
//!
//! Ties the layers together: one generation cycle (sample → prompt →
//! oracle → parse → evaluate → insert) and the controller loop that
//! drives it to convergence.

pub mod controller;
pub mod prompt;
pub mod worker;

pub use controller::{EvolutionController, RunSummary};
pub use prompt::PromptData;
pub use worker::{IterationResult, IterationWorker};
