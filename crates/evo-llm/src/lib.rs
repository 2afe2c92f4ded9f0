//! # evo-llm
//!
//! Oracle access: an OpenAI-compatible chat-completions client with
//! retries and reasoning-model handling, and an ensemble that routes
//! requests across backends by weighted random choice.

pub mod ensemble;
pub mod openai;

pub use ensemble::{Ensemble, EnsembleStats};
pub use openai::{is_reasoning_model, LlmClient, OpenAiClient};
