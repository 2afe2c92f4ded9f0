//! Prompt assembly and oracle-response parsing.
//!
//! The user prompt stacks the parent program, truncated inspiration
//! programs, and the configured evolution instruction. Responses come
//! back as markdown; the code lives in fenced blocks.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use evo_core::config::PromptConfig;
use evo_core::{EvolveError, Program};

/// Inspiration programs longer than this are cut in the prompt.
const INSPIRATION_CODE_LIMIT: usize = 1000;

/// Prompt content for one iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptData {
    pub system: String,
    pub user: String,
    pub context: String,
}

/// Build the evolution prompt for a parent and its inspirations.
pub fn build_prompt(
    config: &PromptConfig,
    parent: &Program,
    inspirations: &[Arc<Program>],
    iteration: u64,
) -> PromptData {
    let system = if config.system_message.is_empty() {
        evo_core::config::DEFAULT_SYSTEM_MESSAGE.to_string()
    } else {
        config.system_message.clone()
    };

    PromptData {
        system,
        user: build_user_prompt(config, parent, inspirations),
        context: format!("Iteration: {iteration}, Generation: {}", parent.generation),
    }
}

fn build_user_prompt(
    config: &PromptConfig,
    parent: &Program,
    inspirations: &[Arc<Program>],
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Current code to improve (Generation {}, Score: {:.3}):\n\n",
        parent.generation, parent.score
    ));
    prompt.push_str("```\n");
    prompt.push_str(&parent.code);
    prompt.push_str("\n```\n\n");

    if !inspirations.is_empty() {
        prompt.push_str("Here are some high-scoring similar programs for inspiration:\n\n");
        for (i, inspiration) in inspirations.iter().enumerate() {
            prompt.push_str(&format!(
                "Example {} (Score: {:.3}):\n",
                i + 1,
                inspiration.score
            ));
            prompt.push_str("```\n");
            prompt.push_str(&truncate_code(&inspiration.code, INSPIRATION_CODE_LIMIT));
            prompt.push_str("\n```\n\n");
        }
    }

    if !config.evolution_prompt.is_empty() {
        prompt.push_str("Instructions:\n");
        prompt.push_str(&config.evolution_prompt);
    } else {
        prompt.push_str("Please improve this code to achieve better performance. ");
        prompt.push_str("Focus on algorithmic improvements, bug fixes, and optimizations. ");
    }

    prompt
}

fn truncate_code(code: &str, limit: usize) -> String {
    if code.len() <= limit {
        return code.to_string();
    }
    let mut end = limit;
    while end > 0 && !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &code[..end])
}

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"```(?:[A-Za-z0-9_+-]+)?\n?([^`]*)```").unwrap())
}

/// Extract fenced code blocks, discarding empty ones.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    code_block_pattern()
        .captures_iter(text)
        .filter_map(|captures| {
            let code = captures.get(1)?.as_str().trim();
            (!code.is_empty()).then(|| code.to_string())
        })
        .collect()
}

/// Full-rewrite parsing: the largest fenced block is the new program.
pub fn parse_full_rewrite(response: &str) -> Option<String> {
    extract_code_blocks(response)
        .into_iter()
        .max_by_key(String::len)
}

/// Diff-mode parsing: the first fenced block becomes the new program.
/// Returns the code and a change summary.
pub fn apply_diffs(response: &str) -> Result<(String, String), EvolveError> {
    let blocks = extract_code_blocks(response);
    if blocks.is_empty() {
        return Err(EvolveError::OracleParse(
            "no code blocks found in response".to_string(),
        ));
    }

    let changes = format!("Applied {} diff(s)", blocks.len());
    Ok((blocks.into_iter().next().unwrap(), changes))
}
