//! Agent runtime abstraction.
//!
//! A `Runtime` executes one agent invocation — system prompt plus user
//! prompt — inside the execution repository and returns the text output,
//! any structured data, and token usage. The engine never talks to an LLM
//! provider directly; concrete adapters (the bundled Claude CLI adapter, SDK
//! or Codex adapters supplied externally) implement this trait and register
//! under a type name.

mod claude_cli;
mod registry;
mod stream;
pub mod testing;

pub use claude_cli::ClaudeCliRuntime;
pub use registry::RuntimeRegistry;
pub use stream::{ContentBlock, StreamEvent, UsageBlock, parse_stream_line};

use crate::abort::AbortController;
use crate::config::{PermissionMode, ValidationReport};
use crate::state::TokenUsage;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Streaming output callback: receives each text chunk as it arrives.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for one agent execution.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    /// Hard wall-clock deadline; the adapter kills the agent past it.
    pub timeout_secs: u64,
    pub output_keys: Vec<String>,
    /// Working directory for the agent — always the execution repo path.
    pub cwd: PathBuf,
    pub on_output: Option<OutputCallback>,
    /// Adapter-specific passthrough options.
    pub runtime_options: serde_json::Map<String, serde_json::Value>,
}

impl ExecuteOptions {
    pub fn new(cwd: PathBuf, timeout_secs: u64) -> Self {
        Self {
            permission_mode: PermissionMode::Default,
            model: None,
            timeout_secs,
            output_keys: Vec::new(),
            cwd,
            on_output: None,
            runtime_options: serde_json::Map::new(),
        }
    }
}

/// One agent invocation.
#[derive(Clone)]
pub struct ExecuteRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: ExecuteOptions,
}

/// Metadata about how an execution ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMetadata {
    pub runtime: String,
    pub duration_ms: u64,
}

/// What an agent execution produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub text_output: String,
    /// Structured outputs the adapter extracted itself, if any. The stage
    /// executor falls back to its own extraction when this is empty.
    pub extracted_data: Option<BTreeMap<String, serde_json::Value>>,
    pub token_usage: Option<TokenUsage>,
    pub num_turns: Option<u64>,
    pub metadata: Option<RuntimeMetadata>,
}

/// Capability advertisement, used for validation and the plan command.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCapabilities {
    pub supports_streaming: bool,
    pub supports_token_tracking: bool,
    pub supports_mcp: bool,
    pub supports_context_reduction: bool,
    pub available_models: Vec<String>,
    pub permission_modes: Vec<PermissionMode>,
}

/// An adapter that can execute agents.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Registry name, e.g. `claude-cli`.
    fn name(&self) -> &str;

    /// Execute one agent invocation. Implementations must register spawned
    /// children with the abort controller and honour the timeout with
    /// SIGTERM → SIGKILL escalation.
    async fn execute(
        &self,
        request: ExecuteRequest,
        abort: Option<&AbortController>,
    ) -> Result<AgentOutcome>;

    fn capabilities(&self) -> RuntimeCapabilities;

    /// Environment validation (binary installed, API key present). Problems
    /// surface as warnings at load time and become stage failures at
    /// execution time.
    fn validate(&self) -> ValidationReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_options_defaults() {
        let options = ExecuteOptions::new(PathBuf::from("/repo"), 120);
        assert_eq!(options.permission_mode, PermissionMode::Default);
        assert_eq!(options.timeout_secs, 120);
        assert!(options.output_keys.is_empty());
        assert!(options.on_output.is_none());
    }

    #[test]
    fn outcome_default_is_empty() {
        let outcome = AgentOutcome::default();
        assert!(outcome.text_output.is_empty());
        assert!(outcome.token_usage.is_none());
    }
}
