//! Claude Code CLI runtime adapter.
//!
//! Spawns the `claude` binary in stream-json mode, feeds the user prompt via
//! stdin, and consumes stdout line by line. Text blocks accumulate into the
//! output (and stream through the `on_output` callback); the final `result`
//! event supplies the canonical output text and token usage. Lines that are
//! not valid stream-json are kept as plain text rather than dropped.

use super::stream::{ContentBlock, StreamEvent, parse_stream_line};
use super::{
    AgentOutcome, ExecuteRequest, Runtime, RuntimeCapabilities, RuntimeMetadata,
};
use crate::abort::{AbortController, kill_with_escalation};
use crate::config::{PermissionMode, ValidationReport};
use crate::errors::StageRunError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable overriding the CLI command name.
pub const CLAUDE_CMD_ENV: &str = "CLAUDE_CMD";

pub struct ClaudeCliRuntime {
    command: String,
}

impl ClaudeCliRuntime {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Command name from `CLAUDE_CMD`, defaulting to `claude`.
    pub fn from_env() -> Self {
        Self::new(std::env::var(CLAUDE_CMD_ENV).unwrap_or_else(|_| "claude".to_string()))
    }

    fn flags(&self, request: &ExecuteRequest) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        match request.options.permission_mode {
            PermissionMode::Default => {}
            PermissionMode::AcceptEdits => {
                flags.push("--permission-mode".to_string());
                flags.push("acceptEdits".to_string());
            }
            PermissionMode::BypassPermissions => {
                flags.push("--dangerously-skip-permissions".to_string());
            }
            PermissionMode::Plan => {
                flags.push("--permission-mode".to_string());
                flags.push("plan".to_string());
            }
        }
        if let Some(ref model) = request.options.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if !request.system_prompt.is_empty() {
            flags.push("--append-system-prompt".to_string());
            flags.push(request.system_prompt.clone());
        }
        flags
    }
}

#[async_trait]
impl Runtime for ClaudeCliRuntime {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        abort: Option<&AbortController>,
    ) -> Result<AgentOutcome> {
        let start = Instant::now();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(request.options.timeout_secs);

        let mut cmd = Command::new(&self.command);
        for flag in self.flags(&request) {
            cmd.arg(flag);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&request.options.cwd)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StageRunError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        if let Some(controller) = abort {
            controller.register_child(pid);
        }
        debug!(pid, command = %self.command, "spawned agent runtime");

        // Prompt goes in via stdin; dropping the handle closes the pipe.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.user_prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to take agent stdout")?;
        let mut reader = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut usage = None;
        let mut num_turns = None;

        loop {
            let next_line = tokio::select! {
                line = reader.next_line() => line.context("Failed to read agent stdout")?,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(pid, "agent timed out, escalating kill");
                    kill_with_escalation(pid).await;
                    if let Some(controller) = abort {
                        controller.unregister_child(pid);
                    }
                    return Err(StageRunError::Timeout {
                        timeout_secs: request.options.timeout_secs,
                    }
                    .into());
                }
                _ = wait_aborted(abort) => {
                    // The controller has already killed the child.
                    return Err(crate::errors::AbortedError.into());
                }
            };

            let Some(line) = next_line else { break };
            if line.is_empty() {
                continue;
            }

            match parse_stream_line(&line) {
                Ok(StreamEvent::Assistant { message, .. }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                if let Some(ref callback) = request.options.on_output {
                                    callback(&text);
                                }
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            ContentBlock::ToolUse { name, .. } => {
                                debug!(pid, tool = %name, "agent tool use");
                            }
                            ContentBlock::Thinking { .. } => {}
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error: err,
                    usage: event_usage,
                    num_turns: turns,
                    ..
                }) => {
                    final_result = result;
                    is_error = err;
                    usage = event_usage;
                    num_turns = turns;
                }
                Ok(StreamEvent::User {}) | Ok(StreamEvent::System { .. }) => {}
                Err(raw) => {
                    // Tolerate non-JSON interleaving.
                    accumulated.push_str(raw);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for agent exit")?;
        if let Some(controller) = abort {
            controller.unregister_child(pid);
        }

        let text_output = final_result.unwrap_or(accumulated);

        if is_error {
            return Err(StageRunError::RuntimeReported {
                message: first_line(&text_output).to_string(),
            }
            .into());
        }
        if !status.success() {
            return Err(StageRunError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
            }
            .into());
        }

        Ok(AgentOutcome {
            text_output,
            extracted_data: None,
            token_usage: usage.map(|u| u.to_token_usage(num_turns)),
            num_turns,
            metadata: Some(RuntimeMetadata {
                runtime: self.name().to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
            }),
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: true,
            supports_mcp: true,
            supports_context_reduction: true,
            available_models: vec![
                "sonnet".to_string(),
                "opus".to_string(),
                "haiku".to_string(),
            ],
            permission_modes: vec![
                PermissionMode::Default,
                PermissionMode::AcceptEdits,
                PermissionMode::BypassPermissions,
                PermissionMode::Plan,
            ],
        }
    }

    fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        if !command_on_path(&self.command) {
            report.warning(format!(
                "'{}' not found on PATH; stages using the claude-cli runtime will fail",
                self.command
            ));
        }
        if std::env::var("ANTHROPIC_API_KEY").is_err()
            && std::env::var("CLAUDE_API_KEY").is_err()
        {
            report.warning(
                "neither ANTHROPIC_API_KEY nor CLAUDE_API_KEY is set; the CLI will rely on its own login",
            );
        }
        report
    }
}

/// Pending-forever when no controller is attached, so the select arm never fires.
async fn wait_aborted(abort: Option<&AbortController>) {
    match abort {
        Some(controller) => controller.wait_aborted().await,
        None => std::future::pending().await,
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

fn command_on_path(command: &str) -> bool {
    if command.contains(std::path::MAIN_SEPARATOR) {
        return std::path::Path::new(command).exists();
    }
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(command).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecuteOptions;
    use std::path::PathBuf;

    fn request(permission_mode: PermissionMode, model: Option<&str>) -> ExecuteRequest {
        let mut options = ExecuteOptions::new(PathBuf::from("/repo"), 120);
        options.permission_mode = permission_mode;
        options.model = model.map(String::from);
        ExecuteRequest {
            system_prompt: "You are a reviewer".to_string(),
            user_prompt: "Review this".to_string(),
            options,
        }
    }

    #[test]
    fn flags_include_stream_json() {
        let runtime = ClaudeCliRuntime::new("claude");
        let flags = runtime.flags(&request(PermissionMode::Default, None));
        assert!(flags.contains(&"--print".to_string()));
        assert!(flags.contains(&"stream-json".to_string()));
        assert!(flags.contains(&"--append-system-prompt".to_string()));
    }

    #[test]
    fn bypass_permissions_maps_to_skip_flag() {
        let runtime = ClaudeCliRuntime::new("claude");
        let flags = runtime.flags(&request(PermissionMode::BypassPermissions, None));
        assert!(flags.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn accept_edits_uses_permission_mode_flag() {
        let runtime = ClaudeCliRuntime::new("claude");
        let flags = runtime.flags(&request(PermissionMode::AcceptEdits, None));
        let pos = flags.iter().position(|f| f == "--permission-mode").unwrap();
        assert_eq!(flags[pos + 1], "acceptEdits");
    }

    #[test]
    fn model_flag_is_forwarded() {
        let runtime = ClaudeCliRuntime::new("claude");
        let flags = runtime.flags(&request(PermissionMode::Default, Some("opus")));
        let pos = flags.iter().position(|f| f == "--model").unwrap();
        assert_eq!(flags[pos + 1], "opus");
    }

    #[test]
    fn validate_warns_for_missing_binary() {
        let runtime = ClaudeCliRuntime::new("definitely-not-a-real-binary-name");
        let report = runtime.validate();
        assert!(report.valid());
        assert!(report.warnings.iter().any(|w| w.contains("not found on PATH")));
    }

    #[tokio::test]
    async fn spawn_failure_is_stage_run_error() {
        let runtime = ClaudeCliRuntime::new("/nonexistent/claude-bin");
        let mut req = request(PermissionMode::Default, None);
        req.options.cwd = std::env::temp_dir();
        let err = runtime.execute(req, None).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
