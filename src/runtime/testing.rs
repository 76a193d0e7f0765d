//! Scripted runtime double for tests.
//!
//! Compiled unconditionally so both unit tests and the integration suite can
//! script agent behaviour without a real CLI on PATH.

use super::{AgentOutcome, ExecuteRequest, Runtime, RuntimeCapabilities};
use crate::abort::AbortController;
use crate::config::ValidationReport;
use crate::state::TokenUsage;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Succeed with the given text output.
    Succeed(String),
    /// Fail with the given error message.
    Fail(String),
    /// Sleep (abort-aware), then succeed with the given text.
    DelayThenSucceed(Duration, String),
}

/// A record of one `execute` call, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub user_prompt: String,
    pub cwd: std::path::PathBuf,
    pub timeout_secs: u64,
}

pub struct MockRuntime {
    name: String,
    script: Mutex<VecDeque<MockStep>>,
    /// Used when the script runs dry.
    fallback: MockStep,
    calls: Mutex<Vec<RecordedCall>>,
    usage: Option<TokenUsage>,
}

impl MockRuntime {
    pub fn new(fallback: MockStep) -> Self {
        Self {
            name: "mock".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            usage: Some(TokenUsage {
                actual_input: Some(100),
                output: Some(50),
                ..Default::default()
            }),
        }
    }

    /// A runtime that always succeeds with `text`.
    pub fn succeeding(text: &str) -> Self {
        Self::new(MockStep::Succeed(text.to_string()))
    }

    /// A runtime that always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self::new(MockStep::Fail(message.to_string()))
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn without_usage(mut self) -> Self {
        self.usage = None;
        self
    }

    /// Queue a scripted step ahead of the fallback.
    pub fn push_step(&self, step: MockStep) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Convenience: fail `n` times with `message`, then fall back.
    pub fn fail_times(&self, n: usize, message: &str) {
        for _ in 0..n {
            self.push_step(MockStep::Fail(message.to_string()));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        abort: Option<&AbortController>,
    ) -> Result<AgentOutcome> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: request.system_prompt.clone(),
            user_prompt: request.user_prompt.clone(),
            cwd: request.options.cwd.clone(),
            timeout_secs: request.options.timeout_secs,
        });

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let text = match step {
            MockStep::Fail(message) => return Err(anyhow!(message)),
            MockStep::Succeed(text) => text,
            MockStep::DelayThenSucceed(delay, text) => {
                match abort {
                    Some(controller) => controller.sleep(delay).await?,
                    None => tokio::time::sleep(delay).await,
                }
                text
            }
        };

        if let Some(ref callback) = request.options.on_output {
            callback(&text);
        }

        Ok(AgentOutcome {
            text_output: text,
            extracted_data: None,
            token_usage: self.usage,
            num_turns: Some(1),
            metadata: None,
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: true,
            ..Default::default()
        }
    }

    fn validate(&self) -> ValidationReport {
        ValidationReport::default()
    }
}
