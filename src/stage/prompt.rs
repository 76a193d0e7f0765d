//! Prompt assembly for stage execution.
//!
//! The agent markdown becomes the system prompt; the user prompt is built
//! here from the stage's inputs, the outputs of previously completed stages,
//! and a closing task instruction. `{{inputs.K}}` and
//! `{{stages.X.outputs.K}}` placeholders interpolate from the stage config
//! and accumulated state; unknown placeholders are left literal.

use crate::config::StageConfig;
use crate::state::PipelineState;
use regex::Regex;
use std::sync::OnceLock;

/// Longest per-stage output excerpt included in the previous-stages section.
const OUTPUT_EXCERPT_CHARS: usize = 2000;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"))
}

/// Replace `{{inputs.K}}` and `{{stages.X.outputs.K}}` placeholders.
pub fn interpolate(text: &str, stage: &StageConfig, state: &PipelineState) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            resolve_placeholder(path, stage, state)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn resolve_placeholder(path: &str, stage: &StageConfig, state: &PipelineState) -> Option<String> {
    let parts: Vec<&str> = path.split('.').collect();
    match parts.as_slice() {
        ["inputs", key] => stage.inputs.get(*key).cloned(),
        ["stages", name, "outputs", key] => {
            let execution = state.stage(name)?;
            let data = execution.extracted_data.as_ref()?;
            Some(render_value(data.get(*key)?))
        }
        ["stages", name, "status"] => {
            Some(state.stage(name)?.status.as_str().to_string())
        }
        _ => None,
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Summaries of every successful stage so far, oldest first.
pub fn previous_stages_section(state: &PipelineState) -> String {
    let successful = state.successful_stages();
    if successful.is_empty() {
        return String::new();
    }

    let mut section = String::from("## Previous stages\n");
    for execution in successful {
        section.push_str(&format!("\n### {}\n", execution.stage_name));
        if let Some(ref data) = execution.extracted_data {
            for (key, value) in data {
                section.push_str(&format!("- {key}: {}\n", render_value(value)));
            }
        }
        if let Some(ref output) = execution.agent_output {
            section.push_str(&excerpt(output, OUTPUT_EXCERPT_CHARS));
            section.push('\n');
        }
    }
    section
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.trim_end().to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}\n[... output truncated]", truncated.trim_end())
}

/// Build the full user prompt for one stage.
pub fn build_user_prompt(stage: &StageConfig, state: &PipelineState) -> String {
    let mut prompt = String::new();

    if !stage.inputs.is_empty() {
        prompt.push_str("## Inputs\n");
        for (key, value) in &stage.inputs {
            let rendered = interpolate(value, stage, state);
            prompt.push_str(&format!("- {key}: {rendered}\n"));
        }
        prompt.push('\n');
    }

    let previous = previous_stages_section(state);
    if !previous.is_empty() {
        prompt.push_str(&previous);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "## Task\nCarry out your instructions as stage '{}' of pipeline '{}'. \
         Work inside the current repository; your file changes will be committed automatically.",
        stage.name, state.pipeline_config.name
    ));

    if !stage.output_keys.is_empty() {
        prompt.push_str(&format!(
            "\n\nWhen finished, emit a fenced ```json block containing the keys: {}.",
            stage.output_keys.join(", ")
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::state::{StageExecution, StageStatus, TriggerInfo};

    fn state_with_success(name: &str, output: &str, outputs: &[(&str, &str)]) -> PipelineState {
        let config = PipelineConfig::new("demo", vec![StageConfig::new(name, "a.md")]);
        let mut state =
            PipelineState::new("run".to_string(), config, TriggerInfo::manual());
        let mut execution = StageExecution::running(name, 0);
        execution.agent_output = Some(output.to_string());
        if !outputs.is_empty() {
            execution.extracted_data = Some(
                outputs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                    .collect(),
            );
        }
        execution.set_status(StageStatus::Success);
        state.stages.push(execution);
        state
    }

    #[test]
    fn interpolates_inputs() {
        let mut stage = StageConfig::new("b", "b.md");
        stage
            .inputs
            .insert("target".to_string(), "src/lib.rs".to_string());
        let state = state_with_success("a", "done", &[]);

        let text = interpolate("Fix {{inputs.target}} now", &stage, &state);
        assert_eq!(text, "Fix src/lib.rs now");
    }

    #[test]
    fn interpolates_stage_outputs() {
        let stage = StageConfig::new("b", "b.md");
        let state = state_with_success("a", "done", &[("verdict", "approve")]);

        let text = interpolate("Decision was {{stages.a.outputs.verdict}}", &stage, &state);
        assert_eq!(text, "Decision was approve");
    }

    #[test]
    fn unknown_placeholder_stays_literal() {
        let stage = StageConfig::new("b", "b.md");
        let state = state_with_success("a", "done", &[]);

        let text = interpolate("keep {{stages.ghost.outputs.x}} as-is", &stage, &state);
        assert_eq!(text, "keep {{stages.ghost.outputs.x}} as-is");
    }

    #[test]
    fn user_prompt_includes_previous_stages() {
        let stage = StageConfig::new("b", "b.md");
        let state = state_with_success("a", "analyzed 3 files", &[("count", "3")]);

        let prompt = build_user_prompt(&stage, &state);
        assert!(prompt.contains("## Previous stages"));
        assert!(prompt.contains("### a"));
        assert!(prompt.contains("analyzed 3 files"));
        assert!(prompt.contains("count: 3"));
        assert!(prompt.contains("## Task"));
    }

    #[test]
    fn user_prompt_omits_previous_section_when_nothing_succeeded() {
        let stage = StageConfig::new("b", "b.md");
        let config = PipelineConfig::new("demo", vec![stage.clone()]);
        let state = PipelineState::new("run".to_string(), config, TriggerInfo::manual());

        let prompt = build_user_prompt(&stage, &state);
        assert!(!prompt.contains("## Previous stages"));
    }

    #[test]
    fn user_prompt_requests_output_keys() {
        let mut stage = StageConfig::new("b", "b.md");
        stage.output_keys = vec!["verdict".to_string(), "notes".to_string()];
        let state = state_with_success("a", "x", &[]);

        let prompt = build_user_prompt(&stage, &state);
        assert!(prompt.contains("verdict, notes"));
    }

    #[test]
    fn long_outputs_are_truncated() {
        let long = "x".repeat(5000);
        let state = state_with_success("a", &long, &[]);
        let section = previous_stages_section(&state);
        assert!(section.contains("[... output truncated]"));
        assert!(section.len() < 4000);
    }
}
