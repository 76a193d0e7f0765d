//! YAML loading and load-time validation for pipeline definitions.

use super::{
    INLINE_AGENT, PipelineConfig, STAGE_TIMEOUT_SOFT_CAP_SECS, ValidationReport,
};
use crate::condition;
use crate::errors::PipelineError;
use std::path::Path;
use tracing::debug;

/// Load and validate a pipeline definition from a YAML file.
///
/// Validation errors (not warnings) are fatal at load time.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let config = parse_pipeline_yaml(&text).map_err(|message| PipelineError::ConfigLoad {
        path: path.to_path_buf(),
        message,
    })?;
    debug!(pipeline = %config.name, stages = config.stages.len(), "loaded pipeline config");
    Ok(config)
}

/// Parse a pipeline definition from YAML text and run semantic validation.
pub fn parse_pipeline_yaml(text: &str) -> Result<PipelineConfig, String> {
    let config: PipelineConfig =
        serde_yaml::from_str(text).map_err(|e| format!("yaml: {e}"))?;
    let report = validate_config(&config);
    if !report.valid() {
        return Err(format!("invalid config: {}", report.errors.join("; ")));
    }
    Ok(config)
}

/// Semantic checks that do not require the dependency graph.
///
/// Graph-shape validation (duplicates, cycles, unknown dependencies) lives in
/// the DAG planner; this covers everything a single stage can get wrong on
/// its own.
pub fn validate_config(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.name.trim().is_empty() {
        report.error("pipeline name must not be empty");
    }
    if config.stages.is_empty() {
        report.error("pipeline has no stages");
    }

    for stage in &config.stages {
        if stage.name.trim().is_empty() {
            report.error("stage with empty name");
        }
        if stage.agent.trim().is_empty() {
            report.error(format!("stage '{}' has an empty agent path", stage.name));
        }
        if stage.agent == INLINE_AGENT && stage.prompt.is_none() {
            report.error(format!(
                "stage '{}' uses the inline agent sentinel but has no prompt",
                stage.name
            ));
        }
        if stage.timeout == 0 {
            report.error(format!("stage '{}' has a zero timeout", stage.name));
        }
        if stage.timeout > STAGE_TIMEOUT_SOFT_CAP_SECS {
            report.warning(format!(
                "stage '{}' timeout {}s exceeds the {}s soft cap",
                stage.name, stage.timeout, STAGE_TIMEOUT_SOFT_CAP_SECS
            ));
        }
        if let Some(ref source) = stage.condition
            && let Err(e) = condition::parse(source)
        {
            report.error(format!(
                "stage '{}' has a malformed condition: {e}",
                stage.name
            ));
        }
        if let Some(ref retry) = stage.retry
            && retry.max_attempts == 0
        {
            report.error(format!(
                "stage '{}' retry.maxAttempts must be at least 1",
                stage.name
            ));
        }
    }

    if let Some(ref looping) = config.looping
        && looping.enabled
        && looping.max_iterations == 0
    {
        report.error("looping.maxIterations must be at least 1");
    }

    report
}
