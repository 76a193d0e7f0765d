//! Process-wide runtime registry.
//!
//! Initialised once at startup and read-only afterwards; lookups resolve the
//! stage-level override, then the pipeline-level selection, then the system
//! default.

use super::{ClaudeCliRuntime, Runtime};
use crate::errors::PipelineError;
use std::collections::HashMap;
use std::sync::Arc;

/// The runtime used when neither stage nor pipeline selects one.
pub const DEFAULT_RUNTIME: &str = "claude-cli";

pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
    default_type: String,
}

impl RuntimeRegistry {
    pub fn empty() -> Self {
        Self {
            runtimes: HashMap::new(),
            default_type: DEFAULT_RUNTIME.to_string(),
        }
    }

    /// Registry with the bundled adapters registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ClaudeCliRuntime::from_env()));
        registry
    }

    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.name().to_string(), runtime);
    }

    pub fn set_default(&mut self, name: &str) {
        self.default_type = name.to_string();
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runtimes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up by type name; `None` resolves to the default type.
    pub fn resolve(&self, requested: Option<&str>) -> Result<Arc<dyn Runtime>, PipelineError> {
        let name = requested.unwrap_or(&self.default_type);
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownRuntime {
                requested: name.to_string(),
                registered: self.names(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockRuntime;

    #[test]
    fn resolves_registered_runtime() {
        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(MockRuntime::succeeding("ok")));
        let runtime = registry.resolve(Some("mock")).unwrap();
        assert_eq!(runtime.name(), "mock");
    }

    #[test]
    fn none_resolves_default_type() {
        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(MockRuntime::succeeding("ok")));
        registry.set_default("mock");
        assert_eq!(registry.resolve(None).unwrap().name(), "mock");
    }

    #[test]
    fn unknown_runtime_lists_registered_types() {
        let mut registry = RuntimeRegistry::empty();
        registry.register(Arc::new(MockRuntime::succeeding("ok")));
        let err = match registry.resolve(Some("codex")) {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail for unknown runtime"),
        };
        let text = err.to_string();
        assert!(text.contains("codex"));
        assert!(text.contains("mock"));
    }

    #[test]
    fn with_defaults_registers_claude_cli() {
        let registry = RuntimeRegistry::with_defaults();
        assert!(registry.names().contains(&"claude-cli".to_string()));
    }
}
