//! Instruction template resolution and interpolation.
//!
//! Templates resolve through a three-step chain: an explicitly configured
//! path, then the repo default under `.agent-pipeline/instructions/`, then a
//! built-in constant. `{{variable}}` placeholders interpolate from a context
//! map; unknown keys stay literal so templates can carry placeholders meant
//! for the agent itself.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Built-in handover instructions appended to stage system prompts.
const BUILTIN_HANDOVER: &str = "\
## Handover workspace

A shared handover directory exists at `{{handoverDir}}`.

- Read `HANDOVER.md` first for the current state left by earlier stages.
- Append significant findings or decisions to `LOG.md`; never rewrite it.
- Your full output will be saved under `stages/{{stageName}}/output.md`.

Keep `HANDOVER.md` accurate for whoever runs after you.
";

/// Built-in loop-agent instructions.
const BUILTIN_LOOP: &str = "\
## Pipeline loop

You are the loop agent for pipeline '{{pipelineName}}', iteration \
{{currentIteration}} of {{maxIterations}}.

The pipeline definition that just ran:

```yaml
{{pipelineYaml}}
```

If follow-up work remains, write one or more new pipeline YAML files into \
`{{pendingDir}}`. Each file you create will be executed as a later \
iteration. If nothing remains to do, write no files and say so.
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Handover,
    Loop,
}

impl InstructionKind {
    fn default_file(&self) -> &'static str {
        match self {
            Self::Handover => "handover.md",
            Self::Loop => "loop.md",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Self::Handover => BUILTIN_HANDOVER,
            Self::Loop => BUILTIN_LOOP,
        }
    }
}

pub struct InstructionLoader {
    repo_root: PathBuf,
    custom_path: Option<PathBuf>,
}

impl InstructionLoader {
    pub fn new(repo_root: &Path, custom_path: Option<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            custom_path,
        }
    }

    /// Resolve a template: custom path → repo default → built-in constant.
    pub fn load(&self, kind: InstructionKind) -> String {
        if let Some(ref custom) = self.custom_path {
            let path = if custom.is_absolute() {
                custom.clone()
            } else {
                self.repo_root.join(custom)
            };
            if let Ok(text) = std::fs::read_to_string(&path) {
                debug!(path = %path.display(), "loaded custom instruction template");
                return text;
            }
        }

        let default_path = self
            .repo_root
            .join(".agent-pipeline")
            .join("instructions")
            .join(kind.default_file());
        if let Ok(text) = std::fs::read_to_string(&default_path) {
            debug!(path = %default_path.display(), "loaded repo instruction template");
            return text;
        }

        kind.builtin().to_string()
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid regex"))
}

/// Interpolate `{{variable}}` placeholders; unknown keys stay literal.
pub fn interpolate(template: &str, context: &HashMap<&str, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            context
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn builtin_is_last_resort() {
        let dir = tempdir().unwrap();
        let loader = InstructionLoader::new(dir.path(), None);
        let text = loader.load(InstructionKind::Handover);
        assert!(text.contains("{{handoverDir}}"));
    }

    #[test]
    fn repo_default_beats_builtin() {
        let dir = tempdir().unwrap();
        let instructions = dir.path().join(".agent-pipeline/instructions");
        fs::create_dir_all(&instructions).unwrap();
        fs::write(instructions.join("handover.md"), "repo handover rules").unwrap();

        let loader = InstructionLoader::new(dir.path(), None);
        assert_eq!(loader.load(InstructionKind::Handover), "repo handover rules");
    }

    #[test]
    fn custom_path_beats_repo_default() {
        let dir = tempdir().unwrap();
        let instructions = dir.path().join(".agent-pipeline/instructions");
        fs::create_dir_all(&instructions).unwrap();
        fs::write(instructions.join("loop.md"), "repo loop rules").unwrap();
        fs::write(dir.path().join("custom-loop.md"), "custom loop rules").unwrap();

        let loader =
            InstructionLoader::new(dir.path(), Some(PathBuf::from("custom-loop.md")));
        assert_eq!(loader.load(InstructionKind::Loop), "custom loop rules");
    }

    #[test]
    fn missing_custom_path_falls_through() {
        let dir = tempdir().unwrap();
        let loader =
            InstructionLoader::new(dir.path(), Some(PathBuf::from("nope.md")));
        let text = loader.load(InstructionKind::Loop);
        assert!(text.contains("{{pendingDir}}"));
    }

    #[test]
    fn interpolation_replaces_known_keys() {
        let mut context = HashMap::new();
        context.insert("stageName", "review".to_string());
        context.insert("handoverDir", "/tmp/h".to_string());

        let text = interpolate("dir={{handoverDir}} stage={{ stageName }}", &context);
        assert_eq!(text, "dir=/tmp/h stage=review");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let context = HashMap::new();
        let text = interpolate("keep {{unknownKey}} intact", &context);
        assert_eq!(text, "keep {{unknownKey}} intact");
    }
}
