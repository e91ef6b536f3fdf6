use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_FOLLOWUP: &str = include_str!("default_prompts/followup.md");
const DEFAULT_INTERMEDIATE_ANSWER: &str = include_str!("default_prompts/intermediate-answer.md");
const DEFAULT_SUPPORTED_DOCS: &str = include_str!("default_prompts/supported-docs.md");
const DEFAULT_REFLECTION: &str = include_str!("default_prompts/reflection.md");
const DEFAULT_FINAL_ANSWER: &str = include_str!("default_prompts/final-answer.md");
const DEFAULT_ROUTE_COLLECTIONS: &str = include_str!("default_prompts/route-collections.md");
const DEFAULT_CLASSIFY_QUERY: &str = include_str!("default_prompts/classify-query.md");
const DEFAULT_SYNTHESIZE_ONLINE: &str = include_str!("default_prompts/synthesize-online.md");
const DEFAULT_SYNTHESIZE_HYBRID: &str = include_str!("default_prompts/synthesize-hybrid.md");
const DEFAULT_GENERATE_FILE: &str = include_str!("default_prompts/generate-file.md");
const DEFAULT_GENERATE_SYSTEM: &str = include_str!("default_prompts/generate-system.md");
const DEFAULT_FIX_FILE: &str = include_str!("default_prompts/fix-file.md");
const DEFAULT_FIX_SYSTEM: &str = include_str!("default_prompts/fix-system.md");

fn default_template(phase: &str) -> Option<&'static str> {
    match phase {
        "followup" => Some(DEFAULT_FOLLOWUP),
        "intermediate-answer" => Some(DEFAULT_INTERMEDIATE_ANSWER),
        "supported-docs" => Some(DEFAULT_SUPPORTED_DOCS),
        "reflection" => Some(DEFAULT_REFLECTION),
        "final-answer" => Some(DEFAULT_FINAL_ANSWER),
        "route-collections" => Some(DEFAULT_ROUTE_COLLECTIONS),
        "classify-query" => Some(DEFAULT_CLASSIFY_QUERY),
        "synthesize-online" => Some(DEFAULT_SYNTHESIZE_ONLINE),
        "synthesize-hybrid" => Some(DEFAULT_SYNTHESIZE_HYBRID),
        "generate-file" => Some(DEFAULT_GENERATE_FILE),
        "generate-system" => Some(DEFAULT_GENERATE_SYSTEM),
        "fix-file" => Some(DEFAULT_FIX_FILE),
        "fix-system" => Some(DEFAULT_FIX_SYSTEM),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load a prompt template for the given phase.
    /// User overrides in `override_dir` take precedence over defaults.
    pub fn load_template(&self, phase: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{phase}.md"));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }

        default_template(phase)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt phase: {phase}")))
    }

    /// Load a template and render it with the given variables.
    pub fn render_phase(&self, phase: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(phase)?;
        render_template(&template, vars)
    }
}

/// Render a template string using the `upon` template engine.
/// Supports `{{ var }}`, `{% if %}`, and `{% for %}` syntax.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
