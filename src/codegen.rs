use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::ErrorAnalysis;
use crate::analyzer::Issue;
use crate::llm::{ChatMessage, LlmClient, strip_reasoning};
use crate::project;
use crate::prompts::PromptEngine;
use crate::store::RetrievedItem;

/// How much of each raw analyzer excerpt goes into a fix prompt.
const RAW_EXCERPT_LIMIT: usize = 500;
/// How many raw excerpts a fix prompt carries at most.
const RAW_EXCERPT_COUNT: usize = 3;
/// How much of each reference solution goes into a fix prompt.
const REFERENCE_SNIPPET_LIMIT: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Source,
    Resource,
    Manifest,
}

/// One planned file of the target project.
#[derive(Debug, Clone)]
pub struct FilePlan {
    pub path: String,
    pub kind: FileKind,
    pub purpose: String,
    pub outline: String,
}

#[derive(Debug, Clone)]
pub struct ProjectPlan {
    pub files: Vec<FilePlan>,
}

impl ProjectPlan {
    /// Derive the file plan from the requirement. Deterministic: the
    /// entry page always, plus the string resource slot when the
    /// requirement asks for localized strings.
    pub fn for_requirement(requirement: &str) -> Self {
        let mut files = vec![FilePlan {
            path: project::ENTRY_PAGE.to_string(),
            kind: FileKind::Source,
            purpose: "Main entry page implementing the requirement".to_string(),
            outline: String::new(),
        }];

        let lowered = requirement.to_lowercase();
        if lowered.contains("string resource") || lowered.contains("localized") {
            files.push(FilePlan {
                path: project::STRING_RESOURCE.to_string(),
                kind: FileKind::Resource,
                purpose: "String resources referenced by the entry page".to_string(),
                outline: String::new(),
            });
        }

        Self { files }
    }
}

/// Everything a targeted fix round knows about one file.
pub struct FixRequest<'a> {
    pub path: &'a str,
    pub requirement: &'a str,
    pub current_code: &'a str,
    pub analyses: &'a [ErrorAnalysis],
    pub raw_issues: &'a [Issue],
    pub raw_excerpts: &'a [String],
    pub references: &'a [RetrievedItem],
}

/// Prompt-driven code generator: planned-file generation and targeted
/// error fixing, both funneled through the same output sanitation.
pub struct CodeGenerator<L> {
    llm: Arc<L>,
    prompts: Arc<PromptEngine>,
}

impl<L: LlmClient> CodeGenerator<L> {
    pub fn new(llm: Arc<L>, prompts: Arc<PromptEngine>) -> Self {
        Self { llm, prompts }
    }

    /// Generate one planned file. Returns the sanitized content and the
    /// token usage of the call.
    pub async fn generate_file(
        &self,
        plan: &FilePlan,
        requirement: &str,
        references: &[RetrievedItem],
    ) -> Result<(String, u64)> {
        let mut vars = HashMap::new();
        vars.insert("requirement".to_string(), requirement.to_string());
        vars.insert("file_path".to_string(), plan.path.clone());
        vars.insert("file_purpose".to_string(), plan.purpose.clone());
        vars.insert("file_outline".to_string(), plan.outline.clone());
        vars.insert(
            "references".to_string(),
            format_references(references, 5, 300),
        );

        let system = self.prompts.load_template("generate-system")?;
        let prompt = self.prompts.render_phase("generate-file", &vars)?;
        info!(path = %plan.path, "generating file");

        let reply = self
            .llm
            .chat(&[ChatMessage::system(system), ChatMessage::user(prompt)])
            .await?;

        let content = sanitize(&reply.content, plan.kind)?;
        Ok((content, reply.total_tokens))
    }

    /// Rewrite one file to fix its grouped errors. Classified analyses
    /// are preferred; raw issues plus bounded raw excerpts are the
    /// fallback.
    pub async fn fix_file(&self, request: &FixRequest<'_>) -> Result<(String, u64)> {
        let errors = if request.analyses.is_empty() {
            render_raw_errors(request.raw_issues, request.raw_excerpts)
        } else {
            render_analyses(request.analyses)
        };

        let mut vars = HashMap::new();
        vars.insert("requirement".to_string(), request.requirement.to_string());
        vars.insert("file_path".to_string(), request.path.to_string());
        vars.insert("current_code".to_string(), request.current_code.to_string());
        vars.insert("errors".to_string(), errors);
        vars.insert(
            "references".to_string(),
            format_references(request.references, 3, REFERENCE_SNIPPET_LIMIT),
        );

        let system = self.prompts.load_template("fix-system")?;
        let prompt = self.prompts.render_phase("fix-file", &vars)?;
        info!(path = %request.path, errors = request.analyses.len().max(request.raw_issues.len()), "fixing file");

        let reply = self
            .llm
            .chat(&[ChatMessage::system(system), ChatMessage::user(prompt)])
            .await?;

        let content = sanitize(&reply.content, FileKind::Source)?;
        Ok((content, reply.total_tokens))
    }
}

fn render_analyses(analyses: &[ErrorAnalysis]) -> String {
    analyses
        .iter()
        .map(|a| {
            format!(
                "Error {}:\n- original error: {}\n- root cause: {}\n- fix location: {}\n- fix description: {}",
                a.error_id, a.message, a.root_cause, a.location_hint, a.fix_description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_raw_errors(issues: &[Issue], raw_excerpts: &[String]) -> String {
    let mut out = issues
        .iter()
        .map(|i| {
            format!(
                "- severity: {}, message: {}, line: {}",
                i.severity.label(),
                i.message,
                i.line.map(|l| l.to_string()).unwrap_or_else(|| "N/A".to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    if !raw_excerpts.is_empty() {
        out.push_str("\n\nRaw analyzer output:\n");
        for (i, excerpt) in raw_excerpts.iter().take(RAW_EXCERPT_COUNT).enumerate() {
            let truncated: String = excerpt.chars().take(RAW_EXCERPT_LIMIT).collect();
            out.push_str(&format!("--- excerpt {} ---\n{truncated}\n", i + 1));
        }
    }
    out
}

fn format_references(references: &[RetrievedItem], count: usize, width: usize) -> String {
    if references.is_empty() {
        return "No reference material available.".to_string();
    }
    references
        .iter()
        .take(count)
        .map(|item| {
            let snippet: String = item.text.chars().take(width).collect();
            format!("- {snippet}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Output sanitation
// ---------------------------------------------------------------------------

/// Strip an LLM reply down to plain file content.
///
/// The pipeline is a fixed point: running it on its own output returns
/// the same text. There is deliberately no template fallback — when no
/// valid code survives, the caller gets [`Error::Generation`].
pub fn sanitize(raw: &str, kind: FileKind) -> Result<String> {
    let text = strip_reasoning(raw);
    let text = extract_fenced_block(text).unwrap_or_else(|| anchor_at_code_start(text));

    if kind != FileKind::Source {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::Generation("empty generated content".to_string()));
        }
        return Ok(trimmed.to_string());
    }

    let cleaned = scrub_lines(&text);
    if !has_code_structure(&cleaned) {
        return Err(Error::Generation(format!(
            "no valid code structure in generated output: {:?}",
            raw.chars().take(120).collect::<String>()
        )));
    }
    Ok(cleaned)
}

/// First fenced code block, if any (`arkts`/`typescript`/`ets`/`ts` or
/// untagged fences).
fn extract_fenced_block(text: &str) -> Option<String> {
    let tagged = Regex::new(r"(?s)```(?:arkts|typescript|ets|ts)?[ \t]*\n(.*?)\n```").unwrap();
    if let Some(caps) = tagged.captures(text) {
        return Some(caps[1].trim_matches('\n').to_string());
    }
    let bare = Regex::new(r"(?s)```(.*?)```").unwrap();
    bare.captures(text).map(|caps| caps[1].trim().to_string())
}

/// Without a fence, take everything from the first import statement or
/// component decorator onward.
fn anchor_at_code_start(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let anchor = lines.iter().position(|line| {
        let t = line.trim_start();
        t.starts_with("import ") || t.starts_with("@Entry") || t.starts_with("@Component")
    });
    match anchor {
        Some(idx) => lines[idx..].join("\n"),
        None => text.to_string(),
    }
}

fn non_ascii_script(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Drop documentation lines, replace non-ASCII-script string literals
/// with a placeholder, and drop non-ASCII-script comment lines.
fn scrub_lines(text: &str) -> String {
    let doc_markers = [
        Regex::new(r"^\d+\.").unwrap(),
        Regex::new(r"^#").unwrap(),
        Regex::new(r"^>").unwrap(),
        Regex::new(r"^```").unwrap(),
        Regex::new(r"^[一-鿿]+[：:]").unwrap(),
    ];
    let single_quoted = Regex::new(r"'[^']*[一-鿿][^']*'").unwrap();
    let double_quoted = Regex::new(r#""[^"]*[一-鿿][^"]*""#).unwrap();

    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if doc_markers.iter().any(|re| re.is_match(trimmed)) {
            debug!(line = trimmed, "dropping documentation line");
            continue;
        }

        let cjk_count = line.chars().filter(|c| non_ascii_script(*c)).count();
        let has_quote = line.contains('\'') || line.contains('"');
        if cjk_count > 3 && !has_quote {
            continue;
        }

        let mut line = line.to_string();
        if has_quote && cjk_count > 0 {
            line = single_quoted.replace_all(&line, "'text'").to_string();
            line = double_quoted.replace_all(&line, "\"text\"").to_string();
        }

        if line.trim_start().starts_with("//") && line.chars().any(non_ascii_script) {
            continue;
        }
        if line.chars().any(non_ascii_script) {
            continue;
        }
        out.push(line);
    }

    out.join("\n").trim_matches('\n').to_string()
}

/// The survival bar: at least one structural ArkTS marker.
fn has_code_structure(code: &str) -> bool {
    ["import ", "@Entry", "@Component", "struct ", "build()"]
        .iter()
        .any(|marker| code.contains(marker))
}

// ---------------------------------------------------------------------------
// File writing
// ---------------------------------------------------------------------------

/// Write a generated file with a three-tier strategy, verifying after
/// each tier that the file exists and is non-empty.
pub fn write_file(root: &Path, relative: &str, content: &str) -> Result<()> {
    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Write(format!("cannot create {}: {e}", parent.display())))?;
    }

    // Tier 1: explicit create + write + flush.
    let direct = || -> std::io::Result<()> {
        use std::io::Write as _;
        let mut file = std::fs::File::create(&target)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    };
    match direct() {
        Ok(()) if written_non_empty(&target) => return Ok(()),
        Ok(()) => warn!(path = %target.display(), "direct write left no content"),
        Err(e) => warn!(path = %target.display(), error = %e, "direct write failed"),
    }

    // Tier 2: one-shot fs::write.
    match std::fs::write(&target, content) {
        Ok(()) if written_non_empty(&target) => return Ok(()),
        Ok(()) => warn!(path = %target.display(), "fs::write left no content"),
        Err(e) => warn!(path = %target.display(), error = %e, "fs::write failed"),
    }

    // Tier 3: temp file in the same directory, then rename.
    let staged = || -> std::io::Result<()> {
        let tmp = target.with_extension("tmp-write");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &target)
    };
    match staged() {
        Ok(()) if written_non_empty(&target) => Ok(()),
        Ok(()) => Err(Error::Write(format!(
            "all write strategies left {} empty",
            target.display()
        ))),
        Err(e) => Err(Error::Write(format!(
            "all write strategies failed for {}: {e}",
            target.display()
        ))),
    }
}

fn written_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeLlm, local_item};
    use tempfile::TempDir;

    const VALID_CODE: &str = "import router from '@ohos.router';\n\n@Entry\n@Component\nstruct Index {\n  build() {\n    Text('hello')\n  }\n}";

    #[test]
    fn test_sanitize_passes_clean_code_through() {
        let out = sanitize(VALID_CODE, FileKind::Source).unwrap();
        assert_eq!(out, VALID_CODE);
    }

    #[test]
    fn test_sanitize_unwraps_tagged_fence() {
        let raw = format!("Here is the code:\n```arkts\n{VALID_CODE}\n```\nHope it helps!");
        let out = sanitize(&raw, FileKind::Source).unwrap();
        assert_eq!(out, VALID_CODE);
    }

    #[test]
    fn test_sanitize_unwraps_untagged_fence() {
        let raw = format!("```\n{VALID_CODE}\n```");
        let out = sanitize(&raw, FileKind::Source).unwrap();
        assert_eq!(out, VALID_CODE);
    }

    #[test]
    fn test_sanitize_anchors_at_import_without_fence() {
        let raw = format!("The following implements your page.\n\n{VALID_CODE}");
        let out = sanitize(&raw, FileKind::Source).unwrap();
        assert_eq!(out, VALID_CODE);
    }

    #[test]
    fn test_sanitize_strips_reasoning_block() {
        let raw = format!("<think>let me plan the layout</think>\n{VALID_CODE}");
        let out = sanitize(&raw, FileKind::Source).unwrap();
        assert_eq!(out, VALID_CODE);
    }

    #[test]
    fn test_sanitize_drops_documentation_lines() {
        let raw = "@Entry\n@Component\nstruct A {\n# heading\n1. step one\n> quote\n  build() {}\n}";
        let out = sanitize(raw, FileKind::Source).unwrap();
        assert!(!out.contains("heading"));
        assert!(!out.contains("step one"));
        assert!(!out.contains("quote"));
        assert!(out.contains("build()"));
    }

    #[test]
    fn test_sanitize_replaces_cjk_string_literals() {
        let raw = "@Entry\n@Component\nstruct A {\n  build() {\n    Text('你好世界')\n  }\n}";
        let out = sanitize(raw, FileKind::Source).unwrap();
        assert!(out.contains("Text('text')"));
        assert!(!out.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)));
    }

    #[test]
    fn test_sanitize_drops_cjk_comment_lines() {
        let raw = "import x from 'y';\n// 这是一个注释\nstruct A {}";
        let out = sanitize(raw, FileKind::Source).unwrap();
        assert!(!out.contains("注释"));
        assert!(out.contains("import x"));
    }

    #[test]
    fn test_sanitize_rejects_prose_only_output() {
        let err = sanitize(
            "I cannot generate that code, sorry about it.",
            FileKind::Source,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[test]
    fn test_sanitize_rejects_empty_output() {
        assert!(sanitize("", FileKind::Source).is_err());
        assert!(sanitize("   \n  ", FileKind::Resource).is_err());
    }

    #[test]
    fn test_sanitize_resource_kind_unwraps_fence_only() {
        let raw = "```json\n{\"string\": []}\n```";
        let out = sanitize(raw, FileKind::Resource).unwrap();
        assert_eq!(out, "{\"string\": []}");
    }

    #[test]
    fn test_sanitize_is_fixed_point() {
        let noisy = format!(
            "<think>plan</think>\nHere you go:\n```arkts\n{VALID_CODE}\n# done\nText('好的')\n```",
        );
        let once = sanitize(&noisy, FileKind::Source).unwrap();
        let twice = sanitize(&once, FileKind::Source).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_plan_always_contains_entry_page() {
        let plan = ProjectPlan::for_requirement("Build a todo list page");
        assert_eq!(plan.files.len(), 1);
        assert_eq!(plan.files[0].path, project::ENTRY_PAGE);
        assert_eq!(plan.files[0].kind, FileKind::Source);
    }

    #[test]
    fn test_plan_adds_string_resource_on_demand() {
        let plan = ProjectPlan::for_requirement("A page with localized greetings");
        assert_eq!(plan.files.len(), 2);
        assert_eq!(plan.files[1].path, project::STRING_RESOURCE);
    }

    #[tokio::test]
    async fn test_generate_file_sanitizes_reply() {
        let llm = Arc::new(FakeLlm::new(vec![FakeLlm::reply(&format!(
            "```arkts\n{VALID_CODE}\n```"
        ))]));
        let generator = CodeGenerator::new(llm, Arc::new(PromptEngine::new(None)));
        let plan = &ProjectPlan::for_requirement("counter page").files[0];
        let (content, tokens) = generator
            .generate_file(plan, "counter page", &[local_item("use @State")])
            .await
            .unwrap();
        assert_eq!(content, VALID_CODE);
        assert_eq!(tokens, 10);
    }

    #[tokio::test]
    async fn test_generate_file_surfaces_generation_error() {
        let llm = Arc::new(FakeLlm::new(vec![FakeLlm::reply(
            "Sorry, I can only answer questions about cooking.",
        )]));
        let generator = CodeGenerator::new(llm, Arc::new(PromptEngine::new(None)));
        let plan = &ProjectPlan::for_requirement("counter page").files[0];
        let err = generator
            .generate_file(plan, "counter page", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[tokio::test]
    async fn test_fix_file_prefers_rich_analyses() {
        let llm = Arc::new(FakeLlm::new(vec![FakeLlm::reply(VALID_CODE)]));
        let generator = CodeGenerator::new(llm.clone(), Arc::new(PromptEngine::new(None)));
        let issue = Issue::new(
            crate::analyzer::Severity::Error,
            "Cannot find name 'Txt'",
            "lint",
        );
        let analysis = crate::filter::classify(&issue, 1, &[]);
        let request = FixRequest {
            path: project::ENTRY_PAGE,
            requirement: "counter page",
            current_code: "struct Index {}",
            analyses: std::slice::from_ref(&analysis),
            raw_issues: &[],
            raw_excerpts: &[],
            references: &[],
        };
        let (content, _) = generator.fix_file(&request).await.unwrap();
        assert_eq!(content, VALID_CODE);

        let prompt = llm.prompts_seen.lock().unwrap().last().unwrap().clone();
        assert!(prompt.contains("root cause"));
        assert!(prompt.contains("Cannot find name 'Txt'"));
    }

    #[test]
    fn test_raw_error_rendering_bounds_excerpts() {
        let issues = vec![Issue::new(
            crate::analyzer::Severity::Error,
            "boom",
            "lint",
        )];
        let excerpts: Vec<String> = (0..5).map(|i| format!("excerpt {i} {}", "x".repeat(600))).collect();
        let rendered = render_raw_errors(&issues, &excerpts);
        assert!(rendered.contains("excerpt 1"));
        assert!(rendered.contains("excerpt 3"));
        assert!(!rendered.contains("excerpt 4 "));
        // Each excerpt is truncated to the configured budget.
        assert!(rendered.len() < 3 * 700);
    }

    #[test]
    fn test_reference_snippets_truncated() {
        let mut item = local_item("r");
        item.text = "y".repeat(500);
        let rendered = format_references(&[item], 3, 150);
        assert_eq!(rendered.len(), 2 + 150);
    }

    #[test]
    fn test_write_file_creates_parents_and_content() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), project::ENTRY_PAGE, VALID_CODE).unwrap();
        let written = std::fs::read_to_string(dir.path().join(project::ENTRY_PAGE)).unwrap();
        assert_eq!(written, VALID_CODE);
    }

    #[test]
    fn test_write_file_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "entry/a.ets", "first").unwrap();
        write_file(dir.path(), "entry/a.ets", "second").unwrap();
        let written = std::fs::read_to_string(dir.path().join("entry/a.ets")).unwrap();
        assert_eq!(written, "second");
    }
}
