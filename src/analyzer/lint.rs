use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use crate::error::Error;
use crate::process::{ProcessConfig, binary_on_path, spawn_and_capture};

use super::{
    Analyzer, Issue, Language, ReviewRequest, ReviewResult, Severity, next_request_id,
    score_issues, timeout_result, unsupported_result,
};

const BACKEND_ID: &str = "lint";

/// Lint-style checker for ArkTS / TypeScript / JavaScript, wrapping a
/// codelinter-compatible CLI. Defect lines look like
/// `pages/Index.ets:10:5  error  Property does not exist  [no-any]`
/// followed by a `Defects: n; Errors: n; Warns: m` summary.
pub struct LintAnalyzer {
    binary: String,
    timeout: Duration,
}

impl LintAnalyzer {
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    pub fn supports_language(language: Language) -> bool {
        matches!(
            language,
            Language::Arkts | Language::Typescript | Language::Javascript
        )
    }
}

impl Analyzer for LintAnalyzer {
    fn id(&self) -> &'static str {
        BACKEND_ID
    }

    fn is_available(&self) -> bool {
        binary_on_path(&self.binary)
    }

    async fn review(&self, request: &ReviewRequest) -> ReviewResult {
        let started = Instant::now();
        if !Self::supports_language(request.language) {
            return unsupported_result(BACKEND_ID, request);
        }

        let request_id = next_request_id(BACKEND_ID);
        let work_dir = match write_temp_source(&request_id, request) {
            Ok(dir) => dir,
            Err(e) => return tool_failure(request, &e.to_string(), started.elapsed()),
        };
        let source = work_dir.join(format!("source.{}", request.language.source_extension()));

        let config = ProcessConfig {
            command: self.binary.clone(),
            args: vec![source.display().to_string()],
            working_dir: work_dir.clone(),
            timeout: Some(self.timeout),
            log_prefix: format!("analyzer:{BACKEND_ID}"),
            env: Vec::new(),
            stdin_data: None,
        };

        let output = spawn_and_capture(config).await;
        let _ = std::fs::remove_dir_all(&work_dir);

        let output = match output {
            Ok(output) => output,
            Err(Error::ProcessTimeout(after)) => {
                return timeout_result(BACKEND_ID, request, after, started.elapsed());
            }
            Err(e) => return tool_failure(request, &e.to_string(), started.elapsed()),
        };

        let transcript = output.combined();
        let issues = parse_lint_report(&transcript);
        let score = score_issues(&issues);
        info!(
            issues = issues.len(),
            score, "lint analysis complete"
        );

        ReviewResult {
            request_id,
            request: request.clone(),
            report: transcript,
            issues,
            suggestions: Vec::new(),
            score,
            metadata: HashMap::from([(
                "language".to_string(),
                request.language.label().to_string(),
            )]),
            elapsed: started.elapsed(),
        }
    }
}

fn write_temp_source(request_id: &str, request: &ReviewRequest) -> crate::error::Result<PathBuf> {
    let dir = std::env::temp_dir().join("arkgen-analysis").join(request_id);
    std::fs::create_dir_all(&dir)?;
    let file = dir.join(format!("source.{}", request.language.source_extension()));
    std::fs::write(&file, &request.code)?;
    Ok(dir)
}

fn tool_failure(request: &ReviewRequest, detail: &str, elapsed: Duration) -> ReviewResult {
    warn!(detail, "lint tool failed");
    ReviewResult {
        request_id: next_request_id(BACKEND_ID),
        request: request.clone(),
        report: format!("lint analyzer failed: {detail}"),
        issues: vec![Issue::new(
            Severity::Error,
            format!("lint analyzer failed: {detail}"),
            BACKEND_ID,
        )],
        suggestions: Vec::new(),
        score: 0.0,
        metadata: HashMap::new(),
        elapsed,
    }
}

/// Parse per-defect lines out of the linter transcript.
pub fn parse_lint_report(transcript: &str) -> Vec<Issue> {
    let defect_re = Regex::new(
        r"^(?P<file>[^\s:]+):(?P<line>\d+):(?P<col>\d+)\s+(?P<sev>error|warn|warning|info)\s+(?P<msg>.+?)(?:\s+\[(?P<rule>[^\]]+)\])?$",
    )
    .unwrap();

    transcript
        .lines()
        .filter_map(|line| {
            let caps = defect_re.captures(line.trim())?;
            let severity = match &caps["sev"] {
                "error" => Severity::Error,
                "warn" | "warning" => Severity::Warning,
                _ => Severity::Info,
            };
            let mut issue = Issue::new(severity, caps["msg"].to_string(), BACKEND_ID);
            issue.file_path = caps["file"].to_string();
            issue.line = caps["line"].parse().ok();
            issue.column = caps["col"].parse().ok();
            issue.rule_id = caps.name("rule").map(|m| m.as_str().to_string());
            issue.raw_severity = Some(caps["sev"].to_uppercase());
            Some(issue)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = "\
Start scanning source files...
pages/Index.ets:10:5  error  Property 'foo' does not exist on type 'Hello'  [arkts-strict-property]
pages/Index.ets:22:3  warn  Unused variable 'count'  [no-unused-vars]
pages/Index.ets:30:1  info  Prefer const  [prefer-const]
Defects: 3; Errors: 1; Warns: 1
";

    #[test]
    fn test_parse_defect_lines() {
        let issues = parse_lint_report(TRANSCRIPT);
        assert_eq!(issues.len(), 3);

        assert_eq!(issues[0].severity, Severity::Error);
        assert_eq!(issues[0].file_path, "pages/Index.ets");
        assert_eq!(issues[0].line, Some(10));
        assert_eq!(issues[0].column, Some(5));
        assert_eq!(issues[0].rule_id.as_deref(), Some("arkts-strict-property"));
        assert_eq!(issues[0].backend, "lint");

        assert_eq!(issues[1].severity, Severity::Warning);
        assert_eq!(issues[2].severity, Severity::Info);
    }

    #[test]
    fn test_parse_message_without_rule() {
        let issues = parse_lint_report("a.ts:1:1  error  Unexpected token");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message, "Unexpected token");
        assert!(issues[0].rule_id.is_none());
    }

    #[test]
    fn test_parse_skips_noise_lines() {
        let issues = parse_lint_report("Start scanning...\nDefects: 0; Errors: 0; Warns: 0\n");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_supports_matrix() {
        assert!(LintAnalyzer::supports_language(Language::Arkts));
        assert!(LintAnalyzer::supports_language(Language::Typescript));
        assert!(LintAnalyzer::supports_language(Language::Javascript));
        assert!(!LintAnalyzer::supports_language(Language::Cpp));
        assert!(!LintAnalyzer::supports_language(Language::Python));
    }

    #[tokio::test]
    async fn test_unsupported_language_never_errors() {
        let analyzer = LintAnalyzer::new("codelinter", Duration::from_secs(30));
        let request = ReviewRequest::new("q", "#include <stdio.h>\nint main() { printf(\"x\"); }");
        let result = analyzer.review(&request).await;
        assert_eq!(result.score, 0.0);
        assert!(result.report.contains("does not support"));
    }
}
