use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{info, warn};

use crate::error::Error;
use crate::process::{ProcessConfig, binary_on_path, spawn_and_capture};

use super::{
    Analyzer, Issue, Language, ReviewRequest, ReviewResult, Severity, next_request_id,
    score_issues, timeout_result, unsupported_result,
};

const BACKEND_ID: &str = "native";

/// C/C++ static analysis via a cppcheck-compatible CLI. The report is
/// read from stderr in gcc template form:
/// `file:line:column: severity: message [rule]`.
pub struct NativeAnalyzer {
    binary: String,
    cert_rules: bool,
    timeout: Duration,
}

impl NativeAnalyzer {
    pub fn new(binary: &str, cert_rules: bool, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            cert_rules,
            timeout,
        }
    }

    pub fn supports_language(language: Language) -> bool {
        matches!(language, Language::C | Language::Cpp)
    }
}

impl Analyzer for NativeAnalyzer {
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
        let work_dir = std::env::temp_dir().join("arkgen-analysis").join(&request_id);
        let source = work_dir.join(format!("source.{}", request.language.source_extension()));
        if let Err(e) =
            std::fs::create_dir_all(&work_dir).and_then(|()| std::fs::write(&source, &request.code))
        {
            return tool_failure(request, &e.to_string(), started.elapsed());
        }

        let mut args = vec![
            "--enable=warning,style,performance".to_string(),
            "--template={file}:{line}:{column}: {severity}: {message} [{id}]".to_string(),
        ];
        if self.cert_rules {
            args.push("--addon=cert".to_string());
        }
        args.push(source.display().to_string());

        let config = ProcessConfig {
            command: self.binary.clone(),
            args,
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
        let issues = parse_native_report(&transcript);
        let score = score_issues(&issues);
        info!(issues = issues.len(), score, "native analysis complete");

        ReviewResult {
            request_id,
            request: request.clone(),
            report: transcript,
            issues,
            suggestions: Vec::new(),
            score,
            metadata: HashMap::from([(
                "cert_rules".to_string(),
                self.cert_rules.to_string(),
            )]),
            elapsed: started.elapsed(),
        }
    }
}

fn tool_failure(request: &ReviewRequest, detail: &str, elapsed: Duration) -> ReviewResult {
    warn!(detail, "native tool failed");
    ReviewResult {
        request_id: next_request_id(BACKEND_ID),
        request: request.clone(),
        report: format!("native analyzer failed: {detail}"),
        issues: vec![Issue::new(
            Severity::Error,
            format!("native analyzer failed: {detail}"),
            BACKEND_ID,
        )],
        suggestions: Vec::new(),
        score: 0.0,
        metadata: HashMap::new(),
        elapsed,
    }
}

/// Parse gcc-template report lines. Tool severities map to canonical:
/// error → error; warning → warning; style/performance/portability/
/// information → info.
pub fn parse_native_report(transcript: &str) -> Vec<Issue> {
    let line_re = Regex::new(
        r"^(?P<file>[^\s:]+):(?P<line>\d+):(?P<col>\d+): (?P<sev>\w+): (?P<msg>.+?)(?:\s+\[(?P<rule>[^\]]+)\])?$",
    )
    .unwrap();

    transcript
        .lines()
        .filter_map(|line| {
            let caps = line_re.captures(line.trim())?;
            let raw = caps["sev"].to_string();
            let severity = match raw.as_str() {
                "error" => Severity::Error,
                "warning" => Severity::Warning,
                _ => Severity::Info,
            };
            let mut issue = Issue::new(severity, caps["msg"].to_string(), BACKEND_ID);
            issue.file_path = caps["file"].to_string();
            issue.line = caps["line"].parse().ok();
            issue.column = caps["col"].parse().ok();
            issue.rule_id = caps.name("rule").map(|m| m.as_str().to_string());
            issue.raw_severity = Some(raw.to_uppercase());
            Some(issue)
        })
        .collect()
}
