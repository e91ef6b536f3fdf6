use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, binary_on_path, spawn_and_capture};

use super::{
    Analyzer, Issue, Language, ReviewRequest, ReviewResult, Severity, next_request_id,
    score_issues, timeout_result, unsupported_result,
};

const BACKEND_ID: &str = "server";

/// Server-based multi-language analyzer: a SonarQube-style scanner CLI
/// plus HTTP polling of the server for issues and security hotspots.
///
/// Per request: a temporary project directory is created, the code and
/// a project-properties file are written, the scanner runs, the server
/// is polled for results, and both the directory and the server-side
/// project are deleted — also on failure.
#[derive(Clone)]
pub struct ServerAnalyzer {
    agent: ureq::Agent,
    host_url: String,
    login: String,
    password: String,
    scanner: String,
    scan_timeout: Duration,
    poll_interval: Duration,
    analysis_wait: Duration,
}

impl ServerAnalyzer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_url: &str,
        login: &str,
        password: &str,
        scanner: &str,
        scan_timeout: Duration,
        poll_interval: Duration,
        analysis_wait: Duration,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            host_url: host_url.trim_end_matches('/').to_string(),
            login: login.to_string(),
            password: password.to_string(),
            scanner: scanner.to_string(),
            scan_timeout,
            poll_interval,
            analysis_wait,
        }
    }

    pub fn supports_language(language: Language) -> bool {
        matches!(
            language,
            Language::Typescript
                | Language::Javascript
                | Language::Java
                | Language::Python
                | Language::C
                | Language::Cpp
                | Language::Html
                | Language::Css
        )
    }

    pub fn supported_languages() -> Vec<&'static str> {
        vec![
            "typescript",
            "javascript",
            "java",
            "python",
            "c",
            "cpp",
            "html",
            "css",
        ]
    }

    fn auth_header(&self) -> String {
        format!(
            "Basic {}",
            base64(format!("{}:{}", self.login, self.password).as_bytes())
        )
    }

    fn create_temp_project(&self, request: &ReviewRequest, project_key: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join("arkgen-analysis").join(project_key);
        std::fs::create_dir_all(&dir)?;

        let source = dir.join(format!("source.{}", request.language.source_extension()));
        std::fs::write(&source, &request.code)?;

        let properties = format!(
            "sonar.projectKey={project_key}\n\
             sonar.projectName=Temp Analysis Project\n\
             sonar.projectVersion=1.0\n\
             sonar.sources=.\n\
             sonar.sourceEncoding=UTF-8\n\
             sonar.host.url={host}\n\
             sonar.login={login}\n\
             sonar.password={password}\n\
             sonar.verbose=true\n\
             sonar.log.level=DEBUG\n\
             sonar.qualitygate.wait=true\n\
             sonar.cpd.minimumTokens=50\n\
             sonar.cpd.minimumLines=5\n\
             sonar.inclusions=**/*.py,**/*.js,**/*.ts,**/*.java,**/*.c,**/*.cpp,**/*.html,**/*.css\n",
            host = self.host_url,
            login = self.login,
            password = self.password,
        );
        std::fs::write(dir.join("sonar-project.properties"), properties)?;
        Ok(dir)
    }

    async fn run_scanner(&self, project_dir: &Path, project_key: &str) -> Result<()> {
        let config = ProcessConfig {
            command: self.scanner.clone(),
            args: vec![
                format!("-Dsonar.projectKey={project_key}"),
                format!("-Dsonar.host.url={}", self.host_url),
                format!("-Dsonar.login={}", self.login),
                format!("-Dsonar.password={}", self.password),
            ],
            working_dir: project_dir.to_path_buf(),
            timeout: Some(self.scan_timeout),
            log_prefix: format!("analyzer:{BACKEND_ID}"),
            env: Vec::new(),
            stdin_data: None,
        };

        let output = spawn_and_capture(config).await?;
        if !output.success() {
            return Err(Error::Analyzer(format!(
                "scanner exited with code {}: {}",
                output.exit_code,
                output.stderr_lines.join("\n")
            )));
        }
        Ok(())
    }

    /// Poll the server for issues and hotspots within the analysis-wait
    /// deadline. Transport errors retry at the poll interval; hotspot
    /// fetch failures only lose the hotspots.
    async fn fetch_results(&self, project_key: &str) -> Result<Vec<Issue>> {
        tokio::time::sleep(self.poll_interval).await;

        let deadline = Instant::now() + self.analysis_wait;
        let issues = loop {
            let client = self.clone();
            let key = project_key.to_string();
            let fetched =
                tokio::task::spawn_blocking(move || client.fetch_issues_blocking(&key))
                    .await
                    .map_err(|e| Error::Analyzer(format!("fetch task failed: {e}")))?;
            match fetched {
                Ok(issues) => break issues,
                Err(e) if Instant::now() < deadline => {
                    debug!(error = %e, "issue fetch not ready, polling again");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        };

        let client = self.clone();
        let key = project_key.to_string();
        let hotspots = tokio::task::spawn_blocking(move || client.fetch_hotspots_blocking(&key))
            .await
            .map_err(|e| Error::Analyzer(format!("hotspot task failed: {e}")))?;

        let mut all = issues;
        match hotspots {
            Ok(mut hotspots) => all.append(&mut hotspots),
            Err(e) => warn!(error = %e, "hotspot fetch failed"),
        }
        Ok(all)
    }

    fn fetch_issues_blocking(&self, project_key: &str) -> Result<Vec<Issue>> {
        let url = format!("{}/api/issues/search", self.host_url);
        let response = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header())
            .query("componentKeys", project_key)
            .query("ps", "500")
            .query("resolved", "false")
            .call()
            .map_err(|e| Error::Analyzer(format!("issue search failed: {e}")))?;

        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| Error::Analyzer(format!("failed to parse issue response: {e}")))?;

        let issues = json["issues"]
            .as_array()
            .map(|list| list.iter().map(parse_server_issue).collect())
            .unwrap_or_default();
        Ok(issues)
    }

    fn fetch_hotspots_blocking(&self, project_key: &str) -> Result<Vec<Issue>> {
        let url = format!("{}/api/hotspots/search", self.host_url);
        let response = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header())
            .query("projectKey", project_key)
            .query("ps", "500")
            .call()
            .map_err(|e| Error::Analyzer(format!("hotspot search failed: {e}")))?;

        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| Error::Analyzer(format!("failed to parse hotspot response: {e}")))?;

        let hotspots = json["hotspots"]
            .as_array()
            .map(|list| list.iter().map(parse_server_hotspot).collect())
            .unwrap_or_default();
        Ok(hotspots)
    }

    /// Delete the temp directory and the server-side project. Runs on
    /// every exit path; failures are logged, never propagated.
    fn cleanup(&self, project_dir: &Path, project_key: &str) {
        if let Err(e) = std::fs::remove_dir_all(project_dir) {
            warn!(error = %e, "failed to remove temp project dir");
        }
        let url = format!("{}/api/projects/delete", self.host_url);
        if let Err(e) = self
            .agent
            .post(&url)
            .set("Authorization", &self.auth_header())
            .send_form(&[("project", project_key)])
        {
            debug!(error = %e, "failed to delete server-side project");
        }
    }
}

impl Analyzer for ServerAnalyzer {
    fn id(&self) -> &'static str {
        BACKEND_ID
    }

    fn is_available(&self) -> bool {
        if !binary_on_path(&self.scanner) {
            return false;
        }
        let url = format!("{}/api/system/status", self.host_url);
        match self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header())
            .call()
        {
            Ok(response) => response
                .into_json::<serde_json::Value>()
                .map(|json| json["status"] == "UP")
                .unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "analysis server unreachable");
                false
            }
        }
    }

    async fn review(&self, request: &ReviewRequest) -> ReviewResult {
        let started = Instant::now();
        if !Self::supports_language(request.language) {
            let mut result = unsupported_result(BACKEND_ID, request);
            result.suggestions = Self::supported_languages()
                .iter()
                .map(|l| format!("supported language: {l}"))
                .collect();
            return result;
        }

        let request_id = next_request_id(BACKEND_ID);
        let project_key = format!("temp-project-{request_id}");

        let project_dir = match self.create_temp_project(request, &project_key) {
            Ok(dir) => dir,
            Err(e) => return analysis_failure(request, &e.to_string(), started.elapsed()),
        };

        let outcome = self.analyze(&project_dir, &project_key).await;
        self.cleanup(&project_dir, &project_key);

        match outcome {
            Ok(issues) => {
                let score = score_issues(&issues);
                let (report, suggestions) = summarize(&issues, request.language);
                info!(issues = issues.len(), score, "server analysis complete");
                ReviewResult {
                    request_id,
                    request: request.clone(),
                    report,
                    issues,
                    suggestions,
                    score,
                    metadata: HashMap::from([
                        ("host".to_string(), self.host_url.clone()),
                        ("project_key".to_string(), project_key),
                    ]),
                    elapsed: started.elapsed(),
                }
            }
            Err(Error::ProcessTimeout(after)) => {
                timeout_result(BACKEND_ID, request, after, started.elapsed())
            }
            Err(e) => analysis_failure(request, &e.to_string(), started.elapsed()),
        }
    }
}

impl ServerAnalyzer {
    async fn analyze(&self, project_dir: &Path, project_key: &str) -> Result<Vec<Issue>> {
        self.run_scanner(project_dir, project_key).await?;
        self.fetch_results(project_key).await
    }
}

fn analysis_failure(request: &ReviewRequest, detail: &str, elapsed: Duration) -> ReviewResult {
    warn!(detail, "server analysis failed");
    ReviewResult {
        request_id: next_request_id(BACKEND_ID),
        request: request.clone(),
        report: format!("server analysis failed: {detail}"),
        issues: vec![Issue::new(
            Severity::Error,
            format!("server analysis failed: {detail}"),
            BACKEND_ID,
        )],
        suggestions: Vec::new(),
        score: 0.0,
        metadata: HashMap::new(),
        elapsed,
    }
}

/// Map server severities to the canonical set:
/// BLOCKER/CRITICAL → error; MAJOR/MINOR → warning; INFO → info;
/// anything else → info.
fn map_severity(raw: &str) -> Severity {
    match raw {
        "BLOCKER" | "CRITICAL" => Severity::Error,
        "MAJOR" | "MINOR" => Severity::Warning,
        _ => Severity::Info,
    }
}

fn component_path(component: &str) -> String {
    component
        .split_once(':')
        .map(|(_, path)| path.to_string())
        .unwrap_or_else(|| component.to_string())
}

fn parse_server_issue(raw: &serde_json::Value) -> Issue {
    let raw_severity = raw["severity"].as_str().unwrap_or("INFO").to_string();
    let mut issue = Issue::new(
        map_severity(&raw_severity),
        raw["message"].as_str().unwrap_or_default().to_string(),
        BACKEND_ID,
    );
    issue.file_path = raw["component"]
        .as_str()
        .map(component_path)
        .unwrap_or_default();
    issue.line = raw["line"].as_u64().map(|n| n as u32);
    issue.rule_id = raw["rule"].as_str().map(str::to_string);
    issue.kind = Some(raw["type"].as_str().unwrap_or("CODE_SMELL").to_string());
    issue.raw_severity = Some(raw_severity);
    issue
}

/// Hotspots lack the issue shape; coerce them with `SECURITY_HOTSPOT`
/// kind and the vulnerability probability as the tool severity.
fn parse_server_hotspot(raw: &serde_json::Value) -> Issue {
    let probability = raw["vulnerabilityProbability"]
        .as_str()
        .unwrap_or("MEDIUM")
        .to_string();
    let mut issue = Issue::new(
        map_severity(&probability),
        raw["message"].as_str().unwrap_or("security hotspot").to_string(),
        BACKEND_ID,
    );
    issue.file_path = raw["component"]
        .as_str()
        .map(component_path)
        .unwrap_or_default();
    issue.line = raw["line"].as_u64().map(|n| n as u32);
    issue.rule_id = raw["ruleKey"].as_str().map(str::to_string);
    issue.kind = Some("SECURITY_HOTSPOT".to_string());
    issue.raw_severity = Some(probability);
    issue
}

fn summarize(issues: &[Issue], language: Language) -> (String, Vec<String>) {
    let bugs = issues.iter().filter(|i| i.kind.as_deref() == Some("BUG")).count();
    let vulnerabilities = issues
        .iter()
        .filter(|i| i.kind.as_deref() == Some("VULNERABILITY"))
        .count();
    let smells = issues
        .iter()
        .filter(|i| i.kind.as_deref() == Some("CODE_SMELL"))
        .count();

    if issues.is_empty() {
        return (
            format!(
                "Server analysis complete: no issues found in {} code.",
                language.label()
            ),
            vec!["No issues found.".to_string()],
        );
    }

    let report = format!(
        "Server analysis complete: {} issue(s) found ({bugs} bugs, \
         {vulnerabilities} vulnerabilities, {smells} code smells). \
         Fix order: vulnerabilities > bugs > code smells.",
        issues.len()
    );

    let mut suggestions = Vec::new();
    if vulnerabilities > 0 {
        suggestions.push(format!(
            "{vulnerabilities} security vulnerabilit(ies) found, address immediately"
        ));
    }
    if bugs > 0 {
        suggestions.push(format!("{bugs} potential bug(s) found, fix with priority"));
    }
    if smells > 0 {
        suggestions.push(format!("{smells} code smell(s) found, consider refactoring"));
    }
    (report, suggestions)
}

/// Minimal standard-alphabet base64, enough for a Basic auth header.
fn base64(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    out
}
