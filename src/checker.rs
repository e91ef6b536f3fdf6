use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{info, warn};

use crate::analyzer::lint::LintAnalyzer;
use crate::analyzer::native::NativeAnalyzer;
use crate::analyzer::server::ServerAnalyzer;
use crate::analyzer::{
    Analyzer, Issue, Language, ReviewRequest, ReviewResult, Severity, next_request_id,
    score_issues,
};

/// Closed set of analyzer back-ends. Dispatch is data, not
/// polymorphism: the `{language → [backend id]}` table below selects
/// which of these run for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendId {
    Lint,
    Native,
    Server,
}

impl BackendId {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lint" => Some(BackendId::Lint),
            "native" => Some(BackendId::Native),
            "server" => Some(BackendId::Server),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendId::Lint => "lint",
            BackendId::Native => "native",
            BackendId::Server => "server",
        }
    }
}

/// Default dispatch matrix.
pub fn default_routes() -> HashMap<Language, Vec<BackendId>> {
    HashMap::from([
        (Language::Arkts, vec![BackendId::Lint]),
        (Language::Typescript, vec![BackendId::Lint, BackendId::Server]),
        (Language::Javascript, vec![BackendId::Lint, BackendId::Server]),
        (Language::C, vec![BackendId::Native, BackendId::Server]),
        (Language::Cpp, vec![BackendId::Native, BackendId::Server]),
        (Language::Java, vec![BackendId::Server]),
        (Language::Python, vec![BackendId::Server]),
        (Language::Html, vec![BackendId::Server]),
        (Language::Css, vec![BackendId::Server]),
    ])
}

/// Routes a review request to the configured analyzer back-ends by
/// detected language, fans out, and fuses the results. Never fails: an
/// empty runnable set yields the fallback result.
pub struct UnifiedChecker {
    lint: Option<LintAnalyzer>,
    native: Option<NativeAnalyzer>,
    server: Option<ServerAnalyzer>,
    routes: HashMap<Language, Vec<BackendId>>,
}

impl UnifiedChecker {
    pub fn new(
        lint: Option<LintAnalyzer>,
        native: Option<NativeAnalyzer>,
        server: Option<ServerAnalyzer>,
        routes: HashMap<Language, Vec<BackendId>>,
    ) -> Self {
        Self {
            lint,
            native,
            server,
            routes,
        }
    }

    /// Analyze one code blob. The request's language has already been
    /// detected; back-ends that are unconfigured, unavailable, or do
    /// not support the language are skipped.
    pub async fn review(&self, request: &ReviewRequest) -> ReviewResult {
        let started = Instant::now();
        let routed = self
            .routes
            .get(&request.language)
            .cloned()
            .unwrap_or_default();

        let mut runnable: Vec<BackendId> = Vec::new();
        for id in routed {
            if self.backend_runnable(id, request.language).await {
                runnable.push(id);
            }
        }

        if runnable.is_empty() {
            warn!(
                language = request.language.label(),
                "no analyzer back-end available"
            );
            return self.fallback_result(request, started.elapsed());
        }

        info!(
            language = request.language.label(),
            backends = ?runnable.iter().map(BackendId::label).collect::<Vec<_>>(),
            "dispatching review"
        );

        let mut futures: Vec<Pin<Box<dyn Future<Output = ReviewResult> + Send + '_>>> = Vec::new();
        for id in &runnable {
            match id {
                BackendId::Lint => {
                    if let Some(analyzer) = self.lint.as_ref() {
                        futures.push(Box::pin(analyzer.review(request)));
                    }
                }
                BackendId::Native => {
                    if let Some(analyzer) = self.native.as_ref() {
                        futures.push(Box::pin(analyzer.review(request)));
                    }
                }
                BackendId::Server => {
                    if let Some(analyzer) = self.server.as_ref() {
                        futures.push(Box::pin(analyzer.review(request)));
                    }
                }
            }
        }

        let results = join_all(futures).await;
        merge_results(request, results, started.elapsed())
    }

    async fn backend_runnable(&self, id: BackendId, language: Language) -> bool {
        match id {
            BackendId::Lint => self
                .lint
                .as_ref()
                .is_some_and(|a| LintAnalyzer::supports_language(language) && a.is_available()),
            BackendId::Native => self
                .native
                .as_ref()
                .is_some_and(|a| NativeAnalyzer::supports_language(language) && a.is_available()),
            BackendId::Server => {
                let Some(server) = self.server.as_ref() else {
                    return false;
                };
                if !ServerAnalyzer::supports_language(language) {
                    return false;
                }
                // The server probe is an HTTP round trip; keep it off
                // the async worker.
                let probe = server.clone();
                tokio::task::spawn_blocking(move || probe.is_available())
                    .await
                    .unwrap_or(false)
            }
        }
    }

    /// The never-throw fallback: severity info, score 0, a message
    /// explaining unavailability, and the languages the configured
    /// back-ends could handle.
    fn fallback_result(&self, request: &ReviewRequest, elapsed: Duration) -> ReviewResult {
        let mut suggestions = Vec::new();
        if self.lint.is_some() {
            suggestions.push("lint analyzer supports: arkts, typescript, javascript".to_string());
        }
        if self.native.is_some() {
            suggestions.push("native analyzer supports: c, cpp".to_string());
        }
        if self.server.is_some() {
            suggestions.push(format!(
                "server analyzer supports: {}",
                ServerAnalyzer::supported_languages().join(", ")
            ));
        }
        if suggestions.is_empty() {
            suggestions.push("no analyzer back-ends are configured".to_string());
        }

        let message = format!(
            "no analyzer back-end is available for language '{}'",
            request.language.label()
        );
        ReviewResult {
            request_id: next_request_id("unified"),
            request: request.clone(),
            report: message.clone(),
            issues: vec![Issue::new(Severity::Info, message, "unified")],
            suggestions,
            score: 0.0,
            metadata: HashMap::from([("fallback".to_string(), "true".to_string())]),
            elapsed,
        }
    }
}

/// Fuse per-backend results into one: issues keep their back-end
/// provenance, the score is recomputed from the merged issue list
/// (never averaged), reports are concatenated under backend headers.
pub fn merge_results(
    request: &ReviewRequest,
    results: Vec<ReviewResult>,
    elapsed: Duration,
) -> ReviewResult {
    let mut issues: Vec<Issue> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut reports: Vec<String> = Vec::new();
    let mut backends: Vec<String> = Vec::new();

    for result in results {
        if let Some(backend) = result.issues.first().map(|i| i.backend.to_string()) {
            backends.push(backend);
        }
        if !result.report.is_empty() {
            reports.push(format!("[{}] {}", result.request_id, result.report));
        }
        issues.extend(result.issues);
        for suggestion in result.suggestions {
            if !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }
    }

    let score = score_issues(&issues);
    let report = if issues.is_empty() {
        "No issues found.".to_string()
    } else {
        reports.join("\n\n")
    };

    ReviewResult {
        request_id: next_request_id("unified"),
        request: request.clone(),
        report,
        issues,
        suggestions,
        score,
        metadata: HashMap::from([("merged_backends".to_string(), backends.join(","))]),
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arkts_request() -> ReviewRequest {
        ReviewRequest::new("q", "@Entry\n@Component\nstruct Hello { build() { Text('hi') } }")
    }

    fn result_with(issues: Vec<Issue>) -> ReviewResult {
        ReviewResult {
            request_id: next_request_id("lint"),
            request: arkts_request(),
            report: "report".to_string(),
            issues,
            suggestions: vec!["fix things".to_string()],
            score: 50.0,
            metadata: HashMap::new(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_routes_dispatch_matrix() {
        let routes = default_routes();
        assert_eq!(routes[&Language::Arkts], vec![BackendId::Lint]);
        assert!(routes[&Language::Cpp].contains(&BackendId::Native));
        assert_eq!(routes[&Language::Python], vec![BackendId::Server]);
        assert!(!routes.contains_key(&Language::Unknown));
    }

    #[test]
    fn test_merge_recomputes_score_from_issues() {
        let error = Issue::new(Severity::Error, "broken", "lint");
        let warning = Issue::new(Severity::Warning, "iffy", "native");
        // Two backends each reporting 50.0 must not average: the merged
        // score comes from the merged issue list (100 - 10 - 4).
        let merged = merge_results(
            &arkts_request(),
            vec![result_with(vec![error]), result_with(vec![warning])],
            Duration::ZERO,
        );
        assert_eq!(merged.score, 86.0);
        assert_eq!(merged.issues.len(), 2);
    }

    #[test]
    fn test_merge_preserves_backend_provenance() {
        let a = Issue::new(Severity::Error, "from lint", "lint");
        let b = Issue::new(Severity::Error, "from server", "server");
        let merged = merge_results(
            &arkts_request(),
            vec![result_with(vec![a]), result_with(vec![b])],
            Duration::ZERO,
        );
        let backends: Vec<&str> = merged.issues.iter().map(|i| i.backend).collect();
        assert_eq!(backends, vec!["lint", "server"]);
    }

    #[test]
    fn test_merge_zero_issues_scores_one_hundred() {
        let merged = merge_results(&arkts_request(), vec![result_with(vec![])], Duration::ZERO);
        assert_eq!(merged.score, 100.0);
        assert_eq!(merged.report, "No issues found.");
    }

    #[test]
    fn test_merge_dedups_suggestions() {
        let merged = merge_results(
            &arkts_request(),
            vec![
                result_with(vec![Issue::new(Severity::Info, "a", "lint")]),
                result_with(vec![Issue::new(Severity::Info, "b", "lint")]),
            ],
            Duration::ZERO,
        );
        assert_eq!(merged.suggestions, vec!["fix things".to_string()]);
    }

    #[tokio::test]
    async fn test_no_backends_yields_fallback() {
        let checker = UnifiedChecker::new(None, None, None, default_routes());
        let result = checker.review(&arkts_request()).await;
        assert_eq!(result.score, 0.0);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Info);
        assert!(!result.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_lint_with_server_enabled_falls_back_for_arkts() {
        // The lint binary does not exist; the server is enabled but
        // does not support arkts — so nothing can run.
        let checker = UnifiedChecker::new(
            Some(LintAnalyzer::new(
                "definitely-not-a-real-linter",
                Duration::from_secs(5),
            )),
            None,
            Some(ServerAnalyzer::new(
                "http://localhost:1",
                "admin",
                "pw",
                "definitely-not-a-real-scanner",
                Duration::from_secs(5),
                Duration::from_millis(10),
                Duration::from_millis(10),
            )),
            default_routes(),
        );
        let result = checker.review(&arkts_request()).await;
        assert_eq!(result.score, 0.0);
        assert_eq!(result.issues[0].severity, Severity::Info);
        assert!(
            result
                .suggestions
                .iter()
                .any(|s| s.contains("server analyzer supports"))
        );
    }
}
