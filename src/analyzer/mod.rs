pub mod lint;
pub mod native;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Canonical issue severity. Each back-end maps its tool-native levels
/// onto this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One normalized finding from an analyzer back-end.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    /// Project-relative path; empty when the tool reported none.
    pub file_path: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub rule_id: Option<String>,
    pub category: Option<String>,
    pub fix_hint: Option<String>,
    /// Tool-native kind (BUG, VULNERABILITY, CODE_SMELL, SECURITY_HOTSPOT).
    pub kind: Option<String>,
    /// Tool-native severity (BLOCKER, CRITICAL, MAJOR, ...).
    pub raw_severity: Option<String>,
    /// Identifier of the back-end that produced this issue.
    pub backend: &'static str,
}

impl Issue {
    pub fn new(severity: Severity, message: impl Into<String>, backend: &'static str) -> Self {
        Self {
            severity,
            message: message.into(),
            file_path: String::new(),
            line: None,
            column: None,
            rule_id: None,
            category: None,
            fix_hint: None,
            kind: None,
            raw_severity: None,
            backend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Arkts,
    Typescript,
    Javascript,
    Java,
    Python,
    C,
    Cpp,
    Vue,
    Html,
    Css,
    Json,
    Unknown,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arkts" => Some(Language::Arkts),
            "typescript" | "ts" => Some(Language::Typescript),
            "javascript" | "js" => Some(Language::Javascript),
            "java" => Some(Language::Java),
            "python" => Some(Language::Python),
            "c" => Some(Language::C),
            "cpp" | "c++" => Some(Language::Cpp),
            "vue" => Some(Language::Vue),
            "html" => Some(Language::Html),
            "css" => Some(Language::Css),
            "json" => Some(Language::Json),
            "unknown" => Some(Language::Unknown),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Language::Arkts => "arkts",
            Language::Typescript => "typescript",
            Language::Javascript => "javascript",
            Language::Java => "java",
            Language::Python => "python",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Vue => "vue",
            Language::Html => "html",
            Language::Css => "css",
            Language::Json => "json",
            Language::Unknown => "unknown",
        }
    }

    /// Source file extension used when materializing a code blob for an
    /// external tool.
    pub fn source_extension(&self) -> &'static str {
        match self {
            Language::Arkts => "ets",
            Language::Typescript => "ts",
            Language::Javascript => "js",
            Language::Java => "java",
            Language::Python => "py",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Vue => "vue",
            Language::Html => "html",
            Language::Css => "css",
            Language::Json => "json",
            Language::Unknown => "txt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewType {
    Comprehensive,
    Syntax,
    Security,
    Performance,
}

impl ReviewType {
    pub fn label(&self) -> &'static str {
        match self {
            ReviewType::Comprehensive => "comprehensive",
            ReviewType::Syntax => "syntax",
            ReviewType::Security => "security",
            ReviewType::Performance => "performance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub original_query: String,
    pub code: String,
    pub language: Language,
    pub review_type: ReviewType,
    pub metadata: HashMap<String, String>,
}

impl ReviewRequest {
    pub fn new(original_query: &str, code: &str) -> Self {
        Self {
            original_query: original_query.to_string(),
            language: detect_language(code),
            code: code.to_string(),
            review_type: ReviewType::Comprehensive,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub request_id: String,
    pub request: ReviewRequest,
    pub report: String,
    pub issues: Vec<Issue>,
    pub suggestions: Vec<String>,
    /// 0..=100; 100 means no decrementing issues.
    pub score: f64,
    pub metadata: HashMap<String, String>,
    pub elapsed: Duration,
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique review request id.
pub fn next_request_id(backend: &str) -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{backend}-{n}")
}

/// The per-backend analysis surface. `review` never fails: timeouts,
/// unsupported languages and tool breakage all come back as shaped
/// results.
pub trait Analyzer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether the external tool can be reached. Read-only probe.
    fn is_available(&self) -> bool;

    fn review(
        &self,
        request: &ReviewRequest,
    ) -> impl std::future::Future<Output = ReviewResult> + Send;
}

/// Shape a "language not supported" result (score 0, never an error).
pub fn unsupported_result(backend: &'static str, request: &ReviewRequest) -> ReviewResult {
    ReviewResult {
        request_id: next_request_id(backend),
        request: request.clone(),
        report: format!(
            "{backend} does not support language '{}'",
            request.language.label()
        ),
        issues: Vec::new(),
        suggestions: Vec::new(),
        score: 0.0,
        metadata: HashMap::from([("unsupported".to_string(), "true".to_string())]),
        elapsed: Duration::ZERO,
    }
}

/// Shape an analyzer-timeout result: one error-severity issue naming
/// the tool, so the control loop sees the failure without dying.
pub fn timeout_result(
    backend: &'static str,
    request: &ReviewRequest,
    after: Duration,
    elapsed: Duration,
) -> ReviewResult {
    ReviewResult {
        request_id: next_request_id(backend),
        request: request.clone(),
        report: format!("{backend} timed out after {after:?}"),
        issues: vec![Issue::new(
            Severity::Error,
            format!("analyzer '{backend}' timed out after {after:?}"),
            backend,
        )],
        suggestions: Vec::new(),
        score: 0.0,
        metadata: HashMap::from([("timeout".to_string(), "true".to_string())]),
        elapsed,
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Published per-issue score decrements, by kind and tool severity.
/// Issues without a tool kind fall back to the canonical severity;
/// security hotspots are surfaced but not scored.
pub fn issue_decrement(issue: &Issue) -> f64 {
    let band = match issue.raw_severity.as_deref() {
        Some("BLOCKER") | Some("CRITICAL") => 0,
        Some("MAJOR") => 1,
        _ => 2,
    };
    match issue.kind.as_deref() {
        Some("BUG") => [20.0, 10.0, 5.0][band],
        Some("VULNERABILITY") => [25.0, 15.0, 8.0][band],
        Some("CODE_SMELL") => [8.0, 4.0, 2.0][band],
        Some(_) => 0.0,
        None => match issue.severity {
            Severity::Error => 10.0,
            Severity::Warning => 4.0,
            Severity::Info => 0.0,
        },
    }
}

/// Quality score: start at 100, decrement per issue, clamp to 0.
pub fn score_issues(issues: &[Issue]) -> f64 {
    let total: f64 = issues.iter().map(issue_decrement).sum();
    (100.0 - total).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Language detection
// ---------------------------------------------------------------------------

const ARKTS_DECORATORS: &[&str] = &[
    "@entry",
    "@component",
    "@state",
    "@prop",
    "@link",
    "@provide",
    "@consume",
    "@objectlink",
    "@observed",
    "@watch",
    "@builder",
    "@extend",
    "@styles",
    "@preview",
];

const ARKTS_KEYWORDS: &[&str] = &[
    "struct ",
    "build()",
    "abouttoappear",
    "abouttodisappear",
    "onpageshow",
    "onpagehide",
    "onbackpress",
];

const ARKTS_UI_COMPONENTS: &[&str] = &[
    "column(", "row(", "stack(", "flex(", "text(", "button(", "image(", "list(", "listitem(",
    "grid(", "griditem(", "scroll(",
];

/// Prioritized cascade over the code text. ArkTS markers win, then
/// TypeScript, then JavaScript, then the remaining languages; JSON is
/// tried last via an actual parse attempt.
pub fn detect_language(code: &str) -> Language {
    let lower = code.to_lowercase();

    if ARKTS_DECORATORS.iter().any(|d| lower.contains(d))
        || ARKTS_KEYWORDS.iter().any(|k| lower.contains(k))
        || lower.contains(".ets")
        || lower.contains("export struct")
    {
        return Language::Arkts;
    }
    if ARKTS_UI_COMPONENTS.iter().any(|c| lower.contains(c)) && lower.contains("struct") {
        return Language::Arkts;
    }

    let ts_indicators = [
        "interface ",
        "type ",
        "enum ",
        "namespace ",
        "declare ",
        "import type",
        "export type",
        "as const",
        "readonly ",
        "keyof ",
        "implements ",
    ];
    let ts_generics = ["<T>", "<T,", "<T extends", "Array<", "Promise<"];
    let ts_annotations = [
        ": string", ": number", ": boolean", ": object", ": any", ": void",
    ];
    if ts_indicators.iter().any(|i| lower.contains(i))
        || ts_generics.iter().any(|g| code.contains(g))
        || ts_annotations.iter().any(|a| code.contains(a))
    {
        return Language::Typescript;
    }

    let js_indicators = [
        "function ",
        "var ",
        "let ",
        "const ",
        "import ",
        "export ",
        "class ",
        "extends ",
        "super(",
        "this.",
        "prototype.",
        "=>",
        "require(",
        "module.exports",
    ];
    if js_indicators.iter().any(|i| lower.contains(i)) {
        return Language::Javascript;
    }

    let java_indicators = [
        "public class",
        "private class",
        "public static void main",
        "package ",
        "import java.",
        "system.out.",
        "string[]",
        "arraylist<",
    ];
    if java_indicators.iter().any(|i| lower.contains(i)) {
        return Language::Java;
    }

    let python_indicators = [
        "def ",
        "elif ",
        "if __name__",
        "print(",
        "self.",
        "lambda ",
        "yield ",
        "async def",
    ];
    if python_indicators.iter().any(|i| lower.contains(i)) {
        return Language::Python;
    }

    let cpp_indicators = ["std::", "using namespace", "cout <<", "cin >>", "endl"];
    let c_indicators = ["#include", "int main", "printf(", "scanf(", "malloc(", "free("];
    if cpp_indicators.iter().any(|i| code.contains(i)) {
        return Language::Cpp;
    }
    if c_indicators.iter().any(|i| lower.contains(i)) {
        return Language::C;
    }

    let vue_indicators = [
        "<template>", "<script>", "<style>", "v-if", "v-for", "v-model", "@click",
    ];
    if vue_indicators.iter().any(|i| lower.contains(i)) {
        return Language::Vue;
    }

    let html_indicators = [
        "<!doctype", "<html", "<head>", "<body>", "<div", "<span", "<a href", "<img src",
    ];
    if html_indicators.iter().any(|i| lower.contains(i)) {
        return Language::Html;
    }

    if code.matches('{').count() > 2
        && code.matches('}').count() > 2
        && code.contains(':')
        && code.contains(';')
    {
        let css_indicators = [
            "color:", "background:", "margin:", "padding:", "display:", "position:", "font-",
        ];
        if css_indicators.iter().any(|i| lower.contains(i)) {
            return Language::Css;
        }
    }

    let trimmed = code.trim();
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
            return Language::Json;
        }
    }

    Language::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARKTS_FIXTURE: &str =
        "@Entry\n@Component\nstruct Hello {\n  build() {\n    Text('hi')\n  }\n}";
    const TS_FIXTURE: &str = "interface User {\n  name: string;\n}\n";
    const JS_FIXTURE: &str = "function add(a, b) {\n  return a + b;\n}\n";
    const PY_FIXTURE: &str = "def main():\n    print('hi')\n";
    const CPP_FIXTURE: &str =
        "#include <iostream>\nint main() {\n  std::cout << \"hi\";\n  return 0;\n}\n";
    const JSON_FIXTURE: &str = "{\"module\": {\"name\": \"entry\"}}";

    #[test]
    fn test_detect_arkts_from_decorators() {
        assert_eq!(detect_language(ARKTS_FIXTURE), Language::Arkts);
    }

    #[test]
    fn test_detect_arkts_beats_typescript() {
        let code = "@State count: number = 0";
        assert_eq!(detect_language(code), Language::Arkts);
    }

    #[test]
    fn test_detect_typescript() {
        assert_eq!(detect_language(TS_FIXTURE), Language::Typescript);
    }

    #[test]
    fn test_detect_javascript() {
        assert_eq!(detect_language(JS_FIXTURE), Language::Javascript);
    }

    #[test]
    fn test_detect_python() {
        assert_eq!(detect_language(PY_FIXTURE), Language::Python);
    }

    #[test]
    fn test_detect_cpp() {
        assert_eq!(detect_language(CPP_FIXTURE), Language::Cpp);
    }

    #[test]
    fn test_detect_json_requires_full_parse() {
        assert_eq!(detect_language(JSON_FIXTURE), Language::Json);
        assert_eq!(detect_language("{not valid json}"), Language::Unknown);
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect_language("just some prose"), Language::Unknown);
    }

    #[test]
    fn test_detection_stable_under_whitespace() {
        for fixture in [ARKTS_FIXTURE, TS_FIXTURE, JS_FIXTURE, PY_FIXTURE, CPP_FIXTURE] {
            let original = detect_language(fixture);
            let padded = format!("\n\n  {}  \n\n", fixture);
            assert_eq!(detect_language(&padded), original, "fixture: {fixture}");
        }
        // JSON must stay structurally intact, so pad outside the braces only.
        let padded = format!("\n  {JSON_FIXTURE}  \n");
        assert_eq!(detect_language(&padded), Language::Json);
    }

    #[test]
    fn test_score_clamps_at_zero() {
        let mut bug = Issue::new(Severity::Error, "bug", "server");
        bug.kind = Some("VULNERABILITY".to_string());
        bug.raw_severity = Some("BLOCKER".to_string());
        let issues: Vec<Issue> = std::iter::repeat_with(|| bug.clone()).take(6).collect();
        assert_eq!(score_issues(&issues), 0.0);
    }

    #[test]
    fn test_score_one_hundred_without_decrementing_issues() {
        assert_eq!(score_issues(&[]), 100.0);
        let info = Issue::new(Severity::Info, "note", "lint");
        assert_eq!(score_issues(&[info]), 100.0);
    }

    #[test]
    fn test_score_table_by_kind_and_band() {
        let mut smell = Issue::new(Severity::Warning, "smell", "server");
        smell.kind = Some("CODE_SMELL".to_string());
        smell.raw_severity = Some("MAJOR".to_string());
        assert_eq!(score_issues(std::slice::from_ref(&smell)), 96.0);

        let mut bug = Issue::new(Severity::Error, "bug", "server");
        bug.kind = Some("BUG".to_string());
        bug.raw_severity = Some("CRITICAL".to_string());
        assert_eq!(score_issues(std::slice::from_ref(&bug)), 80.0);

        let mut hotspot = Issue::new(Severity::Warning, "hotspot", "server");
        hotspot.kind = Some("SECURITY_HOTSPOT".to_string());
        assert_eq!(score_issues(std::slice::from_ref(&hotspot)), 100.0);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = next_request_id("lint");
        let b = next_request_id("lint");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unsupported_result_shape() {
        let request = ReviewRequest::new("q", "def main():\n    print('x')\n");
        let result = unsupported_result("lint", &request);
        assert_eq!(result.score, 0.0);
        assert!(result.issues.is_empty());
        assert!(result.report.contains("does not support"));
    }

    #[test]
    fn test_timeout_result_is_error_severity() {
        let request = ReviewRequest::new("q", "code");
        let result = timeout_result(
            "native",
            &request,
            Duration::from_secs(30),
            Duration::from_secs(31),
        );
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Error);
        assert!(result.issues[0].message.contains("native"));
    }
}
