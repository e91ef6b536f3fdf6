use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use crate::analyzer::{Issue, Severity};
use crate::project::{self, is_project_relative};

/// When filtering would drop every entry of a non-empty list, keep this
/// many from the front instead. Silent "zero real errors" must never
/// mask an actual build failure.
const SAFETY_NET_KEEP: usize = 3;

fn any_match(patterns: &[&str], text: &str) -> bool {
    patterns.iter().any(|p| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    })
}

const SUCCESS_PATTERNS: &[&str] = &[
    r"BUILD SUCCESSFUL",
    r"COMPILE RESULT:PASS",
    r"compilation passed",
    r"\bsuccess\b",
];

const WARNING_PATTERNS: &[&str] = &[r"\bwarning\b", r"\bwarn\b", r"deprecat"];

const STATS_PATTERNS: &[&str] = &[
    r"-?Defects:\s*\d+;\s*Errors:\s*\d+",
    r"COMPILE RESULT:(?:FAIL|PASS)\s*\{ERROR:\d+",
    r"Total.*issues:",
];

/// Extract the authoritative (errors, warnings) counts from the
/// analyzers' own summary lines, when present. Two formats are
/// understood: the ArkTS compiler's
/// `COMPILE RESULT:FAIL {ERROR:n WARN:m}` and the linter's
/// `Defects: d; Errors: n; Warns: m`.
pub fn authoritative_counts(output: &str) -> Option<(usize, usize)> {
    let compile_re = Regex::new(r"COMPILE RESULT:(?:FAIL|PASS)\s*\{ERROR:(\d+)\s*WARN:(\d+)\}").unwrap();
    if let Some(caps) = compile_re.captures(output) {
        let errors = caps[1].parse().ok()?;
        let warnings = caps[2].parse().ok()?;
        info!(errors, warnings, "compiler summary counts");
        return Some((errors, warnings));
    }

    let linter_re = Regex::new(r"-?Defects:\s*\d+;\s*Errors:\s*(\d+);\s*Warns:\s*(\d+)").unwrap();
    if let Some(caps) = linter_re.captures(output) {
        let errors = caps[1].parse().ok()?;
        let warnings = caps[2].parse().ok()?;
        info!(errors, warnings, "linter summary counts");
        return Some((errors, warnings));
    }

    None
}

/// Whether an entry is a real error rather than a success line, a
/// statistics summary, or a warning dressed up as one.
pub fn is_real_error(issue: &Issue) -> bool {
    if any_match(SUCCESS_PATTERNS, &issue.message) {
        return false;
    }
    if any_match(STATS_PATTERNS, &issue.message) {
        return false;
    }
    if issue.severity != Severity::Error {
        return false;
    }
    !any_match(WARNING_PATTERNS, &issue.message)
}

/// Filter raw analyzer entries down to the errors worth fixing.
///
/// Order matters: an authoritative zero short-circuits to empty; the
/// safety net reinstates the first few entries when naive filtering
/// would drop everything; the survivor list is finally truncated to
/// the authoritative count when one is known.
pub fn filter_for_workflow(issues: &[Issue], raw_output: &str) -> Vec<Issue> {
    if issues.is_empty() {
        return Vec::new();
    }

    let counts = authoritative_counts(raw_output);
    if let Some((0, _)) = counts {
        info!("summary reports zero errors, skipping fix round");
        return Vec::new();
    }

    let mut real: Vec<Issue> = issues.iter().filter(|i| is_real_error(i)).cloned().collect();

    if real.is_empty() {
        let keep = SAFETY_NET_KEEP.min(issues.len());
        warn!(
            dropped = issues.len(),
            keep, "filter removed every entry, retaining the first few"
        );
        real = issues[..keep].to_vec();
    }

    if let Some((errors, _)) = counts
        && real.len() > errors
    {
        warn!(
            survivors = real.len(),
            errors, "survivors exceed summary count, truncating"
        );
        real.truncate(errors);
    }

    info!(real = real.len(), "error filtering complete");
    real
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Syntax,
    Import,
    Resource,
    Compilation,
    Type,
    Unknown,
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Syntax => "syntax",
            ErrorType::Import => "import",
            ErrorType::Resource => "resource",
            ErrorType::Compilation => "compilation",
            ErrorType::Type => "type",
            ErrorType::Unknown => "unknown",
        }
    }

    fn weight(&self) -> i32 {
        match self {
            ErrorType::Compilation => 100,
            ErrorType::Syntax => 80,
            ErrorType::Import => 70,
            ErrorType::Type => 60,
            ErrorType::Resource => 50,
            ErrorType::Unknown => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl ErrorSeverity {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::High => "high",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::Low => "low",
        }
    }

    fn weight(&self) -> i32 {
        match self {
            ErrorSeverity::Critical => 40,
            ErrorSeverity::High => 30,
            ErrorSeverity::Medium => 20,
            ErrorSeverity::Low => 10,
        }
    }
}

/// Fixed fix-strategy record per error type.
#[derive(Debug, Clone, Copy)]
pub struct FixStrategy {
    pub approach: &'static str,
    pub can_auto_fix: bool,
    pub priority: &'static str,
}

fn fix_strategy(error_type: ErrorType) -> FixStrategy {
    match error_type {
        ErrorType::Syntax => FixStrategy {
            approach: "syntax_fix",
            can_auto_fix: true,
            priority: "high",
        },
        ErrorType::Import => FixStrategy {
            approach: "import_fix",
            can_auto_fix: true,
            priority: "high",
        },
        ErrorType::Resource => FixStrategy {
            approach: "resource_fix",
            can_auto_fix: true,
            priority: "medium",
        },
        ErrorType::Compilation => FixStrategy {
            approach: "compilation_analysis",
            can_auto_fix: false,
            priority: "critical",
        },
        ErrorType::Type => FixStrategy {
            approach: "type_fix",
            can_auto_fix: true,
            priority: "medium",
        },
        ErrorType::Unknown => FixStrategy {
            approach: "manual_review",
            can_auto_fix: false,
            priority: "low",
        },
    }
}

pub fn classify_type(message: &str) -> ErrorType {
    let table: &[(ErrorType, &[&str])] = &[
        (
            ErrorType::Syntax,
            &[
                r"SyntaxError",
                r"Unexpected token",
                r"Missing semicolon",
                r"Invalid syntax",
            ],
        ),
        (
            ErrorType::Import,
            &[
                r"Cannot resolve symbol",
                r"Module not found",
                r"Import.*not found",
                r"Cannot import",
            ],
        ),
        (
            ErrorType::Resource,
            &[
                r"Resource Pack Error",
                r"Failed to parse.*JSON",
                r"string\.json",
                r"base/element",
            ],
        ),
        (
            ErrorType::Compilation,
            &[
                r"CompileResource",
                r"Tools execution failed",
                r"Build failed",
                r"hvigor ERROR",
            ],
        ),
        (
            ErrorType::Type,
            &[
                r"Type.*not assignable",
                r"Property.*does not exist",
                r"Cannot find name",
            ],
        ),
    ];
    for (error_type, patterns) in table {
        if any_match(patterns, message) {
            return *error_type;
        }
    }
    ErrorType::Unknown
}

pub fn assess_severity(message: &str) -> ErrorSeverity {
    let table: &[(ErrorSeverity, &[&str])] = &[
        (
            ErrorSeverity::Critical,
            &[r"hvigor ERROR", r"Build failed", r"Tools execution failed"],
        ),
        (
            ErrorSeverity::High,
            &[r"SyntaxError", r"Cannot resolve symbol", r"Module not found"],
        ),
        (
            ErrorSeverity::Medium,
            &[r"Resource Pack Error", r"Type.*not assignable"],
        ),
        (ErrorSeverity::Low, &[r"\bWarning\b", r"Unused variable"]),
    ];
    for (severity, patterns) in table {
        if any_match(patterns, message) {
            return *severity;
        }
    }
    ErrorSeverity::Medium
}

/// Classified error, ready to drive a targeted fix round.
#[derive(Debug, Clone)]
pub struct ErrorAnalysis {
    pub error_id: usize,
    pub message: String,
    pub target_file: String,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub root_cause: String,
    pub location_hint: String,
    pub fix_description: String,
    pub can_auto_fix: bool,
    pub search_keywords: Vec<String>,
    /// Type weight + severity weight; higher fixes first.
    pub priority: i32,
}

/// Classify one surviving issue. `known_files` are the project-relative
/// paths the pipeline has generated so far, used for target inference.
pub fn classify(issue: &Issue, error_id: usize, known_files: &[String]) -> ErrorAnalysis {
    let error_type = classify_type(&issue.message);
    let severity = assess_severity(&issue.message);
    let strategy = fix_strategy(error_type);
    let target_file = infer_target_file(&issue.message, &issue.file_path, known_files);

    let location_hint = match issue.line {
        Some(line) => format!("{target_file}:{line}"),
        None => target_file.clone(),
    };

    let mut search_keywords = vec![format!("ArkTS {} error", error_type.label())];
    if let Some(ref rule) = issue.rule_id {
        search_keywords.push(rule.clone());
    }
    let head: String = issue.message.chars().take(60).collect();
    if !head.is_empty() {
        search_keywords.push(head);
    }

    ErrorAnalysis {
        error_id,
        message: issue.message.clone(),
        target_file,
        error_type,
        severity,
        root_cause: format!("{} in generated code", error_type.label()),
        location_hint,
        fix_description: strategy.approach.replace('_', " "),
        can_auto_fix: strategy.can_auto_fix,
        search_keywords,
        priority: error_type.weight() + severity.weight(),
    }
}

/// Assign a project-relative target file to an issue that lacks one.
///
/// Resource-pack messages go to the string resource file, manifest
/// messages to the module manifest, build failures to the first known
/// source file, and everything else to the entry page. A `.ts` entry
/// page is corrected to `.ets`.
pub fn infer_target_file(message: &str, file_path: &str, known_files: &[String]) -> String {
    if !file_path.is_empty() && file_path != "unknown" && is_project_relative(file_path) {
        if let Some(stripped) = file_path.strip_suffix("Index.ts") {
            return format!("{stripped}Index.ets");
        }
        return file_path.to_string();
    }

    let resource_markers = ["Resource Pack Error", "string.json", "base/element"];
    if resource_markers.iter().any(|m| message.contains(m)) {
        return project::STRING_RESOURCE.to_string();
    }

    if message.contains("module.json") {
        return project::MODULE_MANIFEST.to_string();
    }

    let build_markers = ["build", "compilation", "CompileResource", "ArkTS", "@Entry", "@Component"];
    if build_markers.iter().any(|m| message.contains(m)) {
        return known_files
            .iter()
            .find(|f| f.ends_with(".ets"))
            .cloned()
            .unwrap_or_else(|| project::ENTRY_PAGE.to_string());
    }

    project::ENTRY_PAGE.to_string()
}

/// Group classified errors by target file, highest-priority group
/// first.
pub fn group_by_target(analyses: Vec<ErrorAnalysis>) -> Vec<(String, Vec<ErrorAnalysis>)> {
    let mut groups: Vec<(String, Vec<ErrorAnalysis>)> = Vec::new();
    for analysis in analyses {
        match groups.iter_mut().find(|(file, _)| *file == analysis.target_file) {
            Some((_, list)) => list.push(analysis),
            None => groups.push((analysis.target_file.clone(), vec![analysis])),
        }
    }
    for (_, list) in &mut groups {
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    groups.sort_by_key(|(_, list)| {
        std::cmp::Reverse(list.iter().map(|a| a.priority).max().unwrap_or(0))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_issue(message: &str) -> Issue {
        Issue::new(Severity::Error, message, "lint")
    }

    fn warning_issue(message: &str) -> Issue {
        Issue::new(Severity::Warning, message, "lint")
    }

    #[test]
    fn test_counts_from_compiler_summary() {
        let output = "some noise\nCOMPILE RESULT:FAIL {ERROR:2 WARN:5}\nmore";
        assert_eq!(authoritative_counts(output), Some((2, 5)));
    }

    #[test]
    fn test_counts_from_linter_summary() {
        let output = "-Defects: 7; Errors: 3; Warns: 4";
        assert_eq!(authoritative_counts(output), Some((3, 4)));
    }

    #[test]
    fn test_counts_absent() {
        assert_eq!(authoritative_counts("nothing to see"), None);
    }

    #[test]
    fn test_zero_error_summary_clears_list() {
        // Clean compile: three warning entries and a PASS summary.
        let issues = vec![
            warning_issue("deprecated API usage"),
            warning_issue("unused import"),
            warning_issue("prefer const"),
        ];
        let filtered =
            filter_for_workflow(&issues, "COMPILE RESULT:PASS {ERROR:0 WARN:3}");
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_safety_net_then_truncation() {
        // Five entries that all look like warnings, but the summary
        // insists there are two real errors: keep 3, truncate to 2.
        let issues: Vec<Issue> = (0..5)
            .map(|i| error_issue(&format!("warning: suspicious thing {i}")))
            .collect();
        let filtered =
            filter_for_workflow(&issues, "COMPILE RESULT:FAIL {ERROR:2 WARN:0}");
        assert_eq!(filtered.len(), 2);
        assert!(filtered[0].message.contains("thing 0"));
        assert!(filtered[1].message.contains("thing 1"));
    }

    #[test]
    fn test_safety_net_keeps_at_most_three() {
        let issues: Vec<Issue> = (0..5)
            .map(|i| warning_issue(&format!("just a warning {i}")))
            .collect();
        let filtered = filter_for_workflow(&issues, "");
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn test_safety_net_with_short_list() {
        let issues = vec![warning_issue("only one, and it is a warning")];
        let filtered = filter_for_workflow(&issues, "");
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_real_errors_pass_through() {
        let issues = vec![
            error_issue("SyntaxError: Unexpected token '}'"),
            warning_issue("deprecated API"),
            error_issue("BUILD SUCCESSFUL in 4s"),
        ];
        let filtered = filter_for_workflow(&issues, "COMPILE RESULT:FAIL {ERROR:1 WARN:1}");
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].message.contains("SyntaxError"));
    }

    #[test]
    fn test_is_real_error_rejects_stats_lines() {
        assert!(!is_real_error(&error_issue("-Defects: 3; Errors: 1; Warns: 2")));
        assert!(!is_real_error(&error_issue("COMPILE RESULT:PASS {ERROR:0 WARN:0}")));
        assert!(is_real_error(&error_issue("Cannot find name 'Text'")));
    }

    #[test]
    fn test_classify_types() {
        assert_eq!(classify_type("SyntaxError: unexpected end"), ErrorType::Syntax);
        assert_eq!(classify_type("Cannot resolve symbol 'router'"), ErrorType::Import);
        assert_eq!(classify_type("Resource Pack Error in string.json"), ErrorType::Resource);
        assert_eq!(classify_type("hvigor ERROR: Tools execution failed"), ErrorType::Compilation);
        assert_eq!(
            classify_type("Type 'string' is not assignable to type 'number'"),
            ErrorType::Type
        );
        assert_eq!(classify_type("something novel"), ErrorType::Unknown);
    }

    #[test]
    fn test_priority_sums_type_and_severity_weights() {
        let analysis = classify(
            &error_issue("hvigor ERROR: Build failed"),
            1,
            &[],
        );
        // compilation (100) + critical (40)
        assert_eq!(analysis.priority, 140);
        assert!(!analysis.can_auto_fix);

        let analysis = classify(&error_issue("SyntaxError: bad token"), 2, &[]);
        // syntax (80) + high (30)
        assert_eq!(analysis.priority, 110);
        assert!(analysis.can_auto_fix);
    }

    #[test]
    fn test_infer_resource_target() {
        let target = infer_target_file("Resource Pack Error: bad string.json", "", &[]);
        assert_eq!(target, project::STRING_RESOURCE);
    }

    #[test]
    fn test_infer_manifest_target() {
        let target = infer_target_file("failed to parse module.json5", "unknown", &[]);
        assert_eq!(target, project::MODULE_MANIFEST);
    }

    #[test]
    fn test_infer_build_error_prefers_known_source() {
        let known = vec![
            "entry/src/main/module.json5".to_string(),
            "entry/src/main/ets/pages/Home.ets".to_string(),
        ];
        let target = infer_target_file("compilation failed in module entry", "", &known);
        assert_eq!(target, "entry/src/main/ets/pages/Home.ets");
    }

    #[test]
    fn test_infer_default_entry_page() {
        let target = infer_target_file("mysterious failure", "", &[]);
        assert_eq!(target, project::ENTRY_PAGE);
    }

    #[test]
    fn test_infer_corrects_ts_entry_page() {
        let target = infer_target_file("", "entry/src/main/ets/pages/Index.ts", &[]);
        assert_eq!(target, project::ENTRY_PAGE);
    }

    #[test]
    fn test_infer_keeps_valid_project_path() {
        let target = infer_target_file("anything", "entry/src/main/ets/pages/Cart.ets", &[]);
        assert_eq!(target, "entry/src/main/ets/pages/Cart.ets");
    }

    #[test]
    fn test_group_by_target_orders_by_priority() {
        let low = classify(&error_issue("something novel"), 1, &[]);
        let mut high = classify(&error_issue("hvigor ERROR: Build failed"), 2, &[]);
        high.target_file = project::MODULE_MANIFEST.to_string();

        let groups = group_by_target(vec![low, high]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, project::MODULE_MANIFEST);
    }
}
