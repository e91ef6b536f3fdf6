use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::analyzer::{Issue, ReviewRequest, Severity};
use crate::checker::UnifiedChecker;
use crate::codegen::{CodeGenerator, FixRequest, ProjectPlan, write_file};
use crate::error::Error;
use crate::filter::{ErrorAnalysis, classify, filter_for_workflow, group_by_target};
use crate::llm::LlmClient;
use crate::process::{ProcessConfig, spawn_and_capture};
use crate::project::ProjectLayout;
use crate::scraper::OnlineScraper;
use crate::search::{SearchMode, SearchOrchestrator};
use crate::store::{Embedder, EvidenceStore, RetrievedItem};

/// Optional project-level build check (hvigor-style). Its transcript
/// feeds the noise filter, which understands the compiler's
/// `COMPILE RESULT` summary lines.
#[derive(Debug, Clone)]
pub struct BuildCheck {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_attempts: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self { max_attempts: 4 }
    }
}

/// Explicit loop state: the trampoline below is the only place where
/// attempt budgets and termination are decided.
#[derive(Debug)]
pub struct LoopState {
    pub requirement: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_issues: Vec<Issue>,
    pub last_code: HashMap<String, String>,
    pub session: Option<String>,
}

/// What one `run` call always returns; the loop never throws.
#[derive(Debug)]
pub struct RunReport {
    pub resolved: bool,
    pub attempts: u32,
    pub files: HashMap<String, String>,
    pub remaining_issues: Vec<Issue>,
    pub diagnostics: Vec<String>,
    pub token_usage: u64,
    pub elapsed: Duration,
}

enum Phase {
    Plan,
    Generate {
        references: Vec<RetrievedItem>,
    },
    Check,
    Filter {
        issues: Vec<Issue>,
        raw_output: String,
    },
    Analyze {
        survivors: Vec<Issue>,
    },
    Research {
        groups: Vec<(String, Vec<ErrorAnalysis>)>,
    },
    Fix {
        groups: Vec<(String, Vec<ErrorAnalysis>)>,
        references: HashMap<String, Vec<RetrievedItem>>,
    },
    Done {
        resolved: bool,
    },
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Generate { .. } => "generate",
            Phase::Check => "check",
            Phase::Filter { .. } => "filter",
            Phase::Analyze { .. } => "analyze",
            Phase::Research { .. } => "research",
            Phase::Fix { .. } => "fix",
            Phase::Done { .. } => "done",
        }
    }
}

/// End-to-end control loop: plan → generate → check → filter, and on
/// remaining errors analyze → research → fix → re-check, until the
/// code is clean or the attempt budget runs out.
pub struct Orchestrator<L, E, M, S> {
    search: SearchOrchestrator<L, E, M, S>,
    generator: CodeGenerator<L>,
    checker: UnifiedChecker,
    layout: ProjectLayout,
    build: Option<BuildCheck>,
    settings: LoopSettings,
}

impl<L, E, M, S> Orchestrator<L, E, M, S>
where
    L: LlmClient,
    E: EvidenceStore,
    M: Embedder,
    S: OnlineScraper,
{
    pub fn new(
        search: SearchOrchestrator<L, E, M, S>,
        generator: CodeGenerator<L>,
        checker: UnifiedChecker,
        layout: ProjectLayout,
        build: Option<BuildCheck>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            search,
            generator,
            checker,
            layout,
            build,
            settings,
        }
    }

    pub fn search(&self) -> &SearchOrchestrator<L, E, M, S> {
        &self.search
    }

    /// Run the loop for one requirement. When `requirement` is `None`
    /// it is read from the project README.
    pub async fn run(&self, requirement: Option<String>, session: Option<String>) -> RunReport {
        let started = Instant::now();
        let mut diagnostics: Vec<String> = Vec::new();
        let mut token_usage: u64 = 0;

        let requirement = match requirement.map(Ok).unwrap_or_else(|| self.layout.read_requirement())
        {
            Ok(r) => r,
            Err(e) => {
                return RunReport {
                    resolved: false,
                    attempts: 0,
                    files: HashMap::new(),
                    remaining_issues: Vec::new(),
                    diagnostics: vec![format!("no requirement: {e}")],
                    token_usage: 0,
                    elapsed: started.elapsed(),
                };
            }
        };

        let plan = ProjectPlan::for_requirement(&requirement);
        let mut state = LoopState {
            requirement,
            attempt: 0,
            max_attempts: self.settings.max_attempts,
            last_issues: Vec::new(),
            last_code: HashMap::new(),
            session,
        };

        let mut phase = Phase::Plan;
        let resolved = loop {
            info!(phase = phase.name(), attempt = state.attempt, "loop phase");
            phase = match phase {
                Phase::Plan => {
                    let references = match self
                        .search
                        .search(&state.requirement, SearchMode::Adaptive, state.session.as_deref())
                        .await
                    {
                        Ok(result) => {
                            token_usage += result.token_usage;
                            result.sources
                        }
                        Err(e) => {
                            warn!(error = %e, "precedent search failed, generating without references");
                            diagnostics.push(format!("plan search failed: {e}"));
                            Vec::new()
                        }
                    };
                    Phase::Generate { references }
                }

                Phase::Generate { references } => {
                    match self
                        .generate_all(&plan, &state.requirement, &references, &mut token_usage)
                        .await
                    {
                        Ok(files) => {
                            state.last_code.extend(files);
                            Phase::Check
                        }
                        Err(e) => {
                            diagnostics.push(format!(
                                "generation failed on attempt {}: {e}",
                                state.attempt
                            ));
                            state.attempt += 1;
                            if state.attempt >= state.max_attempts {
                                Phase::Done { resolved: false }
                            } else {
                                Phase::Generate { references }
                            }
                        }
                    }
                }

                Phase::Check => {
                    let (issues, raw_output) = self.check_all(&state).await;
                    Phase::Filter { issues, raw_output }
                }

                Phase::Filter { issues, raw_output } => {
                    let survivors = filter_for_workflow(&issues, &raw_output);
                    state.last_issues = survivors.clone();
                    if !survivors.iter().any(|i| i.severity == Severity::Error) {
                        Phase::Done { resolved: true }
                    } else if state.attempt >= state.max_attempts {
                        warn!(attempts = state.attempt, "attempt budget exhausted");
                        Phase::Done { resolved: false }
                    } else {
                        Phase::Analyze { survivors }
                    }
                }

                Phase::Analyze { survivors } => {
                    let known: Vec<String> = state.last_code.keys().cloned().collect();
                    let analyses: Vec<ErrorAnalysis> = survivors
                        .iter()
                        .enumerate()
                        .map(|(i, issue)| classify(issue, i + 1, &known))
                        .collect();
                    let groups = group_by_target(analyses);
                    info!(groups = groups.len(), "errors grouped by target file");
                    Phase::Research { groups }
                }

                Phase::Research { groups } => {
                    let mut references = HashMap::new();
                    for (file, analyses) in &groups {
                        let query = research_query(analyses);
                        match self.search.research(&query).await {
                            Ok((items, tokens)) => {
                                token_usage += tokens;
                                references.insert(file.clone(), items);
                            }
                            Err(e) => {
                                warn!(%file, error = %e, "research failed for error group");
                                diagnostics.push(format!("research for {file} failed: {e}"));
                                references.insert(file.clone(), Vec::new());
                            }
                        }
                    }
                    Phase::Fix { groups, references }
                }

                Phase::Fix { groups, references } => {
                    state.attempt += 1;
                    for (file, analyses) in &groups {
                        let current = self.current_content(&state, file);
                        let request = FixRequest {
                            path: file,
                            requirement: &state.requirement,
                            current_code: &current,
                            analyses,
                            raw_issues: &[],
                            raw_excerpts: &[],
                            references: references.get(file).map(Vec::as_slice).unwrap_or(&[]),
                        };
                        match self.generator.fix_file(&request).await {
                            Ok((content, tokens)) => {
                                token_usage += tokens;
                                match write_file(self.layout.root(), file, &content) {
                                    Ok(()) => {
                                        state.last_code.insert(file.clone(), content);
                                    }
                                    Err(e) => {
                                        warn!(%file, error = %e, "write failed after fix");
                                        diagnostics.push(format!("write of {file} failed: {e}"));
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(%file, error = %e, "fix round failed");
                                diagnostics.push(format!(
                                    "fix of {file} failed on attempt {}: {e}",
                                    state.attempt
                                ));
                            }
                        }
                    }
                    Phase::Check
                }

                Phase::Done { resolved } => break resolved,
            };
        };

        info!(
            resolved,
            attempts = state.attempt,
            issues = state.last_issues.len(),
            "loop finished"
        );
        RunReport {
            resolved,
            attempts: state.attempt,
            files: state.last_code,
            remaining_issues: state.last_issues,
            diagnostics,
            token_usage,
            elapsed: started.elapsed(),
        }
    }

    async fn generate_all(
        &self,
        plan: &ProjectPlan,
        requirement: &str,
        references: &[RetrievedItem],
        token_usage: &mut u64,
    ) -> crate::error::Result<HashMap<String, String>> {
        let mut files = HashMap::new();
        for file_plan in &plan.files {
            let (content, tokens) = self
                .generator
                .generate_file(file_plan, requirement, references)
                .await?;
            *token_usage += tokens;
            write_file(self.layout.root(), &file_plan.path, &content)?;
            files.insert(file_plan.path.clone(), content);
        }
        Ok(files)
    }

    /// Review every generated file through the unified checker and, when
    /// configured, run the project-level build. Returns all issues plus
    /// the combined raw transcript for the noise filter.
    async fn check_all(&self, state: &LoopState) -> (Vec<Issue>, String) {
        let mut issues = Vec::new();
        let mut raw_parts = Vec::new();

        for (path, code) in &state.last_code {
            let request = ReviewRequest::new(&state.requirement, code);
            let result = self.checker.review(&request).await;
            info!(
                %path,
                score = result.score,
                found = result.issues.len(),
                "file reviewed"
            );
            raw_parts.push(result.report.clone());
            let mut file_issues = result.issues;
            for issue in &mut file_issues {
                if issue.file_path.is_empty() {
                    issue.file_path = path.clone();
                }
            }
            issues.extend(file_issues);
        }

        if let Some(ref build) = self.build {
            let (build_issues, transcript) = self.run_build(build).await;
            issues.extend(build_issues);
            raw_parts.push(transcript);
        }

        (issues, raw_parts.join("\n"))
    }

    async fn run_build(&self, build: &BuildCheck) -> (Vec<Issue>, String) {
        let config = ProcessConfig {
            command: build.command.clone(),
            args: build.args.clone(),
            working_dir: self.layout.root().to_path_buf(),
            timeout: Some(build.timeout),
            log_prefix: "build".to_string(),
            env: Vec::new(),
            stdin_data: None,
        };
        match spawn_and_capture(config).await {
            Ok(output) => {
                let transcript = output.combined();
                if output.success() {
                    (Vec::new(), transcript)
                } else {
                    let issue = Issue::new(
                        Severity::Error,
                        format!("project build failed with exit code {}", output.exit_code),
                        "build",
                    );
                    (vec![issue], transcript)
                }
            }
            Err(Error::ProcessTimeout(after)) => {
                let issue = Issue::new(
                    Severity::Error,
                    format!("project build timed out after {after:?}"),
                    "build",
                );
                (vec![issue], String::new())
            }
            Err(e) => {
                let issue = Issue::new(
                    Severity::Error,
                    format!("project build could not run: {e}"),
                    "build",
                );
                (vec![issue], String::new())
            }
        }
    }

    fn current_content(&self, state: &LoopState, file: &str) -> String {
        if let Some(content) = state.last_code.get(file) {
            return content.clone();
        }
        std::fs::read_to_string(self.layout.absolute(file)).unwrap_or_default()
    }
}

/// One search query per error group, built from the highest-priority
/// error's keywords.
fn research_query(analyses: &[ErrorAnalysis]) -> String {
    match analyses.first() {
        Some(top) => format!(
            "HarmonyOS ArkTS {} {}",
            top.error_type.label(),
            top.search_keywords.join(" ")
        ),
        None => "HarmonyOS ArkTS compilation error".to_string(),
    }
}
