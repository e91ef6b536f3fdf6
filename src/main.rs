use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use arkgen::analyzer::lint::LintAnalyzer;
use arkgen::analyzer::native::NativeAnalyzer;
use arkgen::analyzer::server::ServerAnalyzer;
use arkgen::chain::{ChainRetriever, ChainSettings};
use arkgen::checker::{UnifiedChecker, default_routes};
use arkgen::cli::Cli;
use arkgen::codegen::CodeGenerator;
use arkgen::config::Config;
use arkgen::llm::HttpLlmClient;
use arkgen::orchestrator::{BuildCheck, LoopSettings, Orchestrator};
use arkgen::project::ProjectLayout;
use arkgen::prompts::PromptEngine;
use arkgen::router::CollectionRouter;
use arkgen::scraper::FirecrawlScraper;
use arkgen::search::{SearchOrchestrator, SearchSettings};
use arkgen::store::{HttpEmbedder, HttpEvidenceStore};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Read an API key from the configured environment variable. Missing
/// keys are tolerated; backends that need one will fail their calls
/// with a clear message instead.
fn resolve_api_key(env_name: &str) -> String {
    match std::env::var(env_name) {
        Ok(key) if !key.is_empty() => key,
        _ => {
            warn!(env = env_name, "api key env var not set");
            String::new()
        }
    }
}

fn build_orchestrator(
    config: &Config,
) -> Orchestrator<HttpLlmClient, HttpEvidenceStore, HttpEmbedder, FirecrawlScraper> {
    let prompts = Arc::new(PromptEngine::new(config.prompts_dir.clone()));

    let llm = Arc::new(HttpLlmClient::new(
        &config.llm_base_url,
        &resolve_api_key(&config.llm_api_key_env),
        &config.llm_model,
        Duration::from_secs(config.llm_timeout),
    ));

    // The chain engine needs both an index and an embedding endpoint;
    // without them local search degrades to placeholders.
    let chain = match (&config.vector_index_url, &config.embedding_base_url) {
        (Some(index_url), Some(embedding_url)) => {
            let store = Arc::new(HttpEvidenceStore::new(
                index_url,
                Duration::from_secs(config.vector_index_timeout),
            ));
            let embedder = Arc::new(HttpEmbedder::new(
                embedding_url,
                &resolve_api_key(&config.embedding_api_key_env),
                &config.embedding_model,
                Duration::from_secs(config.embedding_timeout),
            ));
            let router = CollectionRouter::new(
                llm.clone(),
                prompts.clone(),
                config.collections.clone(),
                config.route_collection,
            );
            Some(ChainRetriever::new(
                llm.clone(),
                store,
                embedder,
                router,
                prompts.clone(),
                ChainSettings {
                    max_iter: config.max_iter,
                    early_stopping: config.early_stopping,
                    text_window_splitter: config.text_window_splitter,
                    top_k: config.top_k,
                },
            ))
        }
        _ => {
            info!("vector index or embedding endpoint not configured, local search disabled");
            None
        }
    };

    let scraper_key = resolve_api_key(&config.scraper_api_key_env);
    let scraper = if scraper_key.is_empty() {
        info!("scraper api key not configured, online search disabled");
        None
    } else {
        Some(Arc::new(FirecrawlScraper::new(
            &config.scraper_base_url,
            &scraper_key,
            Duration::from_secs(config.scraper_timeout),
        )))
    };

    let search = SearchOrchestrator::new(
        llm.clone(),
        chain,
        scraper,
        prompts.clone(),
        SearchSettings {
            default_mode: config.default_mode,
            max_context_length: config.max_context_length,
            top_k: config.top_k,
            fix_max_iter: config.fix_max_iter,
        },
    );

    let lint = config
        .lint_enabled
        .then(|| LintAnalyzer::new(&config.lint_binary, Duration::from_secs(config.lint_timeout)));
    let native = config.native_enabled.then(|| {
        NativeAnalyzer::new(
            &config.native_binary,
            config.native_cert_rules,
            Duration::from_secs(config.native_timeout),
        )
    });
    let server = config.server_enabled.then(|| {
        ServerAnalyzer::new(
            &config.server_host_url,
            &config.server_login,
            &resolve_api_key(&config.server_password_env),
            &config.server_scanner,
            Duration::from_secs(config.server_timeout),
            Duration::from_secs(config.server_poll_interval),
            Duration::from_secs(config.server_analysis_wait),
        )
    });
    let checker = UnifiedChecker::new(lint, native, server, default_routes());

    let build = config.build_command.as_ref().map(|command| BuildCheck {
        command: command.clone(),
        args: config.build_args.clone(),
        timeout: Duration::from_secs(config.build_timeout),
    });

    Orchestrator::new(
        search,
        CodeGenerator::new(llm, prompts),
        checker,
        ProjectLayout::new(&config.project),
        build,
        LoopSettings {
            max_attempts: config.max_attempts,
        },
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("arkgen starting");

    let config = match Config::load_from(&cli, Path::new(&cli.project)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    info!(project = %config.project, mode = config.default_mode.label(), "config loaded");

    let orchestrator = build_orchestrator(&config);

    if let Some(ref query) = cli.search {
        match orchestrator
            .search()
            .search(query, config.default_mode, cli.session.as_deref())
            .await
        {
            Ok(result) => {
                println!("{}", result.answer);
                println!();
                for source in &result.sources {
                    println!("- [{}] {} {}", source.provenance.label(), source.title, source.reference);
                }
                println!(
                    "\nmode: {}  type: {}  confidence: {:.2}  tokens: {}  elapsed: {:?}",
                    result.mode_used.label(),
                    result.query_type.label(),
                    result.confidence,
                    result.token_usage,
                    result.elapsed,
                );
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let report = orchestrator.run(cli.requirement.clone(), cli.session.clone()).await;

    println!(
        "resolved: {}  attempts: {}  files: {}  remaining issues: {}  tokens: {}  elapsed: {:?}",
        report.resolved,
        report.attempts,
        report.files.len(),
        report.remaining_issues.len(),
        report.token_usage,
        report.elapsed,
    );
    for diagnostic in &report.diagnostics {
        println!("diagnostic: {diagnostic}");
    }
    for issue in &report.remaining_issues {
        println!(
            "issue [{}] {}: {}",
            issue.backend,
            issue.severity.label(),
            issue.message
        );
    }

    if !report.resolved {
        std::process::exit(1);
    }
}
