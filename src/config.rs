use std::path::Path;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::search::SearchMode;

const DEFAULT_CONFIG_FILE: &str = ".arkgen/config.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub search: Option<SearchSection>,
    pub llm: Option<LlmSection>,
    pub embedding: Option<EmbeddingSection>,
    pub vector_index: Option<VectorIndexSection>,
    pub scraper: Option<ScraperSection>,
    pub analyzers: Option<AnalyzersSection>,
    pub build: Option<BuildSection>,
    #[serde(rename = "loop")]
    pub loop_: Option<LoopSection>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SearchSection {
    pub collections: Option<Vec<String>>,
    pub default_mode: Option<String>,
    pub max_context_length: Option<usize>,
    pub max_iter: Option<usize>,
    pub fix_max_iter: Option<usize>,
    pub early_stopping: Option<bool>,
    pub route_collection: Option<bool>,
    pub text_window_splitter: Option<bool>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingSection {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VectorIndexSection {
    pub base_url: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScraperSection {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnalyzersSection {
    pub lint: Option<LintSection>,
    pub native: Option<NativeSection>,
    pub server: Option<ServerSection>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LintSection {
    pub enabled: Option<bool>,
    pub binary: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NativeSection {
    pub enabled: Option<bool>,
    pub binary: Option<String>,
    pub cert_rules: Option<bool>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub enabled: Option<bool>,
    pub host_url: Option<String>,
    pub login: Option<String>,
    pub password_env: Option<String>,
    pub scanner: Option<String>,
    pub timeout: Option<u64>,
    pub poll_interval: Option<u64>,
    pub analysis_wait: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoopSection {
    pub max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Merged configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub project: String,
    pub prompts_dir: Option<String>,

    pub collections: Vec<String>,
    pub default_mode: SearchMode,
    pub max_context_length: usize,
    pub max_iter: usize,
    pub fix_max_iter: usize,
    pub early_stopping: bool,
    pub route_collection: bool,
    pub text_window_splitter: bool,
    pub top_k: usize,

    pub llm_base_url: String,
    pub llm_api_key_env: String,
    pub llm_model: String,
    pub llm_timeout: u64,

    pub embedding_base_url: Option<String>,
    pub embedding_api_key_env: String,
    pub embedding_model: String,
    pub embedding_timeout: u64,

    pub vector_index_url: Option<String>,
    pub vector_index_timeout: u64,

    pub scraper_base_url: String,
    pub scraper_api_key_env: String,
    pub scraper_timeout: u64,

    pub lint_enabled: bool,
    pub lint_binary: String,
    pub lint_timeout: u64,

    pub native_enabled: bool,
    pub native_binary: String,
    pub native_cert_rules: bool,
    pub native_timeout: u64,

    pub server_enabled: bool,
    pub server_host_url: String,
    pub server_login: String,
    pub server_password_env: String,
    pub server_scanner: String,
    pub server_timeout: u64,
    pub server_poll_interval: u64,
    pub server_analysis_wait: u64,

    pub build_command: Option<String>,
    pub build_args: Vec<String>,
    pub build_timeout: u64,

    pub max_attempts: u32,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(cli, Path::new("."))
    }

    pub fn load_from(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let file_config = match &cli.config {
            Some(explicit_path) => {
                let path = Path::new(explicit_path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path)?;
                parse_config(&content)?
            }
            None => {
                let path = project_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    let content = std::fs::read_to_string(&path)?;
                    parse_config(&content)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let search = file.search.unwrap_or_default();
    let llm = file.llm.unwrap_or_default();
    let embedding = file.embedding.unwrap_or_default();
    let vector_index = file.vector_index.unwrap_or_default();
    let scraper = file.scraper.unwrap_or_default();
    let analyzers = file.analyzers.unwrap_or_default();
    let lint = analyzers.lint.unwrap_or_default();
    let native = analyzers.native.unwrap_or_default();
    let server = analyzers.server.unwrap_or_default();
    let build = file.build.unwrap_or_default();
    let loop_ = file.loop_.unwrap_or_default();

    let mode_name = cli
        .mode
        .clone()
        .or(search.default_mode)
        .unwrap_or_else(|| "adaptive".to_string());
    let default_mode = SearchMode::parse(&mode_name).ok_or_else(|| {
        Error::ConfigValidation(format!(
            "unknown search mode: {mode_name} (expected: local_only, online_only, \
             hybrid, chain_of_search, adaptive, code_generation)"
        ))
    })?;

    let config = Config {
        project: cli.project.clone(),
        prompts_dir: cli.prompts_dir.clone(),

        collections: search
            .collections
            .unwrap_or_else(|| vec!["harmony_docs".to_string()]),
        default_mode,
        max_context_length: search.max_context_length.unwrap_or(10),
        max_iter: search.max_iter.unwrap_or(4),
        fix_max_iter: search.fix_max_iter.unwrap_or(2),
        early_stopping: search.early_stopping.unwrap_or(false),
        route_collection: search.route_collection.unwrap_or(true),
        text_window_splitter: search.text_window_splitter.unwrap_or(true),
        top_k: search.top_k.unwrap_or(5),

        llm_base_url: llm
            .base_url
            .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
        llm_api_key_env: llm
            .api_key_env
            .unwrap_or_else(|| "ARKGEN_LLM_API_KEY".to_string()),
        llm_model: llm.model.unwrap_or_else(|| "qwen3-32b".to_string()),
        llm_timeout: llm.timeout.unwrap_or(120),

        embedding_base_url: embedding.base_url,
        embedding_api_key_env: embedding
            .api_key_env
            .unwrap_or_else(|| "ARKGEN_LLM_API_KEY".to_string()),
        embedding_model: embedding.model.unwrap_or_else(|| "bge-m3".to_string()),
        embedding_timeout: embedding.timeout.unwrap_or(60),

        vector_index_url: vector_index.base_url,
        vector_index_timeout: vector_index.timeout.unwrap_or(30),

        scraper_base_url: scraper
            .base_url
            .unwrap_or_else(|| "https://api.firecrawl.dev".to_string()),
        scraper_api_key_env: scraper
            .api_key_env
            .unwrap_or_else(|| "FIRECRAWL_API_KEY".to_string()),
        scraper_timeout: scraper.timeout.unwrap_or(60),

        lint_enabled: lint.enabled.unwrap_or(true),
        lint_binary: lint.binary.unwrap_or_else(|| "codelinter".to_string()),
        lint_timeout: lint.timeout.unwrap_or(60),

        native_enabled: native.enabled.unwrap_or(false),
        native_binary: native.binary.unwrap_or_else(|| "cppcheck".to_string()),
        native_cert_rules: native.cert_rules.unwrap_or(true),
        native_timeout: native.timeout.unwrap_or(60),

        server_enabled: server.enabled.unwrap_or(false),
        server_host_url: server
            .host_url
            .unwrap_or_else(|| "http://localhost:9000".to_string()),
        server_login: server.login.unwrap_or_else(|| "admin".to_string()),
        server_password_env: server
            .password_env
            .unwrap_or_else(|| "ARKGEN_SERVER_PASSWORD".to_string()),
        server_scanner: server.scanner.unwrap_or_else(|| "sonar-scanner".to_string()),
        server_timeout: server.timeout.unwrap_or(300),
        server_poll_interval: server.poll_interval.unwrap_or(3),
        server_analysis_wait: server.analysis_wait.unwrap_or(30),

        build_command: build.command,
        build_args: build.args.unwrap_or_default(),
        build_timeout: build.timeout.unwrap_or(600),

        max_attempts: cli.max_attempts.or(loop_.max_attempts).unwrap_or(4),
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.collections.is_empty() {
        return Err(Error::ConfigValidation(
            "collections must not be empty".to_string(),
        ));
    }
    if config.max_attempts == 0 {
        return Err(Error::ConfigValidation(
            "max_attempts must be > 0".to_string(),
        ));
    }
    if config.top_k == 0 {
        return Err(Error::ConfigValidation("top_k must be > 0".to_string()));
    }
    if config.server_poll_interval == 0 {
        return Err(Error::ConfigValidation(
            "poll_interval must be > 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
[search]
collections = ["docs", "api"]
default_mode = "hybrid"
max_iter = 3

[llm]
model = "test-model"

[analyzers.lint]
enabled = true
binary = "mylinter"
"#;
        let config = parse_config(toml).unwrap();
        let search = config.search.unwrap();
        assert_eq!(search.collections.as_deref().unwrap().len(), 2);
        assert_eq!(search.default_mode.as_deref(), Some("hybrid"));
        assert_eq!(config.analyzers.unwrap().lint.unwrap().binary.as_deref(), Some("mylinter"));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config("bogus = 1").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_defaults_applied() {
        let cli = Cli::parse_from(["arkgen"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(config.collections, vec!["harmony_docs".to_string()]);
        assert_eq!(config.default_mode, SearchMode::Adaptive);
        assert_eq!(config.max_context_length, 10);
        assert_eq!(config.max_iter, 4);
        assert_eq!(config.fix_max_iter, 2);
        assert!(!config.early_stopping);
        assert!(config.route_collection);
        assert_eq!(config.max_attempts, 4);
        assert!(config.lint_enabled);
        assert!(!config.server_enabled);
        assert!(config.build_command.is_none());
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = parse_config(r#"
[search]
default_mode = "hybrid"

[loop]
max_attempts = 2
"#)
        .unwrap();
        let cli = Cli::parse_from(["arkgen", "--mode", "local_only", "--max-attempts", "7"]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.default_mode, SearchMode::LocalOnly);
        assert_eq!(config.max_attempts, 7);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let cli = Cli::parse_from(["arkgen", "--mode", "telepathy"]);
        let err = merge(ConfigFile::default(), &cli).unwrap_err();
        assert!(err.to_string().contains("unknown search mode: telepathy"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let cli = Cli::parse_from(["arkgen", "--max-attempts", "0"]);
        let err = merge(ConfigFile::default(), &cli).unwrap_err();
        assert!(err.to_string().contains("max_attempts must be > 0"));
    }

    #[test]
    fn test_empty_collections_rejected() {
        let file = parse_config("[search]\ncollections = []").unwrap();
        let cli = Cli::parse_from(["arkgen"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("collections must not be empty"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let file = parse_config("[analyzers.server]\npoll_interval = 0").unwrap();
        let cli = Cli::parse_from(["arkgen"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("poll_interval must be > 0"));
    }

    #[test]
    fn test_load_missing_default_config_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["arkgen"]);
        let config = Config::load_from(&cli, tmp.path()).unwrap();
        assert_eq!(config.default_mode, SearchMode::Adaptive);
        assert_eq!(config.llm_model, "qwen3-32b");
    }

    #[test]
    fn test_load_explicit_missing_config_errors() {
        let cli = Cli::parse_from(["arkgen", "--config", "/nonexistent/config.toml"]);
        let err = Config::load(&cli).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_load_default_config_from_project_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_dir = tmp.path().join(".arkgen");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[search]\ndefault_mode = \"online_only\"",
        )
        .unwrap();
        let cli = Cli::parse_from(["arkgen"]);
        let config = Config::load_from(&cli, tmp.path()).unwrap();
        assert_eq!(config.default_mode, SearchMode::OnlineOnly);
    }

    #[test]
    fn test_build_section_parsed() {
        let file = parse_config(
            "[build]\ncommand = \"hvigorw\"\nargs = [\"assembleHap\"]\ntimeout = 120",
        )
        .unwrap();
        let cli = Cli::parse_from(["arkgen"]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.build_command.as_deref(), Some("hvigorw"));
        assert_eq!(config.build_args, vec!["assembleHap".to_string()]);
        assert_eq!(config.build_timeout, 120);
    }
}
