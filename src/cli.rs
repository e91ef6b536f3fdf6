use clap::Parser;

/// arkgen — retrieval-augmented ArkTS code generation loop
#[derive(Parser, Debug)]
#[command(name = "arkgen", version, about)]
pub struct Cli {
    /// Target HarmonyOS project directory
    #[arg(long, default_value = ".")]
    pub project: String,

    /// Requirement text (default: read from <project>/README.md)
    #[arg(long)]
    pub requirement: Option<String>,

    /// Run a standalone search instead of the generation loop
    #[arg(long)]
    pub search: Option<String>,

    /// Search mode (local_only, online_only, hybrid, chain_of_search, adaptive)
    #[arg(long)]
    pub mode: Option<String>,

    /// Session key for contextual search history
    #[arg(long)]
    pub session: Option<String>,

    /// Maximum fix attempts before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Path to config file (default: <project>/.arkgen/config.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Prompt template override directory
    #[arg(long)]
    pub prompts_dir: Option<String>,
}
