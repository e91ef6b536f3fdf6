use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("retriever error: {0}")]
    Retriever(String),

    #[error("scraper error: {0}")]
    Scraper(String),

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("process timed out after {0:?}")]
    ProcessTimeout(Duration),

    #[error("prompt error: {0}")]
    Prompt(String),
}

pub type Result<T> = std::result::Result<T, Error>;
