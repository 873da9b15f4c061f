use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PackwrightError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("plan error: {0}")]
    PlanError(String),

    #[error("dependency error: {0}")]
    DependencyError(String),

    #[error("duplicate package: {0}")]
    DuplicatePackage(String),

    #[error("registry error: {0}")]
    RegistryError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("vcs error: {0}")]
    VcsError(String),

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("toolchain error: {0}")]
    ToolchainError(String),

    #[error("report error: {path}: {message}")]
    ReportError { path: PathBuf, message: String },

    #[error("TOML deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PackwrightError>;
