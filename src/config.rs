use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PackwrightError, Result};
use crate::toolchain::ToolchainCommands;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_agent_registry")]
    pub agent_registry: PathBuf,
    #[serde(default = "default_git_user")]
    pub git_user: String,
    #[serde(default = "default_git_email")]
    pub git_email: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_builds: usize,
    #[serde(default = "default_attempts")]
    pub max_coordinator_attempts: u32,
    #[serde(default = "default_attempts")]
    pub max_quality_fix_attempts: u32,
    /// Seconds before a build/test/quality subprocess is killed.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: u64,
    /// Seconds before an agent run is killed.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: u64,
    #[serde(default)]
    pub build_command: Vec<String>,
    #[serde(default)]
    pub test_command: Vec<String>,
    #[serde(default)]
    pub quality_command: Vec<String>,
    #[serde(default)]
    pub publish_command: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Seconds for registry and metadata calls.
    #[serde(default = "default_registry_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StatusConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_retry")]
    pub retry_count: u32,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}
fn default_agent_registry() -> PathBuf {
    PathBuf::from("./agents.toml")
}
fn default_git_user() -> String {
    "packwright".to_string()
}
fn default_git_email() -> String {
    "packwright@localhost".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_attempts() -> u32 {
    3
}
fn default_tool_timeout() -> u64 {
    600
}
fn default_agent_timeout() -> u64 {
    1800
}
fn default_registry_url() -> String {
    "https://registry.npmjs.org".to_string()
}
fn default_registry_timeout() -> u64 {
    60
}
fn default_retry() -> u32 {
    3
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            reports_dir: default_reports_dir(),
            agent_registry: default_agent_registry(),
            git_user: default_git_user(),
            git_email: default_git_email(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: default_max_concurrent(),
            max_coordinator_attempts: default_attempts(),
            max_quality_fix_attempts: default_attempts(),
            tool_timeout: default_tool_timeout(),
            agent_timeout: default_agent_timeout(),
            build_command: Vec::new(),
            test_command: Vec::new(),
            quality_command: Vec::new(),
            publish_command: Vec::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            token: String::new(),
            timeout: default_registry_timeout(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { retry_count: default_retry() }
    }
}

impl BuildConfig {
    /// Toolchain command lines, falling back to the npm defaults for any
    /// command the config leaves empty.
    pub fn toolchain_commands(&self) -> ToolchainCommands {
        let defaults = ToolchainCommands::default();
        ToolchainCommands {
            build: pick(&self.build_command, defaults.build),
            test: pick(&self.test_command, defaults.test),
            quality: pick(&self.quality_command, defaults.quality),
            publish: pick(&self.publish_command, defaults.publish),
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout)
    }
}

fn pick(configured: &[String], fallback: Vec<String>) -> Vec<String> {
    if configured.is_empty() {
        fallback
    } else {
        configured.to_vec()
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Overlay one parsed config file onto the accumulated table.
///
/// Packwright's config is a fixed set of flat sections, so the unit of
/// override is a single key inside a section: a project file that sets only
/// `[build] max_concurrent_builds` must not wipe out the user's registry
/// settings. There is nothing nested below a section, so no recursion.
fn overlay_config(base: &mut toml::Table, layer: toml::Table) {
    for (section, incoming) in layer {
        match (base.get_mut(&section), incoming) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(keys)) => {
                for (key, value) in keys {
                    existing.insert(key, value);
                }
            }
            (_, incoming) => {
                base.insert(section, incoming);
            }
        }
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        PackwrightError::ConfigError(format!("failed to read {}: {}", path.display(), e))
    })
}

fn xdg_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".config"))
                .ok()
        })
        .map(|p| p.join("packwright/packwright.toml"))
}

impl GlobalConfig {
    /// Load configuration.
    ///
    /// An explicit `--config` path is taken as-is, no discovery. Otherwise
    /// three locations are consulted, each overriding the previous one key
    /// by key: the system file under `/etc/packwright`, the per-user file
    /// under `$XDG_CONFIG_HOME`, and `./packwright.toml` in the project.
    /// A file that is absent is skipped; a file that exists but does not
    /// parse is an error, never silently ignored. Environment variables
    /// are applied last and win over every file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::discover()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(&read_config(path)?)?)
    }

    fn discover() -> Result<Self> {
        let mut candidates = vec![PathBuf::from("/etc/packwright/packwright.toml")];
        candidates.extend(xdg_config_path());
        candidates.push(PathBuf::from("./packwright.toml"));

        let mut accumulated = toml::Table::new();
        let mut found_any = false;
        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            let layer: toml::Table = toml::from_str(&read_config(&candidate)?).map_err(|e| {
                PackwrightError::ConfigError(format!("{}: {}", candidate.display(), e))
            })?;
            overlay_config(&mut accumulated, layer);
            found_any = true;
        }

        if !found_any {
            return Ok(Self::default());
        }
        Ok(GlobalConfig::deserialize(toml::Value::Table(accumulated))?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PACKWRIGHT_REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Ok(token) = std::env::var("PACKWRIGHT_REGISTRY_TOKEN") {
            self.registry.token = token;
        }
        if let Ok(endpoint) = std::env::var("PACKWRIGHT_STATUS_URL") {
            self.status.endpoint = Some(endpoint);
        }
    }
}
