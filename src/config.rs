use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::guardrails::GuardrailConfig;

pub const DEFAULT_USER_ID: &str = "unknown_user";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSettings {
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub save_memory: bool,
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            description: default_description(),
            skills: Vec::new(),
            max_iterations: default_max_iterations(),
            buffer_size: default_buffer_size(),
            user_id: default_user_id(),
            save_memory: false,
            thread_id: default_thread_id(),
        }
    }
}

fn default_description() -> String {
    "You are a helpful assistant.".into()
}

fn default_max_iterations() -> usize {
    10
}

fn default_buffer_size() -> usize {
    crate::buffer::DEFAULT_BUFFER_SIZE
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.into()
}

fn default_thread_id() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default)]
    pub reset: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            catalog_path: default_catalog_path(),
            reset: false,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(crate::registry::DEFAULT_CACHE_DIR)
}

fn default_catalog_path() -> PathBuf {
    default_cache_dir().join(crate::registry::DEFAULT_CATALOG_FILE)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// JSON file backing long-term memory. No memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            with_target: default_with_target(),
        }
    }
}

fn default_filter() -> String {
    "info".into()
}

fn default_with_target() -> bool {
    true
}

/// One remote tool server. Exactly one of `url` or `command` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|err| AgentError::configuration(format!("failed to parse configuration: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        if let Ok(description) = env::var("TOOLWEAVE_DESCRIPTION") {
            cfg.agent.description = description;
        }
        if let Ok(max) = env::var("TOOLWEAVE_MAX_ITERATIONS") {
            if let Ok(parsed) = max.parse::<usize>() {
                cfg.agent.max_iterations = parsed;
            }
        }
        if let Ok(size) = env::var("TOOLWEAVE_BUFFER_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                cfg.agent.buffer_size = parsed;
            }
        }
        if let Ok(user_id) = env::var("TOOLWEAVE_USER_ID") {
            cfg.agent.user_id = user_id;
        }
        if let Ok(save) = env::var("TOOLWEAVE_SAVE_MEMORY") {
            if let Ok(parsed) = save.parse::<bool>() {
                cfg.agent.save_memory = parsed;
            }
        }
        if let Ok(dir) = env::var("TOOLWEAVE_TOOLS_CACHE_DIR") {
            cfg.tools.cache_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("TOOLWEAVE_TOOLS_CATALOG") {
            cfg.tools.catalog_path = PathBuf::from(path);
        }
        if let Ok(reset) = env::var("TOOLWEAVE_TOOLS_RESET") {
            if let Ok(parsed) = reset.parse::<bool>() {
                cfg.tools.reset = parsed;
            }
        }
        if let Ok(path) = env::var("TOOLWEAVE_MEMORY_PATH") {
            cfg.memory.path = Some(PathBuf::from(path));
        }
        if let Ok(filter) = env::var("TOOLWEAVE_LOG") {
            cfg.logging.filter = filter;
        }
        if let Ok(json) = env::var("TOOLWEAVE_LOG_JSON") {
            if let Ok(parsed) = json.parse::<bool>() {
                cfg.logging.json = parsed;
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tools.catalog_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(AgentError::configuration(format!(
                "tools.catalog_path `{}` must end with .json",
                self.tools.catalog_path.display()
            )));
        }
        if let Some(path) = &self.memory.path {
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                return Err(AgentError::configuration(format!(
                    "memory.path `{}` must end with .json",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
