//! Process configuration read from the environment

use crate::llm::LlmConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const MAX_TOOL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 4;
const DEFAULT_AGENT_MAX_STEPS: u32 = 5;
const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;

/// Allowed range for a per-turn agent step budget
pub const AGENT_STEP_RANGE: std::ops::RangeInclusive<u32> = 1..=20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A remote tool server declared in the tool server file
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub required_groups: Vec<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub sequential: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tool_timeout: Duration,
    pub max_concurrent_tools: usize,
    pub agent_max_steps: u32,
    pub session_idle: Duration,
    pub tool_servers: Vec<ToolServerConfig>,
    pub user_groups: HashMap<String, Vec<String>>,
    pub retrieval_url: Option<String>,
    pub files_dir: Option<PathBuf>,
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            max_concurrent_tools: DEFAULT_MAX_CONCURRENT_TOOLS,
            agent_max_steps: DEFAULT_AGENT_MAX_STEPS,
            session_idle: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
            tool_servers: Vec::new(),
            user_groups: HashMap::new(),
            retrieval_url: None,
            files_dir: None,
            llm: LlmConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = parse_var(&lookup, "PARLEY_PORT", "a port number")?.unwrap_or(defaults.port);

        let tool_timeout = parse_var::<u64>(&lookup, "PARLEY_TOOL_TIMEOUT_SECS", "a number of seconds")?
            .map_or(defaults.tool_timeout, |secs| {
                Duration::from_secs(secs.clamp(1, MAX_TOOL_TIMEOUT_SECS))
            });

        let max_concurrent_tools = parse_var::<usize>(
            &lookup,
            "PARLEY_MAX_CONCURRENT_TOOLS",
            "a positive integer",
        )?
        .map_or(defaults.max_concurrent_tools, |n| n.max(1));

        let agent_max_steps = match parse_var::<u32>(
            &lookup,
            "PARLEY_AGENT_MAX_STEPS",
            "an integer between 1 and 20",
        )? {
            Some(n) if AGENT_STEP_RANGE.contains(&n) => n,
            Some(n) => {
                return Err(ConfigError::InvalidValue {
                    var: "PARLEY_AGENT_MAX_STEPS",
                    expected: "an integer between 1 and 20",
                    value: n.to_string(),
                })
            }
            None => defaults.agent_max_steps,
        };

        let session_idle = parse_var::<u64>(&lookup, "PARLEY_SESSION_IDLE_SECS", "a number of seconds")?
            .map_or(defaults.session_idle, Duration::from_secs);

        let tool_servers = match lookup("PARLEY_TOOL_SERVERS") {
            Some(path) => read_json(Path::new(&path))?,
            None => Vec::new(),
        };

        let user_groups = match lookup("PARLEY_USER_GROUPS") {
            Some(path) => read_json(Path::new(&path))?,
            None => HashMap::new(),
        };

        Ok(Self {
            port,
            tool_timeout,
            max_concurrent_tools,
            agent_max_steps,
            session_idle,
            tool_servers,
            user_groups,
            retrieval_url: lookup("PARLEY_RETRIEVAL_URL"),
            files_dir: lookup("PARLEY_FILES_DIR").map(PathBuf::from),
            llm: LlmConfig {
                anthropic_api_key: lookup("ANTHROPIC_API_KEY"),
                gateway: lookup("LLM_GATEWAY"),
                default_model: lookup("DEFAULT_MODEL"),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    var,
                    expected,
                    value,
                })
        })
        .transpose()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
