//! Nerva configuration
//!
//! Layering, highest to lowest:
//!
//! 1. Environment variables (`USE_ROUTER`, `ROUTER_URL`, `LLM_NODES`,
//!    `LLM_MODEL`, `VISION_MODEL`, `NERVA_HOME`)
//! 2. Config file (`~/.config/nerva/config.toml`)
//! 3. Built-in defaults
//!
//! The state home holds `memory/`, `threads/`, `graph.json` and `models/`.
//! Persistence is optional; a purely in-memory run is fully supported.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NervaError, Result};

const DEFAULT_ROUTER_URL: &str = "http://127.0.0.1:8800";
const DEFAULT_LLM_MODEL: &str = "qwen2.5-14b-instruct";
const DEFAULT_VISION_MODEL: &str = "qwen2.5-vl-7b";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NervaConfig {
    /// Route LLM calls through the external gateway
    #[serde(default = "default_true")]
    pub use_router: bool,

    /// Gateway base URL
    #[serde(default = "default_router_url")]
    pub router_url: String,

    /// Direct node URLs used when the router is disabled (first reachable wins)
    #[serde(default)]
    pub llm_nodes: Vec<String>,

    /// Default text model
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Default vision model
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Global limit on concurrent skill executions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_skills: usize,

    /// Overall deadline for one dispatch, seconds
    #[serde(default = "default_deadline_secs")]
    pub dispatch_deadline_secs: u64,

    /// Step budget for the vision-action loop
    #[serde(default = "default_vision_steps")]
    pub vision_max_steps: u32,

    /// Per-step default timeout for playbook actions, seconds
    #[serde(default = "default_step_timeout_secs")]
    pub playbook_step_timeout_secs: u64,

    /// Utterances with fewer words than this trigger a clarification
    #[serde(default = "default_clarify_min_words")]
    pub clarify_min_words: usize,

    /// Directory scanned by the daily-ops TODO collector
    #[serde(default)]
    pub notes_dir: Option<PathBuf>,

    /// Log file tailed by the daily-ops collector
    #[serde(default)]
    pub ops_log_file: Option<PathBuf>,

    /// State home override (otherwise `~/.local/share/nerva`)
    #[serde(default)]
    pub home: Option<PathBuf>,

    /// Persist memory/threads/graph to the state home
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_true() -> bool {
    true
}
fn default_router_url() -> String {
    DEFAULT_ROUTER_URL.to_string()
}
fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}
fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_deadline_secs() -> u64 {
    300
}
fn default_vision_steps() -> u32 {
    20
}
fn default_step_timeout_secs() -> u64 {
    30
}
fn default_clarify_min_words() -> usize {
    3
}

impl Default for NervaConfig {
    fn default() -> Self {
        Self {
            use_router: true,
            router_url: default_router_url(),
            llm_nodes: Vec::new(),
            llm_model: default_llm_model(),
            vision_model: default_vision_model(),
            max_concurrent_skills: default_max_concurrent(),
            dispatch_deadline_secs: default_deadline_secs(),
            vision_max_steps: default_vision_steps(),
            playbook_step_timeout_secs: default_step_timeout_secs(),
            clarify_min_words: default_clarify_min_words(),
            notes_dir: None,
            ops_log_file: None,
            home: None,
            persist: true,
        }
    }
}

impl NervaConfig {
    /// Get the config directory path (`~/.config/nerva/`)
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nerva")
    }

    /// Get the config file path (`~/.config/nerva/config.toml`)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, then merge environment variables.
    ///
    /// Returns defaults if the file doesn't exist; errors only if the file
    /// exists but is malformed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        let base = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| NervaError::Config {
                reason: format!("Failed to read config file: {}", e),
            })?;
            toml::from_str(&content).map_err(|e| NervaError::Config {
                reason: format!("Failed to parse config file: {}", e),
            })?
        } else {
            Self::default()
        };

        Ok(base.with_env())
    }

    /// Save configuration to file, creating the directory if needed.
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| NervaError::Config {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| NervaError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        fs::write(Self::config_path(), content).map_err(|e| NervaError::Config {
            reason: format!("Failed to write config file: {}", e),
        })?;
        Ok(())
    }

    /// Merge with environment variables (env takes precedence).
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("USE_ROUTER") {
            self.use_router = v != "0";
        }
        if let Ok(v) = std::env::var("ROUTER_URL") {
            if !v.is_empty() {
                self.router_url = v;
            }
        }
        if let Ok(v) = std::env::var("LLM_NODES") {
            if !v.is_empty() {
                self.llm_nodes = v.split(',').map(|s| s.trim().to_string()).collect();
            }
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            if !v.is_empty() {
                self.llm_model = v;
            }
        }
        if let Ok(v) = std::env::var("VISION_MODEL") {
            if !v.is_empty() {
                self.vision_model = v;
            }
        }
        if let Ok(v) = std::env::var("NERVA_HOME") {
            if !v.is_empty() {
                self.home = Some(PathBuf::from(v));
            }
        }
        self
    }

    /// State home directory (`~/.local/share/nerva` unless overridden).
    pub fn state_home(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nerva")
        })
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.state_home().join("memory")
    }

    pub fn threads_dir(&self) -> PathBuf {
        self.state_home().join("threads")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.state_home().join("graph.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.state_home().join("models")
    }

    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs(self.dispatch_deadline_secs)
    }

    pub fn playbook_step_timeout(&self) -> Duration {
        Duration::from_secs(self.playbook_step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for k in [
            "USE_ROUTER",
            "ROUTER_URL",
            "LLM_NODES",
            "LLM_MODEL",
            "VISION_MODEL",
            "NERVA_HOME",
        ] {
            std::env::remove_var(k);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        clear_env();
        let config = NervaConfig::default().with_env();
        assert!(config.use_router);
        assert_eq!(config.router_url, DEFAULT_ROUTER_URL);
        assert_eq!(config.max_concurrent_skills, 4);
        assert_eq!(config.dispatch_deadline_secs, 300);
        assert_eq!(config.vision_max_steps, 20);
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        clear_env();
        std::env::set_var("USE_ROUTER", "0");
        std::env::set_var("ROUTER_URL", "http://gw:9000");
        std::env::set_var("LLM_NODES", "http://a:1, http://b:2");
        std::env::set_var("LLM_MODEL", "m-text");
        std::env::set_var("VISION_MODEL", "m-vis");

        let config = NervaConfig::default().with_env();
        assert!(!config.use_router);
        assert_eq!(config.router_url, "http://gw:9000");
        assert_eq!(config.llm_nodes, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.llm_model, "m-text");
        assert_eq!(config.vision_model, "m-vis");
        clear_env();
    }

    #[test]
    #[serial]
    fn state_home_layout() {
        clear_env();
        let config = NervaConfig {
            home: Some(PathBuf::from("/tmp/nerva-test")),
            ..Default::default()
        };
        assert_eq!(config.memory_dir(), PathBuf::from("/tmp/nerva-test/memory"));
        assert_eq!(
            config.threads_dir(),
            PathBuf::from("/tmp/nerva-test/threads")
        );
        assert_eq!(
            config.graph_path(),
            PathBuf::from("/tmp/nerva-test/graph.json")
        );
    }

    #[test]
    #[serial]
    fn toml_round_trip() {
        clear_env();
        let config = NervaConfig {
            llm_model: "custom".to_string(),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: NervaConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }
}
