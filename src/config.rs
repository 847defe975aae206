use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Ollama,
    Openai,
    Openrouter,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Openai => write!(f, "openai"),
            LlmProvider::Openrouter => write!(f, "openrouter"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the canonical URL for the configured provider.
    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.is_empty() {
            return &self.base_url;
        }
        match self.provider {
            LlmProvider::Ollama => "http://localhost:11434/v1",
            LlmProvider::Openai => "https://api.openai.com/v1",
            LlmProvider::Openrouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: default_model(),
            base_url: String::new(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_scenarios_dir")]
    pub scenarios_dir: PathBuf,
    /// Upper bound on scroll-back steps for a historical extraction.
    #[serde(default = "default_scroll_steps")]
    pub scroll_steps: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Width of the bucket message timestamps are truncated to before fingerprinting.
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,
    #[serde(default = "default_max_fatal_retries")]
    pub max_fatal_retries: u32,
    #[serde(default = "default_web_timeout_secs")]
    pub web_timeout_secs: u64,
    /// When > 0, live mode marks existing history seen (without analysis) before polling.
    #[serde(default)]
    pub baseline_scroll_steps: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scenarios_dir: default_scenarios_dir(),
            scroll_steps: default_scroll_steps(),
            poll_interval_secs: default_poll_interval_secs(),
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
            max_fatal_retries: default_max_fatal_retries(),
            web_timeout_secs: default_web_timeout_secs(),
            baseline_scroll_steps: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_replay_window")]
    pub window: usize,
    #[serde(default = "default_replay_scroll_step")]
    pub scroll_step: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            directory: default_replay_dir(),
            window: default_replay_window(),
            scroll_step: default_replay_scroll_step(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

fn default_model() -> String {
    "gpt-oss:20b".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_scenarios_dir() -> PathBuf {
    PathBuf::from("scenarios")
}

fn default_scroll_steps() -> u32 {
    5
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_timestamp_tolerance_secs() -> u64 {
    60
}

fn default_max_fatal_retries() -> u32 {
    3
}

fn default_web_timeout_secs() -> u64 {
    30
}

fn default_replay_dir() -> PathBuf {
    PathBuf::from("transcripts")
}

fn default_replay_window() -> usize {
    20
}

fn default_replay_scroll_step() -> usize {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// `OLLAMA_BASE_URL` / `OLLAMA_MODEL` override the [llm] section.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_BASE_URL").filter(|v| !v.is_empty()) {
            let url = url.trim_end_matches('/');
            self.llm.base_url = if url.ends_with("/v1") {
                url.to_string()
            } else {
                format!("{}/v1", url)
            };
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let scan = &self.scan;
        if scan.scroll_steps == 0 {
            anyhow::bail!("scan.scroll_steps must be greater than 0");
        }
        if scan.poll_interval_secs == 0 {
            anyhow::bail!("scan.poll_interval_secs must be greater than 0");
        }
        if scan.timestamp_tolerance_secs == 0 {
            anyhow::bail!("scan.timestamp_tolerance_secs must be greater than 0");
        }
        if scan.max_fatal_retries == 0 {
            anyhow::bail!("scan.max_fatal_retries must be greater than 0");
        }
        if self.replay.window == 0 || self.replay.scroll_step == 0 {
            anyhow::bail!("replay.window and replay.scroll_step must be greater than 0");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scan.poll_interval_secs)
    }

    pub fn web_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.web_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.effective_base_url(), "http://localhost:11434/v1");
        assert_eq!(config.scan.scroll_steps, 5);
        assert_eq!(config.scan.max_fatal_retries, 3);
        assert_eq!(config.scan.baseline_scroll_steps, 0);
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
            [llm]
            provider = "openai"
            model = "gpt-4o-mini"
            api_key = "sk-test"

            [scan]
            scroll_steps = 8
            poll_interval_secs = 30
            baseline_scroll_steps = 3

            [replay]
            directory = "fixtures"
            window = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Openai);
        assert_eq!(config.llm.effective_base_url(), "https://api.openai.com/v1");
        assert_eq!(config.scan.scroll_steps, 8);
        assert_eq!(config.scan.baseline_scroll_steps, 3);
        assert_eq!(config.replay.directory, PathBuf::from("fixtures"));
        assert_eq!(config.replay.window, 5);
        assert_eq!(config.replay.scroll_step, 10);
    }

    #[test]
    fn test_env_overrides_append_v1() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "OLLAMA_BASE_URL" => Some("http://gpu-box:11434/".to_string()),
            "OLLAMA_MODEL" => Some("llama3".to_string()),
            _ => None,
        });
        assert_eq!(config.llm.effective_base_url(), "http://gpu-box:11434/v1");
        assert_eq!(config.llm.model, "llama3");
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config::parse("[scan]\npoll_interval_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Path::new("/nonexistent/groupscan.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
