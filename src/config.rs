//! TOML configuration for the `basket` binary and library.
//!
//! ```toml
//! [db]
//! path = "./data/basket.sqlite"
//!
//! [model]
//! model_name = "gpt-5-nano"
//! use_reasoning_api = true
//!
//! [prompts]
//! prompts_dir = "./prompts"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::Effort;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Reasoning-model endpoint settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token. Empty means "read `OPENAI_API_KEY` at client construction".
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub reasoning_effort: Effort,
    #[serde(default = "default_true")]
    pub use_reasoning_api: bool,
    #[serde(default)]
    pub store: bool,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            base_url: default_base_url(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            reasoning_effort: Effort::default(),
            use_reasoning_api: true,
            store: false,
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

fn default_model_name() -> String {
    "gpt-5-nano".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_tokens() -> u32 {
    300
}
fn default_temperature() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_http_timeout_seconds() -> u64 {
    45
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            prompts_dir: default_prompts_dir(),
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("./prompts")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Items below this confidence are folded into a sibling's notes.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.60;

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.ingest.confidence_threshold) {
        anyhow::bail!("ingest.confidence_threshold must be in [0.0, 1.0]");
    }

    let model = &config.model;
    if model.http_timeout_seconds == 0 {
        anyhow::bail!("model.http_timeout_seconds must be > 0");
    }
    if model.max_tokens == 0 {
        anyhow::bail!("model.max_tokens must be > 0");
    }
    if !(0.0..=2.0).contains(&model.temperature) {
        anyhow::bail!("model.temperature must be in [0.0, 2.0]");
    }
    if model.base_url.trim().is_empty() {
        anyhow::bail!("model.base_url must not be empty");
    }
    if model.model_name.trim().is_empty() {
        anyhow::bail!("model.model_name must not be empty");
    }

    Ok(())
}
