//! Colibri Configuration
//!
//! TOML configuration loading with environment variable fallback for the
//! API key

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Eres un asistente útil que responde de manera clara y concisa.";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub chatmail: ChatmailConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
            text_model: default_text_model(),
            image_model: default_image_model(),
            tts_model: default_tts_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatmailConfig {
    /// Path to the deltachat-rpc-server binary.
    #[serde(default = "default_rpc_bin")]
    pub rpc_bin: String,
    /// Accounts directory handed to the RPC server; defaults to
    /// `<data_dir>/accounts` when unset.
    pub accounts_dir: Option<String>,
}

impl Default for ChatmailConfig {
    fn default() -> Self {
        Self {
            rpc_bin: default_rpc_bin(),
            accounts_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_image_model() -> String {
    "gemini-2.0-flash-preview-image-generation".to_string()
}

fn default_tts_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

fn default_rpc_bin() -> String {
    "deltachat-rpc-server".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_history_limit() -> usize {
    20
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        if config.gemini.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                config.gemini.api_key = key;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("colibri").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.core.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("colibri"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gemini.api_key.trim().is_empty() {
            anyhow::bail!(
                "Gemini API key missing: set [gemini].api_key or the GEMINI_API_KEY env var"
            );
        }
        if self.assistant.history_limit == 0 {
            anyhow::bail!("[assistant].history_limit must be greater than zero");
        }
        if self.assistant.system_prompt.trim().is_empty() {
            anyhow::bail!("[assistant].system_prompt cannot be empty");
        }
        if self.chatmail.rpc_bin.trim().is_empty() {
            anyhow::bail!("[chatmail].rpc_bin cannot be empty");
        }
        Ok(())
    }

    /// Commented sample written by `colibri init-config`.
    pub fn sample() -> &'static str {
        r#"# Colibri configuration

[core]
# data_dir = "~/.local/share/colibri"
# log_level = "info"

[gemini]
# Taken from the GEMINI_API_KEY env var when left empty.
api_key = ""
# text_model = "gemini-2.5-flash"
# image_model = "gemini-2.0-flash-preview-image-generation"
# tts_model = "gemini-2.5-flash-preview-tts"

[chatmail]
# rpc_bin = "deltachat-rpc-server"
# accounts_dir = "~/.local/share/colibri/accounts"

[assistant]
# system_prompt = "Eres un asistente útil que responde de manera clara y concisa."
# history_limit = 20
"#
    }
}
