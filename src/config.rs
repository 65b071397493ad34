use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Model names for each capability tier.
///
/// Tier selection is a cost/latency tradeoff: `analysis` runs the per-turn
/// classification, `light` answers greetings and other direct cases,
/// `standard` handles ordinary and tool-bound turns, `deep` handles crisis,
/// complex and creative turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTiers {
    #[serde(default = "default_analysis_model")]
    pub analysis: String,
    #[serde(default = "default_light_model")]
    pub light: String,
    #[serde(default = "default_standard_model")]
    pub standard: String,
    #[serde(default = "default_deep_model")]
    pub deep: String,
}

fn default_analysis_model() -> String {
    "llama3.2:1b".to_string()
}

fn default_light_model() -> String {
    "llama3.2:1b".to_string()
}

fn default_standard_model() -> String {
    "llama3.2".to_string()
}

fn default_deep_model() -> String {
    "llama3.1:8b".to_string()
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            analysis: default_analysis_model(),
            light: default_light_model(),
            standard: default_standard_model(),
            deep: default_deep_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // LLM endpoint (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub models: ModelTiers,

    // Assistant identity used in prompts
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // HTTP server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // How many prior exchanges to replay as context for streaming turns
    #[serde(default = "default_stream_context_messages")]
    pub stream_context_messages: usize,

    // Sampling
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_assistant_name() -> String {
    "Solace".to_string()
}

fn default_system_prompt() -> String {
    "You are {assistant_name}, a compassionate mental health companion. \
     Prioritize the user's safety above everything else, listen without judgment, \
     and ground every recommendation in the tool data you are given. \
     You are a bridge to professional care, not a replacement for it. \
     For crisis indicators (suicidal ideation, self-harm, immediate danger) \
     always escalate and point the user at emergency services."
        .to_string()
}

fn default_database_path() -> String {
    "solace_sessions.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8600".to_string()
}

fn default_stream_context_messages() -> usize {
    5
}

fn default_temperature() -> f32 {
    0.4
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            models: ModelTiers::default(),
            assistant_name: default_assistant_name(),
            system_prompt: default_system_prompt(),
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
            stream_context_messages: default_stream_context_messages(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ServiceConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("solace_config.toml")
    }

    /// Load config from solace_config.toml, falling back to env vars + defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ServiceConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// The system prompt with the configured assistant identity applied.
    pub fn persona_prompt(&self) -> String {
        self.system_prompt
            .replace("{assistant_name}", &self.assistant_name)
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("SOLACE_LLM_API_URL") {
            config.llm_api_url = url;
        }
        if let Ok(key) = env::var("SOLACE_LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }
        if let Ok(model) = env::var("SOLACE_MODEL_ANALYSIS") {
            config.models.analysis = model;
        }
        if let Ok(model) = env::var("SOLACE_MODEL_LIGHT") {
            config.models.light = model;
        }
        if let Ok(model) = env::var("SOLACE_MODEL_STANDARD") {
            config.models.standard = model;
        }
        if let Ok(model) = env::var("SOLACE_MODEL_DEEP") {
            config.models.deep = model;
        }
        if let Ok(path) = env::var("SOLACE_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }
        if let Ok(addr) = env::var("SOLACE_BIND") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr;
            }
        }

        config
    }
}
