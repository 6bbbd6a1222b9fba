//! Runtime configuration for foundry-chat.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section and field has a default, so a partial file only needs to
//! name the knobs it changes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "foundry-chat", about = "Chat gateway for a Foundry Local model runtime")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Model alias or id (overrides `model.alias`).
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP gateway (default).
    Serve,

    /// Send a single prompt and print the answer.
    Ask {
        /// The prompt to send.
        prompt: String,

        /// Wait for the whole answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Public API behavior.
    pub api: ApiConfig,

    /// Model runtime discovery and management.
    pub runtime: RuntimeConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Seconds to wait for in-flight requests after a shutdown signal.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

/// Model selection and streaming cadence. Read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Alias (or concrete id) of the model to start on the runtime.
    pub alias: String,

    /// Upper bound on the whole initialization sequence, in seconds.
    pub initialization_timeout_secs: u64,

    /// Pause between streamed chunks, in milliseconds.
    pub streaming_delay_ms: u64,

    /// Whether the pause is applied at all.
    pub enable_streaming_delay: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            alias: "qwen2.5-0.5b".to_string(),
            initialization_timeout_secs: 60,
            streaming_delay_ms: 10,
            enable_streaming_delay: true,
        }
    }
}

impl ModelConfig {
    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_secs(self.initialization_timeout_secs)
    }

    /// The effective pacing delay, or `None` when pacing is off.
    pub fn streaming_delay(&self) -> Option<Duration> {
        if self.enable_streaming_delay && self.streaming_delay_ms > 0 {
            Some(Duration::from_millis(self.streaming_delay_ms))
        } else {
            None
        }
    }
}

/// Request validation and error presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Maximum message length in characters.
    pub max_message_length: usize,

    /// CORS origins; `"*"` allows any origin.
    pub allowed_origins: Vec<String>,

    /// Include internal error details in responses.
    pub enable_detailed_errors: bool,

    /// Directory served for routes outside `/api` and `/health`.
    pub static_dir: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            allowed_origins: vec!["*".to_string()],
            enable_detailed_errors: false,
            static_dir: None,
        }
    }
}

/// How the Foundry Local runtime is found and driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the `foundry` CLI; auto-detected when unset.
    pub binary: Option<PathBuf>,

    /// Service base URL (e.g. "http://127.0.0.1:5273"). Skips CLI discovery.
    pub endpoint: Option<String>,

    /// API key sent to the runtime; falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,

    /// Resolve, download and load models through the runtime's management API.
    pub manage_models: bool,

    /// Timeout for `foundry service start`, in seconds.
    pub service_start_timeout_secs: u64,

    /// Time-to-live passed when loading a model, in seconds.
    pub load_ttl_secs: u64,

    /// Unload the model when the gateway shuts down.
    pub unload_on_shutdown: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            endpoint: None,
            api_key: None,
            manage_models: true,
            service_start_timeout_secs: 30,
            load_ttl_secs: 600,
            unload_on_shutdown: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model) = &cli.model {
            self.model.alias = model.clone();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.model.alias.trim().is_empty() {
            anyhow::bail!("model.alias must not be empty");
        }
        if self.api.max_message_length == 0 {
            anyhow::bail!("api.max_message_length must be at least 1");
        }
        if self.model.initialization_timeout_secs == 0 {
            anyhow::bail!("model.initialization_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
