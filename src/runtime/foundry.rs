//! Foundry Local runtime manager.
//!
//! Drives the `foundry` CLI for service lifecycle (`service status`,
//! `service start`, `model download`) and the service's REST API for model
//! management:
//! - `GET /foundry/list`: catalog used to resolve an alias to a model id
//! - `GET /openai/models`: models already in the local cache
//! - `GET /openai/load/{id}`: load a model into the runtime
//! - `GET /openai/unload/{id}`: release it again
//!
//! Completions go to the OpenAI-compatible API under `{service}/v1`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::runtime::openai::OpenAiClient;
use crate::runtime::{error_body, CompletionClient, Connection, ModelInfo, RuntimeError, RuntimeManager};

/// Key the runtime accepts when no real credential is configured.
pub const DEFAULT_API_KEY: &str = "notneeded";

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_RETRIES: u32 = 3;

/// Find the foundry CLI executable, checking PATH first then common installation locations.
pub fn find_foundry_binary() -> PathBuf {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let exe = if cfg!(windows) { "foundry.exe" } else { "foundry" };
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exe);
        if candidate.is_file() {
            return candidate;
        }
    }

    let common_paths: &[&str] = &[
        #[cfg(target_os = "macos")]
        "/opt/homebrew/bin/foundry",
        #[cfg(target_os = "macos")]
        "/usr/local/bin/foundry",
        #[cfg(target_os = "windows")]
        "C:\\Program Files\\Microsoft\\Foundry\\foundry.exe",
        #[cfg(target_os = "linux")]
        "/usr/local/bin/foundry",
        #[cfg(target_os = "linux")]
        "/usr/bin/foundry",
    ];
    for path in common_paths {
        if Path::new(path).exists() {
            debug!(path, "Found foundry at fallback location");
            return PathBuf::from(path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        #[cfg(target_os = "windows")]
        let candidate = home
            .join("AppData")
            .join("Local")
            .join("Microsoft")
            .join("Foundry")
            .join("foundry.exe");
        #[cfg(not(target_os = "windows"))]
        let candidate = home.join(".foundry").join("bin").join("foundry");

        if candidate.exists() {
            debug!(path = %candidate.display(), "Found foundry in home directory");
            return candidate;
        }
    }

    // Last resort: let the OS resolve it.
    PathBuf::from(exe)
}

/// Extract the service base URL from `foundry service status` output.
///
/// The interesting line looks like
/// `Model management service is running on http://127.0.0.1:54657/openai/status`.
pub fn parse_service_status(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .find_map(|token| {
            let url = reqwest::Url::parse(token.trim_end_matches(['.', ',', ')'])).ok()?;
            let host = url.host_str()?;
            let port = url.port_or_known_default()?;
            Some(format!("{}://{}:{}", url.scheme(), host, port))
        })
}

/// One entry of the `/foundry/list` catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Concrete model id, e.g. `qwen2.5-0.5b-instruct-generic-cpu:4`.
    pub name: String,

    #[serde(default)]
    pub alias: String,

    #[serde(default)]
    pub runtime: Option<CatalogRuntime>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRuntime {
    #[serde(default)]
    pub device_type: Option<String>,

    #[serde(default)]
    pub execution_provider: Option<String>,
}

/// Resolve an alias or id against the catalog.
///
/// An exact id match wins. Otherwise the first entry carrying the alias is
/// taken; the runtime lists variants in its own preference order for the
/// current hardware.
pub fn resolve_model(catalog: &[CatalogEntry], alias_or_id: &str) -> Option<ModelInfo> {
    let entry = catalog
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(alias_or_id))
        .or_else(|| {
            catalog
                .iter()
                .find(|e| e.alias.eq_ignore_ascii_case(alias_or_id))
        })?;

    Some(ModelInfo {
        id: entry.name.clone(),
        alias: if entry.alias.is_empty() {
            alias_or_id.to_string()
        } else {
            entry.alias.clone()
        },
        device: entry.runtime.as_ref().and_then(|r| r.device_type.clone()),
    })
}

/// Manager for a Foundry Local service on this machine.
pub struct FoundryManager {
    config: RuntimeConfig,
    http: reqwest::Client,
    binary: PathBuf,
    service_url: RwLock<Option<String>>,
}

impl FoundryManager {
    pub fn new(config: RuntimeConfig) -> Self {
        let binary = config.binary.clone().unwrap_or_else(find_foundry_binary);
        Self {
            config,
            http: reqwest::Client::new(),
            binary,
            service_url: RwLock::new(None),
        }
    }

    fn api_key(&self) -> String {
        self.config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string())
    }

    async fn run_cli(&self, args: &[&str], limit: Option<Duration>) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary.display(), ?args, "Running foundry CLI");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match limit {
            Some(limit) => timeout(limit, output).await.map_err(|_| {
                RuntimeError::Command(format!("foundry {} timed out after {limit:?}", args.join(" ")))
            })??,
            None => output.await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Command(format!(
                "foundry {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn detect_service(&self) -> Option<String> {
        match self.run_cli(&["service", "status"], Some(STATUS_TIMEOUT)).await {
            Ok(stdout) => parse_service_status(&stdout),
            Err(e) => {
                debug!("foundry service status failed: {e}");
                None
            }
        }
    }

    /// Base URL of the running service, starting it when necessary.
    async fn ensure_service(&self) -> Result<String, RuntimeError> {
        if let Some(endpoint) = &self.config.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        if let Some(url) = self.service_url.read().await.clone() {
            return Ok(url);
        }

        let mut cached = self.service_url.write().await;
        if let Some(url) = cached.clone() {
            return Ok(url);
        }

        if let Some(url) = self.detect_service().await {
            info!(url, "Foundry service already running");
            *cached = Some(url.clone());
            return Ok(url);
        }

        info!("Starting Foundry service");
        let start_timeout = Duration::from_secs(self.config.service_start_timeout_secs);
        if let Err(e) = self.run_cli(&["service", "start"], Some(start_timeout)).await {
            warn!("foundry service start failed: {e}");
        }

        let mut delay = Duration::from_millis(500);
        for attempt in 1..=STATUS_RETRIES {
            if let Some(url) = self.detect_service().await {
                info!(url, attempt, "Foundry service started");
                *cached = Some(url.clone());
                return Ok(url);
            }
            if attempt < STATUS_RETRIES {
                sleep(delay).await;
                delay = Duration::from_millis((delay.as_millis() as f64 * 1.5) as u64)
                    .min(Duration::from_secs(10));
            }
        }

        Err(RuntimeError::ServiceUnavailable(format!(
            "no service URL reported by {}",
            self.binary.display()
        )))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RuntimeError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn get_ok(&self, url: &str) -> Result<(), RuntimeError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }
        Ok(())
    }

    async fn catalog(&self, base: &str) -> Result<Vec<CatalogEntry>, RuntimeError> {
        self.get_json(&format!("{base}/foundry/list")).await
    }

    async fn cached_models(&self, base: &str) -> Result<Vec<String>, RuntimeError> {
        self.get_json(&format!("{base}/openai/models")).await
    }

    async fn resolve(&self, base: &str, alias: &str) -> Result<ModelInfo, RuntimeError> {
        let catalog = self.catalog(base).await?;
        resolve_model(&catalog, alias).ok_or_else(|| RuntimeError::ModelNotFound(alias.to_string()))
    }
}

#[async_trait]
impl RuntimeManager for FoundryManager {
    async fn start_model(&self, alias: &str) -> Result<(), RuntimeError> {
        let base = self.ensure_service().await?;
        if !self.config.manage_models {
            return Ok(());
        }

        let model = self.resolve(&base, alias).await?;

        let cached = self.cached_models(&base).await?;
        if !cached.iter().any(|id| id.eq_ignore_ascii_case(&model.id)) {
            info!(model_id = %model.id, "Downloading model");
            self.run_cli(&["model", "download", &model.id], None).await?;
        }

        info!(model_id = %model.id, device = ?model.device, "Loading model");
        self.get_ok(&format!(
            "{base}/openai/load/{}?ttl={}",
            model.id, self.config.load_ttl_secs
        ))
        .await
    }

    async fn model_info(&self, alias: &str) -> Result<Option<ModelInfo>, RuntimeError> {
        if !self.config.manage_models {
            return Ok(Some(ModelInfo {
                id: alias.to_string(),
                alias: alias.to_string(),
                device: None,
            }));
        }
        let base = self.ensure_service().await?;
        let catalog = self.catalog(&base).await?;
        Ok(resolve_model(&catalog, alias))
    }

    async fn connection(&self) -> Result<Connection, RuntimeError> {
        let base = self.ensure_service().await?;
        Ok(Connection {
            endpoint: format!("{base}/v1"),
            api_key: self.api_key(),
        })
    }

    fn completion_client(
        &self,
        connection: &Connection,
        model_id: &str,
    ) -> Result<Arc<dyn CompletionClient>, RuntimeError> {
        Ok(Arc::new(OpenAiClient::new(
            self.http.clone(),
            connection,
            model_id,
        )))
    }

    async fn shutdown(&self, model_id: Option<&str>) -> Result<(), RuntimeError> {
        let Some(model_id) = model_id else {
            return Ok(());
        };
        if !(self.config.unload_on_shutdown && self.config.manage_models) {
            return Ok(());
        }
        let Some(base) = self.service_url.read().await.clone().or_else(|| self.config.endpoint.clone()) else {
            return Ok(());
        };
        info!(model_id, "Unloading model");
        self.get_ok(&format!("{}/openai/unload/{model_id}?force=true", base.trim_end_matches('/')))
            .await
    }
}
