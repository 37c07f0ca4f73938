// remote-inference/crates/remote-inference/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::device;

/// Default client deadline. Generous because reranking is slow.
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Which local engine a server hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// OpenAI-compatible llama-server backend
    Llama,
    /// Deterministic in-process engine
    Echo,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llama" | "llama-server" => Ok(EngineKind::Llama),
            "echo" => Ok(EngineKind::Echo),
            other => Err(anyhow::anyhow!("Unknown engine '{}', expected 'llama' or 'echo'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    /// Explicit token override. When `None` the credential store decides.
    pub auth_token: Option<String>,
    pub engine: EngineKind,
    pub backend_url: String,
    pub llama_bin: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub models_dir: PathBuf,
    pub ctx_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub prewarm: bool,
    pub max_body_bytes: usize,
    pub request_timeout_seconds: u64,
    pub idle_unload_seconds: u64,
    pub remote_url: Option<String>,
    pub remote_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8282,
            auth_token: None,
            engine: EngineKind::Llama,
            backend_url: "http://127.0.0.1:8081".to_string(),
            llama_bin: None,
            model_path: None,
            models_dir: PathBuf::from("./models"),
            ctx_size: 8192,
            threads: 4,
            gpu_layers: 0,
            prewarm: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout_seconds: 600,
            idle_unload_seconds: 0,
            remote_url: None,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let engine = match env::var("ENGINE") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.engine,
        };

        // Prefer an explicit LLAMA_BIN, then whatever llama-server is on PATH
        let llama_bin = match env::var("LLAMA_BIN") {
            Ok(bin) => Some(PathBuf::from(bin)),
            Err(_) => which::which("llama-server").ok(),
        };
        if let Some(bin) = &llama_bin {
            if !bin.exists() {
                return Err(anyhow::anyhow!(
                    "Llama binary not found at: {}. Please check LLAMA_BIN.",
                    bin.display()
                ));
            }
        }

        let threads = if env::var("THREADS").unwrap_or_else(|_| "auto".into()) == "auto" {
            device::auto_threads()
        } else {
            env::var("THREADS").unwrap_or_default().parse().context("THREADS must be a number or 'auto'")?
        };

        let gpu_layers = if env::var("GPU_LAYERS").unwrap_or_else(|_| "auto".into()) == "auto" {
            device::auto_gpu_layers()
        } else {
            env::var("GPU_LAYERS").unwrap_or_default().parse().context("GPU_LAYERS must be a number or 'auto'")?
        };

        Ok(Self {
            api_host: env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_var("API_PORT", defaults.api_port)?,
            auth_token: None,
            engine,
            backend_url: env::var("BACKEND_URL").unwrap_or(defaults.backend_url),
            llama_bin,
            model_path: env::var("MODEL_PATH").ok().map(PathBuf::from),
            models_dir: env::var("MODELS_DIR").map(PathBuf::from).unwrap_or(defaults.models_dir),
            ctx_size: parse_var("CTX_SIZE", defaults.ctx_size)?,
            threads,
            gpu_layers,
            prewarm: parse_var("PREWARM", defaults.prewarm)?,
            max_body_bytes: parse_var("MAX_BODY_BYTES", defaults.max_body_bytes)?,
            request_timeout_seconds: parse_var("REQUEST_TIMEOUT_SECONDS", defaults.request_timeout_seconds)?,
            idle_unload_seconds: parse_var("IDLE_UNLOAD_SECONDS", defaults.idle_unload_seconds)?,
            remote_url: env::var("REMOTE_URL").ok().filter(|u| !u.trim().is_empty()),
            remote_timeout_ms: parse_var("REMOTE_TIMEOUT_MS", defaults.remote_timeout_ms)?,
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Engine: {:?}", self.engine);
        info!("- Backend URL: {}", self.backend_url);
        match &self.llama_bin {
            Some(bin) => info!("- Llama Binary: {}", bin.display()),
            None => info!("- Llama Binary: none (externally managed backend)"),
        }
        if let Some(model) = &self.model_path {
            info!("- Model Path: {}", model.display());
        }
        info!("- Models Dir: {}", self.models_dir.display());
        info!("- Context Size: {}", self.ctx_size);
        info!("- Threads: {}", self.threads);
        info!("- GPU Layers: {}", self.gpu_layers);
        info!("- System RAM: {} MB", device::total_memory_bytes() / 1024 / 1024);
        info!("- Prewarm: {}", self.prewarm);
        info!("- Max Body: {} bytes", self.max_body_bytes);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        if self.idle_unload_seconds > 0 {
            info!("- Idle Unload: {}s", self.idle_unload_seconds);
        }
        if let Some(url) = &self.remote_url {
            info!("- Remote: {} (timeout {}ms)", url, self.remote_timeout_ms);
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.api_host, self.api_port))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}
