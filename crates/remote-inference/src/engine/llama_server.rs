//! llama-server engine
//!
//! Serves every engine operation from an OpenAI-compatible llama.cpp
//! `llama-server`. When a binary and a model are configured the process is
//! owned by this engine: spawned on first use, killed on `dispose` (and on
//! idle unload, after which the next call spawns it again). Otherwise the
//! backend at `backend_url` is assumed to be managed by someone else.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::device;
use super::types::*;
use super::InferenceEngine;
use crate::config::Config;

const DEFAULT_MODEL: &str = "local-llm";
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

lazy_static! {
    static ref EXPANSION_LINE: Regex = Regex::new(r"(?i)^\s*(lex|vec|hyde)\s*:\s*(.+?)\s*$").unwrap();
}

#[derive(Debug, Clone)]
pub struct LlamaServerConfig {
    pub backend_url: String,
    pub llama_bin: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub models_dir: PathBuf,
    pub ctx_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub startup_timeout: Duration,
    /// Zero disables idle unloading.
    pub idle_timeout: Duration,
}

impl LlamaServerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            backend_url: cfg.backend_url.trim_end_matches('/').to_string(),
            llama_bin: cfg.llama_bin.clone(),
            model_path: cfg.model_path.clone(),
            models_dir: cfg.models_dir.clone(),
            ctx_size: cfg.ctx_size,
            threads: cfg.threads,
            gpu_layers: cfg.gpu_layers,
            startup_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(cfg.idle_unload_seconds),
        }
    }

    /// Both a binary and a model are needed to own the backend process.
    fn manages_process(&self) -> bool {
        self.llama_bin.is_some() && self.model_path.is_some()
    }

    fn model_name(&self) -> String {
        self.model_path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

// ---- llama-server wire types ----

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct BackendRerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct BackendRerankResponse {
    results: Vec<BackendRerankItem>,
}

#[derive(Debug, Deserialize)]
struct BackendRerankItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Debug, Serialize)]
struct BackendTokenizeRequest<'a> {
    content: &'a str,
    add_special: bool,
}

#[derive(Debug, Deserialize)]
struct BackendTokenizeResponse {
    tokens: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct BackendDetokenizeRequest<'a> {
    tokens: &'a [TokenId],
}

#[derive(Debug, Deserialize)]
struct BackendDetokenizeResponse {
    content: String,
}

pub struct LlamaServerEngine {
    config: LlamaServerConfig,
    http_client: reqwest::Client,
    process: Mutex<Option<Child>>,
    started_at: Instant,
    /// Milliseconds since `started_at` of the last call start or finish.
    last_activity_ms: AtomicU64,
    /// Backend calls currently running. The idle reaper leaves the process
    /// alone while this is non-zero.
    in_flight: AtomicUsize,
}

/// Marks one backend call as running; touches activity again when it ends.
struct BackendCall<'a> {
    engine: &'a LlamaServerEngine,
}

impl<'a> BackendCall<'a> {
    fn begin(engine: &'a LlamaServerEngine) -> Self {
        engine.in_flight.fetch_add(1, Ordering::SeqCst);
        engine.touch_activity();
        Self { engine }
    }
}

impl Drop for BackendCall<'_> {
    fn drop(&mut self) {
        self.engine.touch_activity();
        self.engine.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LlamaServerEngine {
    pub fn new(config: LlamaServerConfig) -> anyhow::Result<Self> {
        if let Some(bin) = &config.llama_bin {
            if !bin.exists() {
                return Err(anyhow::anyhow!("llama-server binary not found at: {}", bin.display()));
            }
        }
        if config.manages_process() {
            info!("LLM engine will manage llama-server on {}", config.backend_url);
        } else {
            info!("LLM engine initialized with external backend: {}", config.backend_url);
        }
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to build HTTP client for llama-server")?;
        Ok(Self {
            config,
            http_client,
            process: Mutex::new(None),
            started_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.backend_url, path)
    }

    fn idle_for(&self) -> Duration {
        let now = self.started_at.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    async fn is_ready(&self) -> bool {
        match self.http_client.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Make sure the backend is up, spawning it if this engine owns it.
    async fn ensure_backend(&self) -> anyhow::Result<()> {
        if !self.config.manages_process() {
            return Ok(());
        }

        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!("llama-server exited ({}), restarting", status),
                Err(e) => warn!("Could not poll llama-server: {}, restarting", e),
            }
            *process = None;
        }

        let child = self.spawn_backend()?;
        *process = Some(child);

        let started = Instant::now();
        while started.elapsed() < self.config.startup_timeout {
            if self.is_ready().await {
                info!("✅ llama-server ready after {:.1}s", started.elapsed().as_secs_f64());
                return Ok(());
            }
            if let Some(child) = process.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    *process = None;
                    return Err(anyhow::anyhow!("llama-server exited during startup: {}", status));
                }
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }

        if let Some(mut child) = process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(anyhow::anyhow!(
            "llama-server failed to start within {}s",
            self.config.startup_timeout.as_secs()
        ))
    }

    fn spawn_backend(&self) -> anyhow::Result<Child> {
        let (Some(bin), Some(model)) = (&self.config.llama_bin, &self.config.model_path) else {
            return Err(anyhow::anyhow!("llama-server requires both a binary and a model path"));
        };
        let (host, port) = host_port(&self.config.backend_url)?;

        info!("Starting llama-server for model: {}", model.display());
        info!("  Binary: {}", bin.display());
        info!("  Listen: {}:{}", host, port);
        info!("  Context Size: {}", self.config.ctx_size);
        info!("  GPU Layers: {}", self.config.gpu_layers);

        Command::new(bin)
            .arg("--model").arg(model)
            .arg("--host").arg(&host)
            .arg("--port").arg(port.to_string())
            .arg("--ctx-size").arg(self.config.ctx_size.to_string())
            .arg("--threads").arg(self.config.threads.to_string())
            .arg("--n-gpu-layers").arg(self.config.gpu_layers.to_string())
            .arg("--embeddings")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn llama-server: {}", e))
    }

    async fn stop_backend(&self) {
        kill_backend(&mut *self.process.lock().await);
    }

    /// Whether the owned llama-server process is alive.
    pub async fn backend_running(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn post_json<Req, Res>(&self, path: &str, body: &Req) -> anyhow::Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> Deserialize<'de>,
    {
        let _call = BackendCall::begin(self);
        self.ensure_backend().await?;
        let response = self.http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request to {} failed: {}", path, e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend {} returned {}: {}", path, status, body));
        }
        response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM backend response from {}: {}", path, e))
    }

    async fn embeddings(&self, input: Vec<String>, model: &str) -> anyhow::Result<Vec<Option<Vec<f32>>>> {
        let expected = input.len();
        let response: EmbeddingResponse = self
            .post_json("/v1/embeddings", &EmbeddingRequest { model, input })
            .await?;

        let mut slots = vec![None; expected];
        for (position, data) in response.data.into_iter().enumerate() {
            let index = data.index.unwrap_or(position);
            if index < expected && !data.embedding.is_empty() {
                slots[index] = Some(data.embedding);
            }
        }
        Ok(slots)
    }

    async fn chat(&self, prompt: &str, options: &GenerateOptions) -> anyhow::Result<Option<(String, bool)>> {
        let request = ChatCompletionRequest {
            model: options.model.as_deref().unwrap_or(DEFAULT_MODEL),
            messages: vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }],
            max_tokens: options.max_tokens.unwrap_or(2000),
            temperature: options.temperature.unwrap_or(0.7),
            stream: false,
        };
        let completion: ChatCompletionResponse = self.post_json("/v1/chat/completions", &request).await?;
        Ok(completion.choices.into_iter().next().and_then(|choice| {
            let done = choice.finish_reason.is_some();
            choice.message.map(|m| (m.content, done))
        }))
    }

    /// Resolve a model reference as a path, then under the models directory.
    fn resolve_model(&self, model: &str) -> Option<PathBuf> {
        let direct = Path::new(model);
        let mut candidates = vec![direct.to_path_buf(), self.config.models_dir.join(model)];
        if direct.extension().is_none() {
            candidates.push(self.config.models_dir.join(format!("{}.gguf", model)));
        }
        candidates.into_iter().find(|p| p.is_file())
    }
}

/// Pull `lex:` / `vec:` / `hyde:` lines out of generated text.
fn parse_expansions(text: &str, include_lexical: bool) -> Vec<QueryExpansion> {
    text.lines()
        .filter_map(|line| {
            let caps = EXPANSION_LINE.captures(line)?;
            let kind = QueryKind::parse(&caps[1])?;
            Some(QueryExpansion { kind, text: caps[2].to_string() })
        })
        .filter(|e| include_lexical || e.kind != QueryKind::Lex)
        .collect()
}

fn fallback_expansions(query: &str, include_lexical: bool) -> Vec<QueryExpansion> {
    let mut expansions = Vec::with_capacity(2);
    if include_lexical {
        expansions.push(QueryExpansion { kind: QueryKind::Lex, text: query.to_string() });
    }
    expansions.push(QueryExpansion { kind: QueryKind::Vec, text: query.to_string() });
    expansions
}

fn kill_backend(process: &mut Option<Child>) {
    if let Some(mut child) = process.take() {
        match child.kill() {
            Ok(_) => {
                let _ = child.wait();
                info!("llama-server process stopped");
            }
            Err(e) => warn!("Failed to kill llama-server process: {}", e),
        }
    }
}

fn host_port(url: &str) -> anyhow::Result<(String, u16)> {
    let parsed = reqwest::Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid backend URL {}: {}", url, e))?;
    let host = parsed.host_str().ok_or_else(|| anyhow::anyhow!("Backend URL {} has no host", url))?;
    let port = parsed.port_or_known_default().unwrap_or(8081);
    Ok((host.to_string(), port))
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    async fn embed(&self, text: &str, options: EmbedOptions) -> anyhow::Result<Option<EmbeddingResult>> {
        let model = options.model.unwrap_or_else(|| self.config.model_name());
        let input = match (&options.title, options.is_query) {
            (_, true) => format!("search_query: {}", text),
            (Some(title), false) => format!("search_document: {} | {}", title, text),
            (None, false) => format!("search_document: {}", text),
        };
        let mut slots = self.embeddings(vec![input], &model).await?;
        Ok(slots.pop().flatten().map(|embedding| EmbeddingResult { embedding, model }))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Option<EmbeddingResult>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s) via llama-server", texts.len());
        let model = self.config.model_name();
        let input = texts.into_iter().map(|t| format!("search_document: {}", t)).collect();
        let slots = self.embeddings(input, &model).await?;
        Ok(slots
            .into_iter()
            .map(|slot| slot.map(|embedding| EmbeddingResult { embedding, model: model.clone() }))
            .collect())
    }

    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<Option<GenerateResult>> {
        let model = options.model.clone().unwrap_or_else(|| self.config.model_name());
        Ok(self
            .chat(prompt, &options)
            .await?
            .map(|(text, done)| GenerateResult { text, model, done }))
    }

    async fn expand_query(&self, query: &str, options: ExpandQueryOptions) -> anyhow::Result<Vec<QueryExpansion>> {
        let mut prompt = format!(
            "Expand this search query for a document search engine.\n\
             Query: {}\n",
            query
        );
        if let Some(context) = &options.context {
            prompt.push_str(&format!("Context: {}\n", context));
        }
        prompt.push_str(
            "Reply with one item per line, each prefixed by its type:\n\
             lex: <keyword query>\nvec: <semantic query>\nhyde: <a short passage that would answer the query>",
        );

        let generation = GenerateOptions { max_tokens: Some(300), temperature: Some(0.7), ..Default::default() };
        let expansions = match self.chat(&prompt, &generation).await? {
            Some((text, _)) => parse_expansions(&text, options.include_lexical),
            None => Vec::new(),
        };

        if expansions.is_empty() {
            debug!("Query expansion produced nothing usable, falling back to the raw query");
            return Ok(fallback_expansions(query, options.include_lexical));
        }
        Ok(expansions)
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RerankDocument>,
        options: RerankOptions,
    ) -> anyhow::Result<RerankResult> {
        let model = options.model.unwrap_or_else(|| self.config.model_name());
        if documents.is_empty() {
            return Ok(RerankResult { results: Vec::new(), model });
        }

        let request = BackendRerankRequest {
            model: &model,
            query,
            documents: documents.iter().map(|d| d.text.as_str()).collect(),
            top_n: documents.len(),
        };
        let response: BackendRerankResponse = self.post_json("/v1/rerank", &request).await?;

        let mut results: Vec<RerankedDocument> = response
            .results
            .into_iter()
            .filter_map(|item| {
                documents.get(item.index).map(|doc| RerankedDocument {
                    file: doc.file.clone(),
                    score: item.relevance_score,
                    index: item.index,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(RerankResult { results, model })
    }

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        let response: BackendTokenizeResponse = self
            .post_json("/tokenize", &BackendTokenizeRequest { content: text, add_special: false })
            .await?;
        Ok(response.tokens.into_iter().map(TokenId).collect())
    }

    async fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        Ok(self.tokenize(text).await?.len())
    }

    async fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        let response: BackendDetokenizeResponse = self
            .post_json("/detokenize", &BackendDetokenizeRequest { tokens })
            .await?;
        Ok(response.content)
    }

    async fn model_exists(&self, model: &str) -> anyhow::Result<ModelInfo> {
        let found = self.resolve_model(model);
        let size_bytes = match &found {
            Some(path) => Some(tokio::fs::metadata(path).await?.len()),
            None => None,
        };
        Ok(ModelInfo {
            name: model.to_string(),
            exists: found.is_some(),
            path: found.map(|p| p.to_string_lossy().to_string()),
            size_bytes,
        })
    }

    async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
        let gpu_layers = self.config.gpu_layers;
        tokio::task::spawn_blocking(move || device::probe(gpu_layers))
            .await
            .map_err(|e| anyhow::anyhow!("Device probe failed: {}", e))
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        info!("Shutting down llama-server engine");
        self.stop_backend().await;
        Ok(())
    }

    fn touch_activity(&self) {
        let now = self.started_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    async fn unload_idle_resources(&self) -> anyhow::Result<()> {
        if self.config.idle_timeout.is_zero() {
            return Ok(());
        }
        if self.idle_for() < self.config.idle_timeout {
            return Ok(());
        }

        // Re-check under the lock: a call may have started since.
        let mut process = self.process.lock().await;
        if process.is_none() {
            return Ok(());
        }
        let busy = self.in_flight.load(Ordering::SeqCst);
        if busy > 0 {
            debug!("Keeping llama-server loaded, {} call(s) in flight", busy);
            return Ok(());
        }
        let idle = self.idle_for();
        if idle < self.config.idle_timeout {
            return Ok(());
        }
        info!("Unloading llama-server after {}s idle", idle.as_secs());
        kill_backend(&mut process);
        Ok(())
    }
}

impl Drop for LlamaServerEngine {
    fn drop(&mut self) {
        kill_backend(self.process.get_mut());
    }
}
