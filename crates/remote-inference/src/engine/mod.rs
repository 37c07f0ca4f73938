//! Inference engine interface
//!
//! One async capability set, two kinds of implementation:
//! - Local engines own the models (`LlamaServerEngine`, `EchoEngine`)
//! - The remote proxy (`crate::remote::RemoteEngine`) forwards every call
//!   to an `InferenceServer` on another machine
//!
//! Calling code holds an `Arc<dyn InferenceEngine>` and cannot tell the two apart.

pub mod device;
pub mod echo;
pub mod llama_server;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use echo::EchoEngine;
pub use llama_server::{LlamaServerConfig, LlamaServerEngine};
pub use types::*;

use crate::config::{Config, EngineKind};
use crate::credentials::CredentialStore;
use crate::remote::RemoteEngine;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn embed(&self, text: &str, options: EmbedOptions) -> anyhow::Result<Option<EmbeddingResult>>;

    /// Results are positionally aligned with `texts`; a text that could not be
    /// embedded yields `None` in its slot.
    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Option<EmbeddingResult>>>;

    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<Option<GenerateResult>>;

    async fn expand_query(&self, query: &str, options: ExpandQueryOptions) -> anyhow::Result<Vec<QueryExpansion>>;

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RerankDocument>,
        options: RerankOptions,
    ) -> anyhow::Result<RerankResult>;

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>>;

    async fn count_tokens(&self, text: &str) -> anyhow::Result<usize>;

    async fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String>;

    async fn model_exists(&self, model: &str) -> anyhow::Result<ModelInfo>;

    async fn device_info(&self) -> anyhow::Result<DeviceInfo>;

    /// Release models and devices. Called once, at shutdown.
    async fn dispose(&self) -> anyhow::Result<()>;

    fn touch_activity(&self) {}

    async fn unload_idle_resources(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Build the engine client code should talk to.
///
/// With `remote_url` configured this is the HTTP proxy (token taken from the
/// explicit override, else the credential store); otherwise the local engine
/// selected by `engine`.
pub fn connect(cfg: &Config) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    if let Some(url) = &cfg.remote_url {
        let token = cfg
            .auth_token
            .clone()
            .or_else(|| CredentialStore::default().current_token());
        info!("Using remote inference at {}", url);
        return Ok(Arc::new(RemoteEngine::new(url, token, cfg.remote_timeout())?));
    }
    local_engine(cfg)
}

/// Build the engine a server hosts. Never the remote proxy.
pub fn local_engine(cfg: &Config) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    match cfg.engine {
        EngineKind::Echo => {
            info!("Using echo engine");
            Ok(Arc::new(EchoEngine::new()))
        }
        EngineKind::Llama => {
            let engine = LlamaServerEngine::new(LlamaServerConfig::from_config(cfg))?;
            Ok(Arc::new(engine))
        }
    }
}
