//! Remote proxy engine
//!
//! Implements `InferenceEngine` by forwarding each call to an
//! `InferenceServer` over HTTP. Every call gets its own deadline; when it
//! elapses the in-flight request is dropped (aborting the connection) and the
//! call fails with `RemoteError::Timeout`. No retries: failures surface
//! to the caller immediately.

pub mod error;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub use error::RemoteError;

use crate::config::DEFAULT_REMOTE_TIMEOUT_MS;
use crate::engine::*;
use crate::protocol::{self, *};

#[derive(Clone)]
pub struct RemoteEngine {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl RemoteEngine {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for remote inference")?;
        debug!("Remote engine targeting {} (timeout {}ms)", base_url, timeout.as_millis());
        Ok(Self {
            base_url,
            token,
            timeout,
            http_client,
        })
    }

    /// Proxy with the default two-minute deadline.
    pub fn with_default_timeout(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        Self::new(base_url, token, Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn health(&self) -> anyhow::Result<HealthStatus> {
        Ok(self.get(protocol::HEALTH).await?)
    }

    async fn post<B, T>(&self, path: &'static str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http_client.post(format!("{}{}", self.base_url, path)).json(body);
        self.execute(path, request).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &'static str) -> Result<T, RemoteError> {
        let request = self.http_client.get(format!("{}{}", self.base_url, path));
        self.execute(path, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        path: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let call = async {
            let response = request.send().await.map_err(|source| RemoteError::Network {
                path: path.to_string(),
                source,
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RemoteError::status(path, status.as_u16(), &body));
            }

            let bytes = response.bytes().await.map_err(|source| RemoteError::Network {
                path: path.to_string(),
                source,
            })?;
            serde_json::from_slice(&bytes).map_err(|source| RemoteError::Decode {
                path: path.to_string(),
                source,
            })
        };

        // Dropping `call` on expiry aborts the request; the timer is dropped
        // with the `Timeout` future either way.
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl InferenceEngine for RemoteEngine {
    async fn embed(&self, text: &str, options: EmbedOptions) -> anyhow::Result<Option<EmbeddingResult>> {
        let body = EmbedRequest { text: text.to_string(), options: Some(options) };
        Ok(self.post(protocol::EMBED, &body).await?)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Option<EmbeddingResult>>> {
        Ok(self.post(protocol::EMBED_BATCH, &EmbedBatchRequest { texts }).await?)
    }

    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<Option<GenerateResult>> {
        let body = GenerateRequest { prompt: prompt.to_string(), options: Some(options) };
        Ok(self.post(protocol::GENERATE, &body).await?)
    }

    async fn expand_query(&self, query: &str, options: ExpandQueryOptions) -> anyhow::Result<Vec<QueryExpansion>> {
        let body = ExpandQueryRequest { query: query.to_string(), options: Some(options) };
        Ok(self.post(protocol::EXPAND_QUERY, &body).await?)
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RerankDocument>,
        options: RerankOptions,
    ) -> anyhow::Result<RerankResult> {
        let body = RerankRequest { query: query.to_string(), documents, options: Some(options) };
        Ok(self.post(protocol::RERANK, &body).await?)
    }

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        let response: TokensResponse = self
            .post(protocol::TOKENIZE, &TextRequest { text: text.to_string() })
            .await?;
        Ok(response.tokens.into_iter().map(TokenId).collect())
    }

    async fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        let response: CountResponse = self
            .post(protocol::COUNT_TOKENS, &TextRequest { text: text.to_string() })
            .await?;
        Ok(response.count)
    }

    async fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        let response: TextResponse = self
            .post(protocol::DETOKENIZE, &DetokenizeRequest { tokens: tokens.to_vec() })
            .await?;
        Ok(response.text)
    }

    async fn model_exists(&self, model: &str) -> anyhow::Result<ModelInfo> {
        Ok(self
            .post(protocol::MODEL_EXISTS, &ModelExistsRequest { model: model.to_string() })
            .await?)
    }

    async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
        Ok(self.get(protocol::DEVICE).await?)
    }

    // Models live on the server; nothing to release here.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
