//! Wire contract between `InferenceServer` and `RemoteEngine`.
//!
//! Route paths and the JSON envelopes for each of them. Both sides build
//! from these types so the two can never drift apart. Envelopes are fixed
//! and versionless; unknown fields are ignored.

use serde::{Deserialize, Serialize};

use crate::engine::{
    EmbedOptions, ExpandQueryOptions, GenerateOptions, RerankDocument, RerankOptions, TokenId,
};

pub const HEALTH: &str = "/health";
pub const DEVICE: &str = "/device";
pub const METRICS: &str = "/metrics";
pub const EMBED: &str = "/embed";
pub const EMBED_BATCH: &str = "/embed-batch";
pub const GENERATE: &str = "/generate";
pub const EXPAND_QUERY: &str = "/expand-query";
pub const RERANK: &str = "/rerank";
pub const TOKENIZE: &str = "/tokenize";
pub const COUNT_TOKENS: &str = "/count-tokens";
pub const DETOKENIZE: &str = "/detokenize";
pub const MODEL_EXISTS: &str = "/model-exists";

// ---- requests ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<EmbedOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedBatchRequest {
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerateOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandQueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ExpandQueryOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<RerankDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RerankOptions>,
}

/// Body of `/tokenize` and `/count-tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizeRequest {
    pub tokens: Vec<TokenId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelExistsRequest {
    pub model: String,
}

// ---- responses ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokensResponse {
    pub tokens: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

/// Body of the `/detokenize` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Seconds since the server started.
    pub uptime: f64,
}

/// The only failure shape; always paired with a non-2xx status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
