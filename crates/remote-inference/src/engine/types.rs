//! Result and option shapes shared by every engine variant.
//!
//! These are the JSON shapes that cross the wire unchanged, so a remote
//! caller deserializes exactly what a local caller would have received.

use serde::{Deserialize, Serialize};

/// Options accepted by `embed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmbedOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Query-side embedding (as opposed to a document being indexed).
    pub is_query: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    pub model: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpandQueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub include_lexical: bool,
}

impl Default for ExpandQueryOptions {
    fn default() -> Self {
        Self {
            context: None,
            include_lexical: true,
        }
    }
}

/// Retrieval channel an expanded query is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Keyword / BM25 search
    Lex,
    /// Vector search
    Vec,
    /// Hypothetical document for vector search
    Hyde,
}

impl QueryKind {
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "lex" => Some(QueryKind::Lex),
            "vec" => Some(QueryKind::Vec),
            "hyde" => Some(QueryKind::Hyde),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExpansion {
    #[serde(rename = "type")]
    pub kind: QueryKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub file: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankedDocument {
    pub file: String,
    pub score: f32,
    /// Position of the document in the request's `documents` list.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Sorted by descending score.
    pub results: Vec<RerankedDocument>,
    pub model: String,
}

/// A single vocabulary id as produced by the engine's tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u32);

impl From<TokenId> for u32 {
    fn from(token: TokenId) -> Self {
        token.0
    }
}

impl From<u32> for TokenId {
    fn from(id: u32) -> Self {
        TokenId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VramUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub gpu: bool,
    pub gpu_offloading: bool,
    pub gpu_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram: Option<VramUsage>,
    pub cpu_cores: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_ignore_unknown_fields() {
        let opts: EmbedOptions =
            serde_json::from_str(r#"{"isQuery":true,"somethingElse":42}"#).unwrap();
        assert!(opts.is_query);
        assert_eq!(opts.model, None);
    }

    #[test]
    fn test_expand_options_default_to_lexical() {
        let opts: ExpandQueryOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.include_lexical);
        assert_eq!(opts, ExpandQueryOptions::default());
    }

    #[test]
    fn test_query_expansion_wire_shape() {
        let expansion = QueryExpansion {
            kind: QueryKind::Hyde,
            text: "a document".to_string(),
        };
        let json = serde_json::to_value(&expansion).unwrap();
        assert_eq!(json, serde_json::json!({"type": "hyde", "text": "a document"}));
    }

    #[test]
    fn test_token_id_is_plain_integer() {
        let tokens = vec![TokenId(1), TokenId(42)];
        assert_eq!(serde_json::to_string(&tokens).unwrap(), "[1,42]");
    }

    #[test]
    fn test_device_info_uses_camel_case() {
        let info = DeviceInfo {
            gpu: false,
            gpu_offloading: false,
            gpu_devices: vec![],
            vram: None,
            cpu_cores: 8,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["cpuCores"], 8);
        assert_eq!(json["gpuOffloading"], false);
        assert!(json.get("vram").is_none());
    }

    #[test]
    fn test_query_kind_parse_is_case_insensitive() {
        assert_eq!(QueryKind::parse("LEX"), Some(QueryKind::Lex));
        assert_eq!(QueryKind::parse("Hyde"), Some(QueryKind::Hyde));
        assert_eq!(QueryKind::parse("sql"), None);
    }
}
