//! Deterministic in-process engine.
//!
//! No models, no devices: tokens are UTF-8 bytes, embeddings are folded byte
//! histograms and reranking is lexical overlap. Good enough to exercise the
//! protocol end to end and to smoke-test a deployment with `ENGINE=echo`.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::types::*;
use super::InferenceEngine;

const MODEL_NAME: &str = "echo";
const EMBEDDING_DIM: usize = 16;

#[derive(Debug, Default)]
pub struct EchoEngine {
    dispose_calls: AtomicUsize,
    activity: AtomicUsize,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `dispose` has run.
    pub fn dispose_count(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn activity_count(&self) -> usize {
        self.activity.load(Ordering::SeqCst)
    }

    fn embed_text(text: &str) -> Option<EmbeddingResult> {
        if text.is_empty() {
            return None;
        }
        let mut embedding = vec![0f32; EMBEDDING_DIM];
        for (i, byte) in text.bytes().enumerate() {
            embedding[i % EMBEDDING_DIM] += f32::from(byte) / 255.0;
        }
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|v| *v /= norm);
        }
        Some(EmbeddingResult {
            embedding,
            model: MODEL_NAME.to_string(),
        })
    }

    fn overlap_score(query_terms: &[String], text: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let text = text.to_lowercase();
        let hits = query_terms.iter().filter(|t| text.contains(t.as_str())).count();
        hits as f32 / query_terms.len() as f32
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn embed(&self, text: &str, _options: EmbedOptions) -> anyhow::Result<Option<EmbeddingResult>> {
        self.touch_activity();
        Ok(Self::embed_text(text))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Option<EmbeddingResult>>> {
        self.touch_activity();
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }

    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<Option<GenerateResult>> {
        self.touch_activity();
        if prompt.trim().is_empty() {
            return Ok(None);
        }
        let limit = options.max_tokens.map(|n| n as usize).unwrap_or(usize::MAX);
        let text = prompt.split_whitespace().take(limit).collect::<Vec<_>>().join(" ");
        Ok(Some(GenerateResult {
            text,
            model: options.model.unwrap_or_else(|| MODEL_NAME.to_string()),
            done: true,
        }))
    }

    async fn expand_query(&self, query: &str, options: ExpandQueryOptions) -> anyhow::Result<Vec<QueryExpansion>> {
        self.touch_activity();
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mut expansions = Vec::with_capacity(3);
        if options.include_lexical {
            expansions.push(QueryExpansion { kind: QueryKind::Lex, text: query.to_string() });
        }
        expansions.push(QueryExpansion { kind: QueryKind::Vec, text: query.to_string() });
        let hyde = match options.context {
            Some(context) => format!("{} ({})", query, context),
            None => format!("Information about {}", query),
        };
        expansions.push(QueryExpansion { kind: QueryKind::Hyde, text: hyde });
        Ok(expansions)
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RerankDocument>,
        options: RerankOptions,
    ) -> anyhow::Result<RerankResult> {
        self.touch_activity();
        let terms: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
        let mut results: Vec<RerankedDocument> = documents
            .into_iter()
            .enumerate()
            .map(|(index, doc)| RerankedDocument {
                score: Self::overlap_score(&terms, &doc.text),
                file: doc.file,
                index,
            })
            .collect();
        // stable: equal scores keep request order
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(RerankResult {
            results,
            model: options.model.unwrap_or_else(|| MODEL_NAME.to_string()),
        })
    }

    async fn tokenize(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        self.touch_activity();
        Ok(text.bytes().map(|b| TokenId(u32::from(b))).collect())
    }

    async fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        self.touch_activity();
        Ok(text.len())
    }

    async fn detokenize(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        self.touch_activity();
        let bytes = tokens
            .iter()
            .map(|t| u8::try_from(t.0).map_err(|_| anyhow::anyhow!("Token id {} is out of vocabulary", t.0)))
            .collect::<anyhow::Result<Vec<u8>>>()?;
        String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("Tokens do not decode to UTF-8: {}", e))
    }

    async fn model_exists(&self, model: &str) -> anyhow::Result<ModelInfo> {
        Ok(ModelInfo {
            name: model.to_string(),
            exists: model == MODEL_NAME,
            path: None,
            size_bytes: None,
        })
    }

    async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
        Ok(DeviceInfo {
            gpu: false,
            gpu_offloading: false,
            gpu_devices: Vec::new(),
            vram: None,
            cpu_cores: num_cpus::get(),
        })
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        let calls = self.dispose_calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Echo engine disposed ({} call(s))", calls);
        Ok(())
    }

    fn touch_activity(&self) {
        self.activity.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_embed_empty_text_is_none() {
        let engine = EchoEngine::new();
        assert!(engine.embed("", EmbedOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_embedding_is_normalized() {
        let engine = EchoEngine::new();
        let result = engine.embed("hello world", EmbedOptions::default()).await.unwrap().unwrap();
        assert_eq!(result.embedding.len(), EMBEDDING_DIM);
        let norm: f32 = result.embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_embed_batch_keeps_positions() {
        let engine = EchoEngine::new();
        let results = engine
            .embed_batch(vec!["a".into(), "".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[tokio::test]
    async fn test_generate_respects_max_tokens() {
        let engine = EchoEngine::new();
        let opts = GenerateOptions { max_tokens: Some(1), ..Default::default() };
        let result = engine.generate("one two three", opts).await.unwrap().unwrap();
        assert_eq!(result.text, "one");
        assert!(result.done);
    }

    #[tokio::test]
    async fn test_expand_query_without_lexical() {
        let engine = EchoEngine::new();
        let opts = ExpandQueryOptions { include_lexical: false, context: None };
        let expansions = engine.expand_query("rust async", opts).await.unwrap();
        assert!(expansions.iter().all(|e| e.kind != QueryKind::Lex));
        assert_eq!(expansions.len(), 2);
    }

    #[tokio::test]
    async fn test_rerank_orders_by_overlap() {
        let engine = EchoEngine::new();
        let docs = vec![
            RerankDocument { file: "a.md".into(), text: "nothing here".into(), title: None },
            RerankDocument { file: "b.md".into(), text: "Tokio async runtime".into(), title: None },
        ];
        let result = engine.rerank("async tokio", docs, RerankOptions::default()).await.unwrap();
        assert_eq!(result.results[0].file, "b.md");
        assert_eq!(result.results[0].index, 1);
        assert_eq!(result.results[0].score, 1.0);
        assert_eq!(result.results[1].score, 0.0);
    }

    #[tokio::test]
    async fn test_detokenize_rejects_out_of_vocabulary() {
        let engine = EchoEngine::new();
        assert!(engine.detokenize(&[TokenId(300)]).await.is_err());
    }

    #[tokio::test]
    async fn test_dispose_is_counted() {
        let engine = EchoEngine::new();
        engine.dispose().await.unwrap();
        assert_eq!(engine.dispose_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_tokenize_round_trips(text in ".{0,64}") {
            let engine = EchoEngine::new();
            let tokens = tokio_test::block_on(engine.tokenize(&text)).unwrap();
            let count = tokio_test::block_on(engine.count_tokens(&text)).unwrap();
            prop_assert_eq!(tokens.len(), count);
            let decoded = tokio_test::block_on(engine.detokenize(&tokens)).unwrap();
            prop_assert_eq!(decoded, text);
        }
    }
}
