//! Inference server
//!
//! Exposes an `InferenceEngine` over HTTP so a `RemoteEngine` on another
//! machine can use it. Every engine operation is a POST on a fixed path;
//! `/health`, `/device` and `/metrics` are GETs. When a token is configured
//! every path, the unknown ones included, requires `Authorization: Bearer <token>`.
//!
//! State is scoped to one `InferenceServer`, so several can run side by side
//! in a test.

pub mod auth;
pub mod handlers;
pub mod shutdown;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{DefaultBodyLimit, Request},
    handler::Handler,
    middleware,
    routing::{get, post, MethodRouter},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::{timeout::TimeoutLayer, ServiceBuilder};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_MAX_BODY_BYTES};
use crate::credentials::{fingerprint, CredentialStore};
use crate::engine::{self, GenerateOptions, InferenceEngine, RerankDocument, RerankOptions};
use crate::{metrics, protocol};

pub use shutdown::shutdown_signal;

/// Shared by every handler. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub token: Option<Arc<str>>,
    pub started_at: Instant,
}

/// Holds the token, so no `Debug`.
#[derive(Clone)]
pub struct ServerConfig {
    pub token: Option<String>,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    /// Period of the idle reaper; `None` disables it.
    pub idle_unload: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            token: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(600),
            idle_unload: None,
        }
    }
}

impl ServerConfig {
    pub fn from_config(cfg: &Config, token: Option<String>) -> Self {
        Self {
            token,
            max_body_bytes: cfg.max_body_bytes,
            request_timeout: cfg.request_timeout(),
            idle_unload: (cfg.idle_unload_seconds > 0)
                .then(|| Duration::from_secs(cfg.idle_unload_seconds)),
        }
    }
}

pub struct InferenceServer {
    engine: Arc<dyn InferenceEngine>,
    config: ServerConfig,
    started_at: Instant,
}

impl InferenceServer {
    pub fn new(engine: Arc<dyn InferenceEngine>, mut config: ServerConfig) -> Self {
        config.token = config.token.filter(|t| !t.is_empty());
        Self {
            engine,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.config.token.is_some()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            token: self.config.token.as_deref().map(Arc::from),
            started_at: self.started_at,
        };

        Router::new()
            .route(protocol::HEALTH, get_only(handlers::health))
            .route(protocol::DEVICE, get_only(handlers::device))
            .route(protocol::METRICS, get_only(metrics::get_metrics))
            .route(protocol::EMBED, post_only(handlers::embed))
            .route(protocol::EMBED_BATCH, post_only(handlers::embed_batch))
            .route(protocol::GENERATE, post_only(handlers::generate))
            .route(protocol::EXPAND_QUERY, post_only(handlers::expand_query))
            .route(protocol::RERANK, post_only(handlers::rerank))
            .route(protocol::TOKENIZE, post_only(handlers::tokenize))
            .route(protocol::COUNT_TOKENS, post_only(handlers::count_tokens))
            .route(protocol::DETOKENIZE, post_only(handlers::detokenize))
            .route(protocol::MODEL_EXISTS, post_only(handlers::model_exists))
            .fallback(handlers::unknown_route)
            .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(CatchPanicLayer::custom(handlers::panic_response))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handlers::request_timed_out))
                    .layer(TimeoutLayer::new(self.config.request_timeout)),
            )
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                tracing::info_span!(
                    "request",
                    id = %Uuid::new_v4(),
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }))
            .with_state(state)
    }

    /// Run embed, a one-token generate and rerank once so lazy model loading
    /// happens before the first client request. Failures only warn.
    pub async fn prewarm(&self) {
        info!("🔥 Pre-warming inference engine");
        let total = Instant::now();

        let stage = Instant::now();
        match self.engine.embed("warmup", Default::default()).await {
            Ok(_) => info!("   embed ready in {:?}", stage.elapsed()),
            Err(e) => warn!("⚠️  Pre-warm embed failed after {:?}: {:#}", stage.elapsed(), e),
        }

        let stage = Instant::now();
        let options = GenerateOptions {
            max_tokens: Some(1),
            ..Default::default()
        };
        match self.engine.generate("warmup", options).await {
            Ok(_) => info!("   generate ready in {:?}", stage.elapsed()),
            Err(e) => warn!("⚠️  Pre-warm generate failed after {:?}: {:#}", stage.elapsed(), e),
        }

        let stage = Instant::now();
        let documents = vec![RerankDocument {
            file: "warmup".to_string(),
            text: "warmup".to_string(),
            title: None,
        }];
        match self.engine.rerank("warmup", documents, RerankOptions::default()).await {
            Ok(_) => info!("   rerank ready in {:?}", stage.elapsed()),
            Err(e) => warn!("⚠️  Pre-warm rerank failed after {:?}: {:#}", stage.elapsed(), e),
        }

        info!("✅ Pre-warm finished in {:?}", total.elapsed());
    }

    fn spawn_idle_reaper(&self) -> Option<JoinHandle<()>> {
        let period = self.config.idle_unload.filter(|p| !p.is_zero())?;
        let engine = self.engine.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.unload_idle_resources().await {
                    warn!("Idle unload failed: {:#}", e);
                }
            }
        }))
    }

    /// Serve until `shutdown` resolves, then dispose the engine.
    ///
    /// Consumes the server, so dispose runs exactly once and only after the
    /// listener has stopped accepting and in-flight requests have drained.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let reaper = self.spawn_idle_reaper();
        let app = self.router();

        info!("🚀 Inference server listening on http://{}", addr);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(reaper) = reaper {
            reaper.abort();
            let _ = reaper.await;
        }

        info!("Releasing inference engine");
        let disposed = self.engine.dispose().await;

        served.context("Inference server failed")?;
        disposed.context("Failed to dispose inference engine")?;
        info!("Inference server stopped");
        Ok(())
    }

    /// `serve` until Ctrl-C or SIGTERM.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        self.serve(listener, shutdown_signal()).await
    }
}

fn post_only<H, T>(handler: H) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    post(handler).fallback(handlers::method_not_allowed)
}

fn get_only<H, T>(handler: H) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    get(handler).fallback(handlers::method_not_allowed)
}

/// Entry point of `remote-inference serve`.
pub async fn run_inference_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    metrics::init_metrics();
    cfg.print_config();

    let token = cfg
        .auth_token
        .clone()
        .or_else(|| CredentialStore::default().current_token());
    match &token {
        Some(token) => info!("🔐 Bearer authentication enabled (token {})", fingerprint(token)),
        None => warn!("⚠️  No inference token configured, every request will be accepted"),
    }

    let engine = engine::local_engine(&cfg)?;
    let server = InferenceServer::new(engine, ServerConfig::from_config(&cfg, token));
    if cfg.prewarm {
        server.prewarm().await;
    }

    let addr = cfg.api_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    server.run(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request as HttpRequest, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret-token";

    /// Engine whose every operation fails; `expand_query` panics and
    /// `count_tokens` is slow.
    struct BrokenEngine;

    #[async_trait]
    impl InferenceEngine for BrokenEngine {
        async fn embed(&self, _: &str, _: EmbedOptions) -> anyhow::Result<Option<EmbeddingResult>> {
            anyhow::bail!("model not loaded")
        }
        async fn embed_batch(&self, _: Vec<String>) -> anyhow::Result<Vec<Option<EmbeddingResult>>> {
            anyhow::bail!("model not loaded")
        }
        async fn generate(&self, _: &str, _: GenerateOptions) -> anyhow::Result<Option<GenerateResult>> {
            anyhow::bail!("model not loaded")
        }
        async fn expand_query(&self, _: &str, _: ExpandQueryOptions) -> anyhow::Result<Vec<QueryExpansion>> {
            panic!("expander exploded")
        }
        async fn rerank(&self, _: &str, _: Vec<RerankDocument>, _: RerankOptions) -> anyhow::Result<RerankResult> {
            anyhow::bail!("reranker out of memory")
        }
        async fn tokenize(&self, _: &str) -> anyhow::Result<Vec<TokenId>> {
            anyhow::bail!("model not loaded")
        }
        async fn count_tokens(&self, _: &str) -> anyhow::Result<usize> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            anyhow::bail!("model not loaded")
        }
        async fn detokenize(&self, _: &[TokenId]) -> anyhow::Result<String> {
            anyhow::bail!("model not loaded")
        }
        async fn model_exists(&self, _: &str) -> anyhow::Result<ModelInfo> {
            anyhow::bail!("model not loaded")
        }
        async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
            anyhow::bail!("no devices")
        }
        async fn dispose(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn echo_router(token: Option<&str>) -> Router {
        let config = ServerConfig {
            token: token.map(str::to_string),
            ..Default::default()
        };
        InferenceServer::new(Arc::new(EchoEngine::new()), config).router()
    }

    fn broken_router() -> Router {
        InferenceServer::new(Arc::new(BrokenEngine), ServerConfig::default()).router()
    }

    fn request(method: Method, path: &str, auth: Option<&str>, body: &str) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ===== Authentication =====

    #[tokio::test]
    async fn test_missing_or_wrong_token_is_rejected_on_every_path() {
        let paths = [
            (Method::GET, "/health"),
            (Method::GET, "/device"),
            (Method::GET, "/metrics"),
            (Method::POST, "/embed"),
            (Method::POST, "/tokenize"),
            (Method::POST, "/nonexistent"),
        ];
        let bad_headers = [None, Some("Bearer wrong"), Some(TOKEN), Some("Basic s3cret-token")];

        for (method, path) in paths.iter() {
            for auth in bad_headers.iter() {
                let response = echo_router(Some(TOKEN))
                    .oneshot(request(method.clone(), path, *auth, r#"{"text":"hi"}"#))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {} {:?}", method, path, auth);
                assert_eq!(json_body(response).await, json!({"error": "Unauthorized"}));
            }
        }
    }

    #[tokio::test]
    async fn test_matching_token_is_accepted_case_insensitively() {
        for auth in ["Bearer s3cret-token", "bearer s3cret-token", "BEARER s3cret-token"] {
            let response = echo_router(Some(TOKEN))
                .oneshot(request(Method::GET, "/health", Some(auth), ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_no_token_accepts_any_headers() {
        for auth in [None, Some("Bearer whatever"), Some("garbage")] {
            let response = echo_router(None)
                .oneshot(request(Method::POST, "/count-tokens", auth, r#"{"text":"abc"}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_body(response).await, json!({"count": 3}));
        }
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let config = ServerConfig {
            token: Some(String::new()),
            ..Default::default()
        };
        let server = InferenceServer::new(Arc::new(EchoEngine::new()), config);
        assert!(!server.requires_auth());
    }

    // ===== Routing =====

    #[tokio::test]
    async fn test_health_reports_uptime() {
        let response = echo_router(None)
            .oneshot(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["uptime"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_device_returns_engine_info() {
        let response = echo_router(None)
            .oneshot(request(Method::GET, "/device", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["gpu"], false);
        assert!(body["cpuCores"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_embed_returns_engine_shape() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/embed", None, r#"{"text":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["model"], "echo");
        assert!(!body["embedding"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_of_empty_text_is_null() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/embed", None, r#"{"text":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, Value::Null);
    }

    #[tokio::test]
    async fn test_tokenize_returns_plain_integers() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/tokenize", None, r#"{"text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"tokens": [104, 105]}));
    }

    #[tokio::test]
    async fn test_detokenize_wraps_text() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/detokenize", None, r#"{"tokens":[104,105]}"#))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_unparsable_body_is_400() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/embed", None, "{bad json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({"error": "Invalid JSON body"}));
    }

    #[tokio::test]
    async fn test_missing_field_is_500() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/generate", None, r#"{"text":"wrong field"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("prompt"));
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        for (method, path) in [(Method::GET, "/embed"), (Method::PUT, "/rerank"), (Method::POST, "/health")] {
            let response = echo_router(None)
                .oneshot(request(method, path, None, ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(json_body(response).await, json!({"error": "Method not allowed"}));
        }
    }

    #[tokio::test]
    async fn test_wrong_method_is_counted() {
        metrics::init_metrics();
        let response = echo_router(None)
            .oneshot(request(Method::GET, "/detokenize", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let text = String::from_utf8(metrics::render()).unwrap();
        assert!(text.contains(r#"inference_requests_total{route="/detokenize",status="405"}"#));
    }

    #[tokio::test]
    async fn test_unknown_route_with_unparsable_body_is_400() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/nonexistent", None, "{bad json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({"error": "Invalid JSON body"}));
    }

    #[tokio::test]
    async fn test_unknown_route_without_body_is_404() {
        for method in [Method::POST, Method::GET] {
            let response = echo_router(None)
                .oneshot(request(method, "/nonexistent", None, ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(response).await, json!({"error": "Unknown route: /nonexistent"}));
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = echo_router(None)
            .oneshot(request(Method::POST, "/nonexistent", None, "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await, json!({"error": "Unknown route: /nonexistent"}));
    }

    #[tokio::test]
    async fn test_oversize_body_is_413() {
        let config = ServerConfig {
            max_body_bytes: 16,
            ..Default::default()
        };
        let router = InferenceServer::new(Arc::new(EchoEngine::new()), config).router();
        let body = json!({"text": "x".repeat(64)}).to_string();
        let response = router
            .oneshot(request(Method::POST, "/embed", None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("length limit exceeded"));
    }

    #[tokio::test]
    async fn test_slow_request_is_408_with_error_body() {
        let config = ServerConfig {
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let router = InferenceServer::new(Arc::new(BrokenEngine), config).router();
        let started = Instant::now();
        let response = router
            .oneshot(request(Method::POST, "/count-tokens", None, r#"{"text":"abc"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(json_body(response).await, json!({"error": "Request timed out"}));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    // ===== Failures =====

    #[tokio::test]
    async fn test_engine_error_is_500_with_message() {
        let body = r#"{"query":"q","documents":[{"file":"a","text":"b"}]}"#;
        let response = broken_router()
            .oneshot(request(Method::POST, "/rerank", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await, json!({"error": "reranker out of memory"}));
    }

    #[tokio::test]
    async fn test_device_failure_is_500() {
        let response = broken_router()
            .oneshot(request(Method::GET, "/device", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await, json!({"error": "no devices"}));
    }

    #[tokio::test]
    async fn test_panicking_engine_is_500_and_router_survives() {
        let router = broken_router();
        let response = router
            .clone()
            .oneshot(request(Method::POST, "/expand-query", None, r#"{"query":"q"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("expander exploded"));

        let response = router
            .oneshot(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn test_requests_reach_the_shared_engine() {
        let engine = Arc::new(EchoEngine::new());
        let router = InferenceServer::new(engine.clone(), ServerConfig::default()).router();
        router
            .oneshot(request(Method::POST, "/count-tokens", None, r#"{"text":"abc"}"#))
            .await
            .unwrap();
        assert_eq!(engine.activity_count(), 1);
    }

    #[tokio::test]
    async fn test_prewarm_tolerates_failures() {
        let server = InferenceServer::new(Arc::new(BrokenEngine), ServerConfig::default());
        server.prewarm().await;

        let response = server
            .router()
            .oneshot(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_prewarm_runs_against_healthy_engine() {
        let engine = Arc::new(EchoEngine::new());
        let server = InferenceServer::new(engine.clone(), ServerConfig::default());
        server.prewarm().await;
        assert_eq!(engine.dispose_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_disposes_once_after_shutdown() {
        let engine = Arc::new(EchoEngine::new());
        let server = InferenceServer::new(engine.clone(), ServerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(engine.dispose_count(), 1);
    }

    #[test]
    fn test_server_config_from_config() {
        let cfg = Config {
            idle_unload_seconds: 30,
            request_timeout_seconds: 5,
            ..Default::default()
        };
        let server_cfg = ServerConfig::from_config(&cfg, Some("t".into()));
        assert_eq!(server_cfg.idle_unload, Some(Duration::from_secs(30)));
        assert_eq!(server_cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(server_cfg.token.as_deref(), Some("t"));

        let server_cfg = ServerConfig::from_config(&Config::default(), None);
        assert!(server_cfg.idle_unload.is_none());
    }
}
