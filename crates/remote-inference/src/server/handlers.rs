//! Route handlers
//!
//! Every POST route goes through `dispatch`: parse the body as JSON (400 if
//! it isn't), pull the operation's fields out of it, call the engine and
//! serialize whatever comes back. Field extraction and engine failures both
//! end up as `500 {error}`; the listener keeps serving. Every non-2xx answer,
//! including an oversize body or a timeout, carries an `{error}` body.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::BytesRejection, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    BoxError, Json,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use super::AppState;
use crate::engine::InferenceEngine;
use crate::metrics;
use crate::protocol::{self, *};

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

/// Used by `CatchPanicLayer`: a panicking engine call becomes a 500.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Handler panicked: {}", detail);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", detail))
}

/// Keeps the in-flight gauge honest even if the engine call panics.
struct InFlight {
    route: &'static str,
    started: Instant,
}

impl InFlight {
    fn start(route: &'static str) -> Self {
        metrics::inc_in_flight();
        Self { route, started: Instant::now() }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::dec_in_flight();
        metrics::observe_duration(self.route, self.started.elapsed().as_secs_f64());
    }
}

fn respond<T: Serialize>(route: &'static str, result: anyhow::Result<T>) -> Response {
    match result {
        Ok(value) => {
            metrics::inc_request(route, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(value)).into_response()
        }
        Err(e) => {
            error!("Request to {} failed: {:#}", route, e);
            metrics::inc_request(route, StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

/// Turns `tower::timeout` expiry into `408 {error}`.
pub async fn request_timed_out(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        metrics::inc_request("timeout", StatusCode::REQUEST_TIMEOUT.as_u16());
        error_response(StatusCode::REQUEST_TIMEOUT, "Request timed out")
    } else {
        error!("Unhandled middleware error: {}", err);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", err))
    }
}

fn body_rejected(route: &str, rejection: BytesRejection) -> Response {
    let status = rejection.status();
    debug!("Rejected body for {}: {}", route, rejection.body_text());
    metrics::inc_request(route, status.as_u16());
    error_response(status, rejection.body_text())
}

async fn dispatch<Req, Res, F, Fut>(
    state: AppState,
    route: &'static str,
    body: Result<Bytes, BytesRejection>,
    op: F,
) -> Response
where
    Req: DeserializeOwned,
    Res: Serialize,
    F: FnOnce(Arc<dyn InferenceEngine>, Req) -> Fut,
    Fut: Future<Output = anyhow::Result<Res>>,
{
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return body_rejected(route, rejection),
    };
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!("Unparsable body for {}: {}", route, e);
            metrics::inc_request(route, StatusCode::BAD_REQUEST.as_u16());
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
        }
    };

    let _in_flight = InFlight::start(route);
    let result = match serde_json::from_value::<Req>(value) {
        Ok(request) => op(state.engine.clone(), request).await,
        Err(e) => Err(anyhow::anyhow!("Invalid {} request: {}", route, e)),
    };
    respond(route, result)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    metrics::inc_request(protocol::HEALTH, StatusCode::OK.as_u16());
    Json(HealthStatus {
        status: "ok".to_string(),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

pub async fn device(State(state): State<AppState>) -> Response {
    let _in_flight = InFlight::start(protocol::DEVICE);
    respond(protocol::DEVICE, state.engine.device_info().await)
}

pub async fn embed(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::EMBED, body, |engine, req: EmbedRequest| async move {
        engine.embed(&req.text, req.options.unwrap_or_default()).await
    })
    .await
}

pub async fn embed_batch(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::EMBED_BATCH, body, |engine, req: EmbedBatchRequest| async move {
        engine.embed_batch(req.texts).await
    })
    .await
}

pub async fn generate(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::GENERATE, body, |engine, req: GenerateRequest| async move {
        engine.generate(&req.prompt, req.options.unwrap_or_default()).await
    })
    .await
}

pub async fn expand_query(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::EXPAND_QUERY, body, |engine, req: ExpandQueryRequest| async move {
        engine.expand_query(&req.query, req.options.unwrap_or_default()).await
    })
    .await
}

pub async fn rerank(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::RERANK, body, |engine, req: RerankRequest| async move {
        engine
            .rerank(&req.query, req.documents, req.options.unwrap_or_default())
            .await
    })
    .await
}

pub async fn tokenize(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::TOKENIZE, body, |engine, req: TextRequest| async move {
        let tokens = engine.tokenize(&req.text).await?;
        Ok::<_, anyhow::Error>(TokensResponse {
            tokens: tokens.into_iter().map(u32::from).collect(),
        })
    })
    .await
}

pub async fn count_tokens(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::COUNT_TOKENS, body, |engine, req: TextRequest| async move {
        let count = engine.count_tokens(&req.text).await?;
        Ok::<_, anyhow::Error>(CountResponse { count })
    })
    .await
}

pub async fn detokenize(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::DETOKENIZE, body, |engine, req: DetokenizeRequest| async move {
        let text = engine.detokenize(&req.tokens).await?;
        Ok::<_, anyhow::Error>(TextResponse { text })
    })
    .await
}

pub async fn model_exists(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    dispatch(state, protocol::MODEL_EXISTS, body, |engine, req: ModelExistsRequest| async move {
        engine.model_exists(&req.model).await
    })
    .await
}

pub async fn method_not_allowed(uri: Uri) -> Response {
    metrics::inc_request(uri.path(), StatusCode::METHOD_NOT_ALLOWED.as_u16());
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

/// A POST with a non-empty body that is not JSON is a 400 here too, the same
/// as on a known route; anything else is a 404.
pub async fn unknown_route(method: Method, uri: Uri, body: Result<Bytes, BytesRejection>) -> Response {
    if method == Method::POST {
        match body {
            Err(rejection) => return body_rejected("unknown", rejection),
            Ok(body) if !body.is_empty() && serde_json::from_slice::<serde_json::Value>(&body).is_err() => {
                metrics::inc_request("unknown", StatusCode::BAD_REQUEST.as_u16());
                return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
            }
            Ok(_) => {}
        }
    }
    metrics::inc_request("unknown", StatusCode::NOT_FOUND.as_u16());
    error_response(StatusCode::NOT_FOUND, format!("Unknown route: {}", uri.path()))
}
