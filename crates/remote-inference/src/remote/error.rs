use std::time::Duration;

use thiserror::Error;

/// Longest error body kept in a `Status` message.
const MAX_BODY_CHARS: usize = 1024;

/// Why a proxied call failed. Travels inside `anyhow::Error`; recover it with
/// `err.downcast_ref::<RemoteError>()`.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote inference {path} timed out after {}ms", .timeout.as_millis())]
    Timeout { path: String, timeout: Duration },

    #[error("remote inference {path} request failed: {source}")]
    Network {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("remote inference {path} failed with status {status}: {body}")]
    Status { path: String, status: u16, body: String },

    #[error("remote inference {path} returned an unreadable response: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RemoteError {
    pub fn status(path: &str, status: u16, body: &str) -> Self {
        RemoteError::Status {
            path: path.to_string(),
            status,
            body: truncate_body(body),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout { .. })
    }

    pub fn path(&self) -> &str {
        match self {
            RemoteError::Timeout { path, .. }
            | RemoteError::Network { path, .. }
            | RemoteError::Status { path, .. }
            | RemoteError::Decode { path, .. } => path,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
