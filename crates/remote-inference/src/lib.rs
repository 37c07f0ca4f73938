// remote-inference/crates/remote-inference/src/lib.rs

pub mod config;
pub mod credentials;
pub mod engine;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod telemetry;

// Public API exports
pub use config::{Config, EngineKind};
pub use credentials::CredentialStore;
pub use engine::{connect, local_engine, EchoEngine, InferenceEngine, LlamaServerEngine};
pub use remote::{RemoteEngine, RemoteError};
pub use server::{run_inference_server, InferenceServer, ServerConfig};
