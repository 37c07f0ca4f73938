// remote-inference/crates/remote-inference/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use remote_inference::{
    config::{Config, EngineKind},
    credentials::{fingerprint, CredentialStore},
    run_inference_server, InferenceEngine, RemoteEngine,
};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(
    name = "remote-inference",
    about = "Serve an inference engine over HTTP, or talk to one",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Start the inference server
    Serve {
        /// Interface to bind (overrides API_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides API_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Bearer token (overrides INFERENCE_TOKEN and the stored token)
        #[arg(long)]
        token: Option<String>,
        /// Engine to host: llama or echo
        #[arg(long)]
        engine: Option<EngineKind>,
        /// Skip the startup warm-up calls
        #[arg(long)]
        no_prewarm: bool,
    },
    /// Manage the stored bearer token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Check that a server is reachable and accepts our token
    Ping {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Print a server's device information
    Device {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum TokenAction {
    /// Create a new token, replacing any stored one
    Generate,
    /// Print the active token
    Show,
    /// Delete the stored token
    Revoke,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, token, engine, no_prewarm } => {
            let mut cfg = Config::from_env()?;
            if let Some(host) = host {
                cfg.api_host = host;
            }
            if let Some(port) = port {
                cfg.api_port = port;
            }
            if let Some(engine) = engine {
                cfg.engine = engine;
            }
            if no_prewarm {
                cfg.prewarm = false;
            }
            cfg.auth_token = token;
            run_inference_server(cfg).await
        }
        Commands::Token { action } => cmd_token(action),
        Commands::Ping { url, token } => {
            let remote = remote_from(url, token)?;
            let health = remote.health().await?;
            println!("✅ {} is {} (up {:.1}s)", remote.base_url(), health.status, health.uptime);
            Ok(())
        }
        Commands::Device { url, token } => {
            let remote = remote_from(url, token)?;
            let info = remote.device_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

#[cfg(feature = "cli")]
fn cmd_token(action: TokenAction) -> anyhow::Result<()> {
    let store = CredentialStore::default();
    match action {
        TokenAction::Generate => {
            let token = store.generate_and_persist()?;
            println!("🔐 New token written to {}", store.path().display());
            println!("{}", token);
        }
        TokenAction::Show => match store.current_token() {
            Some(token) => {
                eprintln!("Token {} ({})", fingerprint(&token), store.path().display());
                println!("{}", token);
            }
            None => println!("No token configured"),
        },
        TokenAction::Revoke => {
            if store.revoke()? {
                println!("Token revoked");
            } else {
                println!("No stored token to revoke");
            }
        }
    }
    Ok(())
}

/// Target comes from `--url`, then REMOTE_URL, then the local API address.
#[cfg(feature = "cli")]
fn remote_from(url: Option<String>, token: Option<String>) -> anyhow::Result<RemoteEngine> {
    let cfg = Config::from_env()?;
    let url = url
        .or_else(|| cfg.remote_url.clone())
        .unwrap_or_else(|| format!("http://{}:{}", cfg.api_host, cfg.api_port));
    let token = token.or_else(|| CredentialStore::default().current_token());
    RemoteEngine::new(&url, token, cfg.remote_timeout())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
