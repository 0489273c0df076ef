//! termhub - persistent terminal sessions over WebSocket.
//!
//! `termhub serve` starts the broker. Sessions are kept in server-side PTYs
//! and survive client disconnects until killed, reaped for idleness, or the
//! server stops.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termhub::{
    api,
    config::{Config, ConfigError, UserConfig},
    reaper::IdleReaper,
    registry::SessionRegistry,
    store::{self, MetadataStore},
};

#[derive(ClapParser, Debug)]
#[command(name = "termhub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session broker
    Serve {
        /// Path to the TOML config file
        #[arg(long, env = "TERMHUB_CONFIG")]
        config: Option<PathBuf>,

        /// Address to bind the HTTP/WebSocket API server (overrides config)
        #[arg(long, env = "TERMHUB_BIND")]
        bind: Option<String>,
    },

    /// Print a fresh random token suitable for a `[[users]]` entry
    GenToken,
}

#[derive(Error, Debug)]
pub enum TermhubError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("invalid bind address {0:?}: {1}")]
    Bind(String, std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn generate_token() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("termhub")
        .join("config.toml")
}

#[tokio::main]
async fn main() -> Result<(), TermhubError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { config, bind } => run_server(config, bind).await,
        Commands::GenToken => {
            println!("{}", generate_token());
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(?e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
            _ = term.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C");
    }
}

async fn run_server(
    config_path: Option<PathBuf>,
    bind_override: Option<String>,
) -> Result<(), TermhubError> {
    let config_path = config_path.unwrap_or_else(default_config_path);
    let mut config = match Config::load(&config_path)? {
        Some(config) => {
            tracing::info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            tracing::info!(path = %config_path.display(), "no config file, using defaults");
            Config::default()
        }
    };
    if let Some(bind) = bind_override {
        config.server.bind = bind;
    }
    let bind: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| TermhubError::Bind(config.server.bind.clone(), e))?;

    if config.users.is_empty() {
        let token = generate_token();
        eprintln!("termhub: no users configured; admin token for this run: {}", token);
        config.users.push(UserConfig {
            id: "admin".to_string(),
            token,
            admin: true,
        });
    }

    let store = MetadataStore::new(&config.state_dir());
    match store.clear() {
        Ok(0) => {}
        Ok(stale) => tracing::info!(stale, "discarded session metadata from previous run"),
        Err(e) => tracing::warn!(%e, "failed to reset session metadata"),
    }

    let registry = SessionRegistry::new(config.registry_settings());
    let shutdown = CancellationToken::new();

    let mirror_handle = store::spawn_mirror(registry.clone(), store.clone(), shutdown.clone());
    let reaper_handle = IdleReaper::new(registry.clone(), config.reap_interval(), config.idle_timeout())
        .spawn(shutdown.clone());

    let state = api::AppState {
        registry: registry.clone(),
        shutdown: shutdown.clone(),
        tokens: Arc::new(config.token_table()),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        max_sessions = config.sessions.max_sessions,
        users = config.users.len(),
        "termhub listening"
    );

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    let killed = registry.drain();
    tracing::info!(killed, "sessions terminated");

    for (name, handle) in [("metadata mirror", mirror_handle), ("idle reaper", reaper_handle)] {
        if let Err(e) = handle.await {
            tracing::warn!(?e, "{} task panicked", name);
        }
    }
    if let Err(e) = store.clear() {
        tracing::warn!(%e, "failed to clear session metadata");
    }

    tracing::info!("termhub stopped");
    Ok(())
}
