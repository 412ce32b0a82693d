//! Repositories - git operation worker service
//!
//! Accepts checkout, load-files and push operations over HTTP, runs them one
//! at a time against a local cache of working trees and lets clients poll for
//! the result.
//!
//! # Usage
//! ```bash
//! repositories --config repositories.toml
//! REPOSITORIES_BASEDIR=/var/lib/repositories repositories --port 8085
//! ```

mod config;
mod error;
mod git;
mod heartbeat;
mod models;
mod processor;
mod routes;
mod store;
mod vacuum;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use git::RepoCache;
use heartbeat::Heartbeat;
use processor::Processor;
use routes::AppState;
use store::Store;

/// Git operation worker: checkout, load files and push on request
#[derive(Parser)]
#[command(name = "repositories", version)]
#[command(about = "Git operation worker service", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "REPOSITORIES_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root holding the working trees
    #[arg(long, env = "REPOSITORIES_BASEDIR")]
    basedir: Option<PathBuf>,

    /// SQLite database of the operation store
    #[arg(long, env = "REPOSITORIES_DATABASE")]
    database: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "REPOSITORIES_ADDR")]
    addr: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "REPOSITORIES_PORT")]
    port: Option<u16>,

    /// Orchestrator API receiving heartbeats
    #[arg(long, env = "REPOSITORIES_API_URL")]
    api_url: Option<String>,

    /// Token for the orchestrator API
    #[arg(long, env = "REPOSITORIES_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(basedir) = self.basedir {
            config.basedir = basedir;
        }
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(addr) = self.addr {
            config.http.addr = addr;
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(api_url) = self.api_url {
            config.heartbeat.api_url = Some(api_url);
        }
        if let Some(token) = self.api_token {
            config.heartbeat.token = token;
        }
    }
}

/// Flip the root cancellation signal on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutting down...");
    let _ = cancel.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    let config = Arc::new(config);

    let cache = RepoCache::new(&config.basedir)?;
    let store = Arc::new(
        Store::open(&config.database, config.queue_visibility_timeout)
            .with_context(|| format!("Failed to open store {}", config.database.display()))?,
    );
    let heartbeat = Heartbeat::from_config(&config)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(cancel_tx.clone()));

    let processor = Processor::new(store.clone(), cache.clone(), config.clone());
    let processor_task = tokio::spawn({
        let cancel = cancel_rx.clone();
        async move { processor.run(cancel).await }
    });
    let vacuum_task = tokio::spawn(vacuum::run(
        store.clone(),
        cache.clone(),
        config.clone(),
        cancel_rx.clone(),
    ));
    let heartbeat_task = match heartbeat {
        Some(heartbeat) => {
            let cancel = cancel_rx.clone();
            let cancel_tx = cancel_tx.clone();
            Some(tokio::spawn(async move {
                let result = heartbeat.run(cancel).await;
                if let Err(e) = &result {
                    tracing::error!("{}", e);
                    let _ = cancel_tx.send(true);
                }
                result
            }))
        }
        None => {
            tracing::info!("Heartbeat disabled, no API URL configured");
            None
        }
    };

    let app = routes::create_router(AppState {
        store: store.clone(),
        cache,
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.addr, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Listening on {}", addr);

    let mut server_cancel = cancel_rx.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_cancel.wait_for(|cancelled| *cancelled).await;
        })
        .await;

    // The server may also stop on its own error; bring the tasks down with it.
    let _ = cancel_tx.send(true);
    processor_task.await?;
    vacuum_task.await?;
    if let Some(task) = heartbeat_task {
        task.await??;
    }
    served?;

    Ok(())
}
