//! neuroclusterd: serves a `ClusterResolver` over line-delimited JSON.
//!
//! Requests run on a bounded pool: a semaphore with `workers` permits gates
//! `spawn_blocking` calls into the synchronous core. State is checkpointed on
//! `Persist`, on the optional autosave interval and on shutdown.

mod config;
mod error;
mod paths;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use neurocluster::resolver::ClusterResolver;

use config::DaemonConfig;
use error::DaemonError;
use paths::AppPaths;
use protocol::{Request, Response};

struct Daemon {
    resolver: Arc<ClusterResolver>,
    permits: Semaphore,
    shutdown: Notify,
}

impl Daemon {
    /// Run `f` on the blocking pool once a worker permit is free.
    async fn run_blocking<R, F>(&self, f: F) -> Result<R, DaemonError>
    where
        R: Send + 'static,
        F: FnOnce(&ClusterResolver) -> R + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DaemonError::Io(std::io::Error::other("worker pool closed")))?;
        let resolver = Arc::clone(&self.resolver);
        Ok(tokio::task::spawn_blocking(move || f(&resolver)).await?)
    }

    async fn persist(&self, reason: &'static str) {
        match self.run_blocking(|r| r.persist_all()).await {
            Ok(Ok(result)) if result.is_complete() => {
                info!(reason, written = result.partitions_written, bytes = result.bytes_written, "checkpoint saved");
            }
            Ok(Ok(result)) => {
                warn!(
                    reason,
                    failed_partitions = result.failed_partitions.len(),
                    failed_files = result.failed_files.len(),
                    "checkpoint incomplete; failed items stay dirty"
                );
            }
            Ok(Err(e)) => error!(reason, "checkpoint failed: {}", e),
            Err(e) => error!(reason, "checkpoint task failed: {}", e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(stream: TcpStream, daemon: Arc<Daemon>) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::error(format!("Invalid request: {}", e));
                writer
                    .write_all(serde_json::to_string(&resp)?.as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                continue;
            }
        };

        let shutting_down = matches!(request, Request::Shutdown);
        let response = if shutting_down {
            daemon.persist("shutdown request").await;
            protocol::dispatch(&daemon.resolver, request)
        } else {
            match daemon
                .run_blocking(move |r| protocol::dispatch(r, request))
                .await
            {
                Ok(resp) => resp,
                Err(e) => Response::error(e),
            }
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;

        if shutting_down {
            daemon.shutdown.notify_one();
            break;
        }
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!("Data directory: {}", paths.data_dir().display());
    let mut cfg = DaemonConfig::load(&paths.config_file())?;
    cfg.apply_env()?;
    cfg.validate().map_err(|reason| DaemonError::Config {
        path: paths.config_file(),
        reason: reason.to_string(),
    })?;

    let store_dir = paths.store_dir();
    info!("Opening store at {}", store_dir.display());
    let resolver_cfg = cfg.resolver.clone();
    let (resolver, report) =
        tokio::task::spawn_blocking(move || ClusterResolver::open(store_dir, resolver_cfg)).await??;
    if !report.corrupt_partitions.is_empty() || !report.corrupt_files.is_empty() {
        warn!(
            partitions = report.corrupt_partitions.len(),
            files = report.corrupt_files.len(),
            "store opened in degraded mode; affected clusters must be relearned"
        );
    }
    info!(clusters = report.clusters, neurons = report.neurons, "store loaded");

    let daemon = Arc::new(Daemon {
        resolver: Arc::new(resolver),
        permits: Semaphore::new(cfg.workers),
        shutdown: Notify::new(),
    });

    // Stop (and save) on Ctrl-C.
    {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                daemon.shutdown.notify_one();
            }
        });
    }

    if cfg.autosave_secs > 0 {
        let daemon = Arc::clone(&daemon);
        let period = Duration::from_secs(cfg.autosave_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                daemon.persist("autosave").await;
            }
        });
    }

    let listener = TcpListener::bind(&cfg.addr).await?;
    info!("neuroclusterd listening on {} ({} workers)", cfg.addr, cfg.workers);

    // Accept client connections
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("Client connected: {}", addr);
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, daemon).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
            _ = daemon.shutdown.notified() => break,
        }
    }

    daemon.persist("exit").await;
    info!("neuroclusterd stopped");
    Ok(())
}
