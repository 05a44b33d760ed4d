//! Atropos daemon binary entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use atropos_core::correlation::ReportStore;
use atropos_core::notifications::{NotificationManager, NOTIFICATIONS_CONFIG_ENV};
use atropos_core::policy::RemediationPolicy;
use atropos_core::trends::Analyzer;
use atropos_core::{Executor, HistoryManager};
use atropos_daemon::api::{self, AppState};

/// Atropos - automated entropy remediation.
#[derive(Parser, Debug)]
#[command(name = "atropos", version, about)]
struct Args {
    /// Path to the remediation policy file.
    #[arg(long, default_value = "atropos_policy.yaml")]
    policy: PathBuf,

    /// Directory holding the cut journal.
    #[arg(long, default_value = "atropos_history")]
    history_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_env("ATROPOS_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(policy_file = %args.policy.display(), "atropos starting");

    // Policy problems are fatal at boot; everything after this point degrades
    // instead of exiting.
    let policy = Arc::new(
        RemediationPolicy::load(&args.policy).context("loading policy")?,
    );
    info!(node_count = policy.nodes.len(), version = %policy.meta.version, "policy loaded");

    let history = Arc::new(
        HistoryManager::new(&args.history_dir).context("opening history directory")?,
    );

    let mut engine = Executor::new(Arc::clone(&policy), Arc::clone(&history));
    if let Some(path) = std::env::var_os(NOTIFICATIONS_CONFIG_ENV) {
        match NotificationManager::from_file(Path::new(&path)) {
            Ok(manager) => {
                info!(enabled = manager.enabled(), "notification config loaded");
                engine = engine.with_notifications(Arc::new(manager));
            }
            Err(e) => warn!(error = %e, "notification config ignored"),
        }
    }
    let engine = Arc::new(engine);

    let state = AppState {
        engine,
        analyzer: Arc::new(Analyzer::new(history)),
        reports: Arc::new(ReportStore::new()),
        hmac_secret: Arc::new(policy.hmac_secret()),
    };

    let addr = normalize_listen_addr(&policy.listen_addr());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(listen_addr = %addr, "atropos online");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("atropos shutdown");
    Ok(())
}

/// A bare `:port` listen address means every interface.
fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(normalize_listen_addr(":8443"), "0.0.0.0:8443");
        assert_eq!(normalize_listen_addr("127.0.0.1:9443"), "127.0.0.1:9443");
    }
}
