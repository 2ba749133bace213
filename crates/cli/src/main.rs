use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rekon_controller::{Controller, ControllerConfig, Reconciler};
use rekon_core::Key;
use rekon_store::{ResourceCache, NAMESPACE_INDEX};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Rekon level-triggered controller")]
struct Cli {
    /// Worker tasks reconciling keys in parallel
    #[arg(long, global = true, env = "REKON_WORKERS")]
    workers: Option<usize>,

    /// Re-announce every cached resource on this period; 0 disables
    #[arg(long = "resync-secs", global = true, env = "REKON_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile objects of one group/version/kind from a cluster
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Only watch this namespace (default: all)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Kubeconfig file (default: in-cluster or ~/.kube/config)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Reconcile an in-memory store with generated churn
    Demo {
        /// Resources created up front
        #[arg(long, default_value_t = 12)]
        items: usize,
        /// Delay between generated writes
        #[arg(long = "churn-ms", default_value_t = 400)]
        churn_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Logs what the cache holds for each key, with its namespace population.
pub(crate) struct LogReconciler;

#[async_trait::async_trait]
impl Reconciler for LogReconciler {
    async fn reconcile(&self, key: &Key, cache: &ResourceCache) -> Result<()> {
        match cache.get_by_key(key) {
            Some(r) => {
                let peers = cache.by_index(NAMESPACE_INDEX, &r.namespace).context("listing namespace")?.len();
                info!(key = %key, version = %r.resource_version, labels = r.labels.len(), peers, "in sync");
            }
            None => info!(key = %key, "gone; nothing left to converge"),
        }
        Ok(())
    }
}

fn controller_config(name: &str, workers: Option<usize>, resync_secs: u64) -> ControllerConfig {
    let mut cfg = ControllerConfig::from_env();
    cfg.name = name.to_string();
    if let Some(w) = workers.filter(|w| *w > 0) {
        cfg.workers = w;
    }
    cfg.cache.resync_period = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));
    cfg
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received; shutting down"),
                Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutting down"),
            }
            token.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let shutdown = shutdown_on_ctrl_c();

    match cli.command {
        Commands::Run { gvk, namespace, kubeconfig } => {
            info!(gvk = %gvk, ns = ?namespace, "run invoked");
            let client = rekon_kubehub::client(kubeconfig.as_deref()).await?;
            let store = rekon_kubehub::KubeStore::connect(client, &gvk, namespace.as_deref()).await?;
            let cfg = controller_config(&gvk, cli.workers, cli.resync_secs);
            Controller::new(cfg, Arc::new(store), LogReconciler).run(shutdown).await?;
        }
        Commands::Demo { items, churn_ms } => {
            info!(items, churn_ms, "demo invoked");
            let cfg = controller_config("demo", cli.workers, cli.resync_secs);
            demo::run(cfg, items, Duration::from_millis(churn_ms.max(1)), shutdown).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_gvk_and_scope_flags() {
        let cli = Cli::try_parse_from(["rekonctl", "--workers", "3", "run", "apps/v1/Deployment", "--ns", "prod"]).unwrap();
        assert_eq!(cli.workers, Some(3));
        match cli.command {
            Commands::Run { gvk, namespace, kubeconfig } => {
                assert_eq!(gvk, "apps/v1/Deployment");
                assert_eq!(namespace.as_deref(), Some("prod"));
                assert!(kubeconfig.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn zero_resync_disables_it() {
        assert_eq!(controller_config("x", Some(0), 0).cache.resync_period, None);
        assert_eq!(controller_config("x", None, 30).cache.resync_period, Some(Duration::from_secs(30)));
    }
}
