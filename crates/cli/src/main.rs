use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics::{counter, histogram};
use milvop_components::{cluster_checksum, standalone_checksum, ComponentRegistry};
use milvop_core::{MilvusCluster, MilvusSpec};
use milvop_kubehub::{KubeStore, ListFilter, ResourceStore};
use milvop_reconcile::{render, ClusterReconciler};
use milvop_runner::{BoundedRunner, GroupRunner};
use milvop_status::{DeploymentProbe, HealthProbe, StatusSyncer, SyncerConfig};
use serde_json::Value as Json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "milvopctl", version, about = "Milvus cluster operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch or render into (default: all / "default")
    #[arg(long = "ns", global = true, env = "MILVOP_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile clusters and keep their status in sync until Ctrl-C
    Run {
        /// Label selector restricting the tracked clusters
        #[arg(long = "selector", env = "MILVOP_SELECTOR")]
        selector: Option<String>,
        /// Seconds between reconcile rounds
        #[arg(long = "reconcile-secs", env = "MILVOP_RECONCILE_SECS", default_value_t = 30)]
        reconcile_secs: u64,
    },
    /// Print the resolved per-role model of a MilvusCluster manifest
    Render {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print the config checksum of a MilvusCluster or Milvus manifest
    Checksum {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("MILVOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MILVOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MILVOP_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifest(path: &Path) -> Result<Json> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn cluster_from_manifest(doc: Json, ns: Option<&str>) -> Result<MilvusCluster> {
    let kind = doc.get("kind").and_then(Json::as_str).unwrap_or("MilvusCluster");
    if kind != "MilvusCluster" {
        return Err(anyhow!("expected kind MilvusCluster, got {}", kind));
    }
    let mut mc: MilvusCluster = serde_json::from_value(doc).context("decoding MilvusCluster")?;
    if mc.metadata.name.is_none() {
        return Err(anyhow!("manifest has no metadata.name"));
    }
    if mc.metadata.namespace.is_none() {
        mc.metadata.namespace = Some(ns.unwrap_or("default").to_string());
    }
    Ok(mc)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { selector, reconcile_secs } => {
            let mut filter = match cli.namespace {
                Some(ns) => ListFilter::namespaced(ns),
                None => ListFilter::all(),
            };
            if let Some(sel) = selector {
                filter = filter.with_labels(sel);
            }
            run(filter, Duration::from_secs(reconcile_secs.max(1))).await?;
        }
        Commands::Render { file } => {
            let mc = cluster_from_manifest(read_manifest(&file)?, cli.namespace.as_deref())?;
            print_render(&mc, cli.output)?;
        }
        Commands::Checksum { file } => {
            let doc = read_manifest(&file)?;
            let sum = match doc.get("kind").and_then(Json::as_str) {
                Some("Milvus") => {
                    let spec: MilvusSpec = serde_json::from_value(doc.get("spec").cloned().unwrap_or_else(|| serde_json::json!({})))
                        .context("decoding Milvus spec")?;
                    standalone_checksum(&spec)
                }
                _ => cluster_checksum(&cluster_from_manifest(doc, cli.namespace.as_deref())?.spec),
            };
            match cli.output {
                Output::Human => println!("{}", sum),
                Output::Json => println!("{}", serde_json::json!({ "checksum": sum })),
            }
        }
    }
    Ok(())
}

async fn run(filter: ListFilter, every: Duration) -> Result<()> {
    let store = Arc::new(KubeStore::try_default().await?);
    let runner = Arc::new(BoundedRunner::from_env());
    let probe = Arc::new(DeploymentProbe::from_env(store.clone())?);
    let syncer = Arc::new(StatusSyncer::new(
        store.clone(),
        probe,
        runner.clone(),
        SyncerConfig::from_env().with_filter(filter.clone()),
    ));
    let reconciler = ClusterReconciler::new(store.clone(), runner.clone())?;
    info!(concurrency = runner.max_concurrency(), every_secs = every.as_secs(), "operator starting");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; shutting down");
            }
            cancel.cancel();
        }
    });
    let sync_task = tokio::spawn(syncer.clone().run(cancel.clone()));

    let mut tick = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = reconcile_round(store.as_ref(), &reconciler, syncer.as_ref(), &filter) => {
                if let Err(e) = res {
                    error!(error = %e, "reconcile round failed");
                }
            }
        }
    }
    if let Err(e) = sync_task.await {
        warn!(error = %e, "status syncer task ended abnormally");
    }
    info!("operator stopped");
    Ok(())
}

/// Reconcile every tracked cluster, then refresh its status. A failing
/// cluster does not stop the round.
async fn reconcile_round<S, P, R>(
    store: &S,
    reconciler: &ClusterReconciler<S, R>,
    syncer: &StatusSyncer<S, P, R>,
    filter: &ListFilter,
) -> Result<()>
where
    S: ResourceStore,
    P: HealthProbe,
    R: GroupRunner,
{
    let started = Instant::now();
    let clusters: Vec<MilvusCluster> = store.list(filter).await?;
    for mc in &clusters {
        if let Err(e) = reconciler.reconcile(mc).await {
            counter!("reconcile_errors", 1u64);
            warn!(cluster = %mc.key(), error = %e, "reconcile failed");
        }
        if let Err(e) = syncer.update_status(mc).await {
            warn!(cluster = %mc.key(), error = %e, "status update failed");
        }
    }
    histogram!("reconcile_round_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(clusters = clusters.len(), took_ms = %started.elapsed().as_millis(), "reconcile round finished");
    Ok(())
}

fn print_render(mc: &MilvusCluster, output: Output) -> Result<()> {
    let registry = ComponentRegistry::milvus_cluster()?;
    let spec = &mc.spec;
    let name = mc.metadata.name.as_deref().unwrap_or_default();
    match output {
        Output::Human => {
            println!("checksum {}", cluster_checksum(spec));
            println!(
                "{:<12} {:<32} {:>8} {:>6} {:<14} {:<28} {}",
                "ROLE", "IMAGE", "REPLICAS", "PORT", "STRATEGY", "SERVICE", "TYPE"
            );
            for c in registry.components() {
                println!(
                    "{:<12} {:<32} {:>8} {:>6} {:<14} {:<28} {}",
                    c.name(),
                    c.image(spec),
                    c.replicas(spec),
                    c.port(spec),
                    c.deployment_strategy().type_.unwrap_or_default(),
                    c.service_name(name),
                    c.service_type(spec),
                );
            }
        }
        Output::Json => {
            let mut objects = vec![serde_json::to_value(render::config_map(mc)?)?];
            for c in registry.components() {
                objects.push(serde_json::to_value(render::deployment(mc, c)?)?);
                objects.push(serde_json::to_value(render::service(mc, c)?)?);
            }
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
    }
    Ok(())
}
