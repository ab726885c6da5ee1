//! Milvus status syncer: periodically re-probes every tracked cluster and
//! writes the aggregate health onto its status sub-resource.
//!
//! Two passes split the population by stored phase. The unhealthy pass only
//! writes clusters that recovered, the healthy pass only writes clusters that
//! degraded; [`StatusSyncer::update_status`] writes any observable change.
//! None of them writes when nothing changed.

#![forbid(unsafe_code)]

pub mod probe;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, histogram};
use milvop_core::{ClusterPhase, ConditionSet, MilvusCluster, MilvusStatus};
use milvop_kubehub::{ListFilter, ResourceStore, StoreError};
use milvop_runner::{GroupError, GroupRunner, Task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use probe::{DeploymentProbe, Dimension, HealthProbe, DEFAULT_PROBE_TIMEOUT};

pub const DEFAULT_UNHEALTHY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTHY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub unhealthy_interval: Duration,
    pub healthy_interval: Duration,
    /// Which clusters the passes track.
    pub filter: ListFilter,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            unhealthy_interval: DEFAULT_UNHEALTHY_INTERVAL,
            healthy_interval: DEFAULT_HEALTHY_INTERVAL,
            filter: ListFilter::all(),
        }
    }
}

impl SyncerConfig {
    /// Intervals from `MILVOP_SYNC_UNHEALTHY_SECS` / `MILVOP_SYNC_HEALTHY_SECS`.
    pub fn from_env() -> Self {
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            unhealthy_interval: secs("MILVOP_SYNC_UNHEALTHY_SECS", DEFAULT_UNHEALTHY_INTERVAL),
            healthy_interval: secs("MILVOP_SYNC_HEALTHY_SECS", DEFAULT_HEALTHY_INTERVAL),
            filter: ListFilter::all(),
        }
    }

    pub fn with_filter(mut self, filter: ListFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("list clusters: {0}")]
    List(#[source] StoreError),
    #[error("write status of {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("probe {dimension} of {key}: {source:#}")]
    Probe { key: String, dimension: Dimension, source: anyhow::Error },
    #[error("runner returned {got} probe results for {key}, expected {want}")]
    MissingResult { key: String, got: usize, want: usize },
    #[error(transparent)]
    Batch(#[from] GroupError),
}

/// Which population a pass looks at and which candidates it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Unhealthy,
    Healthy,
}

impl Pass {
    fn selects(self, cluster: &MilvusCluster) -> bool {
        match self {
            Pass::Unhealthy => !cluster.is_healthy(),
            Pass::Healthy => cluster.is_healthy(),
        }
    }

    fn writes(self, candidate: &MilvusStatus) -> bool {
        match self {
            Pass::Unhealthy => candidate.status == ClusterPhase::Healthy,
            Pass::Healthy => candidate.status != ClusterPhase::Healthy,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Pass::Unhealthy => "unhealthy",
            Pass::Healthy => "healthy",
        }
    }
}

pub struct StatusSyncer<S, P, R> {
    store: Arc<S>,
    probe: Arc<P>,
    runner: Arc<R>,
    dimensions: Vec<Dimension>,
    config: SyncerConfig,
}

impl<S, P, R> StatusSyncer<S, P, R>
where
    S: ResourceStore,
    P: HealthProbe,
    R: GroupRunner,
{
    pub fn new(store: Arc<S>, probe: Arc<P>, runner: Arc<R>, config: SyncerConfig) -> Self {
        Self { store, probe, runner, dimensions: Dimension::defaults(), config }
    }

    pub fn with_dimensions(mut self, dimensions: Vec<Dimension>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Probe every dimension and derive the status the cluster should have.
    /// Any probe that fails to run aborts the evaluation.
    pub async fn evaluate(&self, cluster: &MilvusCluster) -> Result<MilvusStatus, SyncError> {
        let key = cluster.key();
        let tasks: Vec<Task<'_, _>> = self.dimensions.iter().map(|d| self.probe.probe(d, cluster)).collect();
        let results = self.runner.run_with_result(tasks).await;
        if results.len() != self.dimensions.len() {
            return Err(SyncError::MissingResult { key, got: results.len(), want: self.dimensions.len() });
        }

        let now = Time(Utc::now());
        let stored = cluster.status.clone().unwrap_or_default();
        let mut conditions = ConditionSet::from_conditions(&stored.conditions);
        let mut all_true = true;
        for (dimension, res) in self.dimensions.iter().zip(results) {
            let mut cond = res.map_err(|source| {
                counter!("status_probe_errors", 1u64);
                SyncError::Probe { key: key.clone(), dimension: *dimension, source }
            })?;
            cond.name = dimension.name().to_string();
            all_true &= cond.is_true();
            conditions.upsert(cond, &now);
        }
        let status = if all_true { ClusterPhase::Healthy } else { ClusterPhase::Unhealthy };
        Ok(MilvusStatus { status, conditions: conditions.into_conditions() })
    }

    /// Re-evaluate one cluster and persist the result if it differs from the
    /// stored status. Returns the written status. A cluster whose status was
    /// never initialised is left to the unhealthy pass.
    pub async fn update_status(&self, cluster: &MilvusCluster) -> Result<Option<MilvusStatus>, SyncError> {
        if cluster.status.is_none() {
            debug!(cluster = %cluster.key(), "status not initialised, skipping");
            return Ok(None);
        }
        let candidate = self.evaluate(cluster).await?;
        if unchanged(cluster, &candidate) {
            debug!(cluster = %cluster.key(), status = %candidate.status, "status unchanged");
            return Ok(None);
        }
        self.write(cluster, candidate).await.map(Some)
    }

    /// Re-check every cluster that is not Healthy; write those that recovered.
    pub async fn sync_unhealthy(&self) -> Result<(), SyncError> {
        self.sync_pass(Pass::Unhealthy).await
    }

    /// Re-check every Healthy cluster; write those that degraded.
    pub async fn sync_healthy(&self) -> Result<(), SyncError> {
        self.sync_pass(Pass::Healthy).await
    }

    async fn sync_pass(&self, pass: Pass) -> Result<(), SyncError> {
        let started = Instant::now();
        let clusters: Vec<MilvusCluster> = self.store.list(&self.config.filter).await.map_err(SyncError::List)?;
        let targets: Vec<MilvusCluster> = clusters.into_iter().filter(|c| pass.selects(c)).collect();
        debug!(pass = pass.label(), targets = targets.len(), "status pass");
        // an empty selection still goes through the runner
        let res = self
            .runner
            .run_diff_args(
                move |this, cluster| async move { this.sync_one(pass, cluster).await.map_err(anyhow::Error::from) },
                self,
                targets,
            )
            .await;
        histogram!("status_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(res?)
    }

    async fn sync_one(&self, pass: Pass, cluster: MilvusCluster) -> Result<(), SyncError> {
        let candidate = self.evaluate(&cluster).await?;
        if !pass.writes(&candidate) || unchanged(&cluster, &candidate) {
            return Ok(());
        }
        self.write(&cluster, candidate).await.map(|_| ())
    }

    async fn write(&self, cluster: &MilvusCluster, status: MilvusStatus) -> Result<MilvusStatus, SyncError> {
        let key = cluster.key();
        let mut next = cluster.clone();
        next.status = Some(status.clone());
        self.store
            .update_status(&next)
            .await
            .map_err(|source| SyncError::Write { key: key.clone(), source })?;
        counter!("status_writes", 1u64);
        info!(cluster = %key, from = %cluster.phase(), to = %status.status, "status updated");
        Ok(status)
    }

    /// Drive both passes on their intervals until `cancel` fires. Pass errors
    /// are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut unhealthy = tokio::time::interval(self.config.unhealthy_interval);
        let mut healthy = tokio::time::interval(self.config.healthy_interval);
        unhealthy.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        healthy.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            unhealthy_secs = self.config.unhealthy_interval.as_secs(),
            healthy_secs = self.config.healthy_interval.as_secs(),
            "status syncer started"
        );
        loop {
            let pass = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = unhealthy.tick() => Pass::Unhealthy,
                _ = healthy.tick() => Pass::Healthy,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.sync_pass(pass) => {
                    if let Err(e) = res {
                        counter!("status_pass_errors", 1u64);
                        warn!(pass = pass.label(), error = %e, "status pass failed");
                    }
                }
            }
        }
        info!("status syncer stopped");
    }
}

fn unchanged(cluster: &MilvusCluster, candidate: &MilvusStatus) -> bool {
    cluster.status.as_ref().is_some_and(|s| s.equivalent(candidate))
}
