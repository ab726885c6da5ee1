#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use milvop_core::{ClusterPhase, ConditionStatus, MilvusCluster, MilvusClusterSpec, MilvusCondition, MilvusStatus, Role};
use milvop_kubehub::ResourceStore;
use milvop_runner::{GroupError, GroupRunner, SequentialRunner, Task, TaskResult};
use milvop_status::{Dimension, HealthProbe, StatusSyncer, SyncError, SyncerConfig};
use milvop_store::{MemStore, Op};
use tokio_util::sync::CancellationToken;

const NS: &str = "milvus";

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Up,
    Down,
    Broken,
}

/// Probe answering from a script keyed by dimension name; unscripted
/// dimensions are up.
#[derive(Default)]
struct ScriptedProbe {
    script: Mutex<HashMap<&'static str, Outcome>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn set(&self, dimension: &'static str, outcome: Outcome) {
        self.script.lock().unwrap().insert(dimension, outcome);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, dimension: &Dimension, _cluster: &MilvusCluster) -> anyhow::Result<MilvusCondition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().get(dimension.name()).copied().unwrap_or(Outcome::Up);
        match outcome {
            Outcome::Up => Ok(MilvusCondition::new(dimension.name(), ConditionStatus::True).with_reason("Up")),
            Outcome::Down => Ok(MilvusCondition::new(dimension.name(), ConditionStatus::False).with_reason("Down")),
            Outcome::Broken => Err(anyhow::anyhow!("probe transport failed")),
        }
    }
}

/// Sequential runner that remembers the size of every batch.
#[derive(Default)]
struct RecordingRunner {
    inner: SequentialRunner,
    diff_batches: Mutex<Vec<usize>>,
}

impl RecordingRunner {
    fn diff_batches(&self) -> Vec<usize> {
        self.diff_batches.lock().unwrap().clone()
    }
}

impl GroupRunner for RecordingRunner {
    fn run_with_result<'a, T>(&'a self, tasks: Vec<Task<'a, T>>) -> BoxFuture<'a, Vec<TaskResult<T>>>
    where
        T: Send + 'a,
    {
        self.inner.run_with_result(tasks)
    }

    fn run_diff_args<'a, S, A, F, Fut>(&'a self, f: F, shared: &'a S, args: Vec<A>) -> BoxFuture<'a, Result<(), GroupError>>
    where
        S: Sync + ?Sized + 'a,
        A: Send + 'a,
        F: Fn(&'a S, A) -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
    {
        self.diff_batches.lock().unwrap().push(args.len());
        let tasks: Vec<Task<'a, ()>> = args.into_iter().map(|arg| f(shared, arg).boxed()).collect();
        self.inner.run_with_result(tasks).map(GroupError::check).boxed()
    }
}

type Syncer = StatusSyncer<MemStore, ScriptedProbe, RecordingRunner>;

struct Fixture {
    store: Arc<MemStore>,
    probe: Arc<ScriptedProbe>,
    runner: Arc<RecordingRunner>,
    syncer: Syncer,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemStore::new());
    let probe = Arc::new(ScriptedProbe::default());
    let runner = Arc::new(RecordingRunner::default());
    let syncer = StatusSyncer::new(store.clone(), probe.clone(), runner.clone(), SyncerConfig::default());
    Fixture { store, probe, runner, syncer }
}

fn t0() -> Time {
    Time(Utc.timestamp_opt(1_600_000_000, 0).unwrap())
}

/// Conditions exactly as an all-up probe round would leave them.
fn all_up_conditions() -> Vec<MilvusCondition> {
    Dimension::defaults()
        .iter()
        .map(|d| {
            let mut c = MilvusCondition::new(d.name(), ConditionStatus::True).with_reason("Up");
            c.last_transition_time = Some(t0());
            c
        })
        .collect()
}

fn cluster(name: &str, status: Option<MilvusStatus>) -> MilvusCluster {
    let mut mc = MilvusCluster::new(name, MilvusClusterSpec::default());
    mc.metadata.namespace = Some(NS.into());
    mc.status = status;
    mc
}

fn healthy() -> Option<MilvusStatus> {
    Some(MilvusStatus { status: ClusterPhase::Healthy, conditions: all_up_conditions() })
}

fn unhealthy() -> Option<MilvusStatus> {
    Some(MilvusStatus { status: ClusterPhase::Unhealthy, conditions: vec![] })
}

async fn stored(store: &MemStore, name: &str) -> MilvusCluster {
    store.get(NS, name).await.unwrap().unwrap()
}

#[tokio::test]
async fn passes_partition_by_stored_phase() {
    let fx = fixture();
    fx.store.seed(&cluster("unset", None)).unwrap();
    fx.store.seed(&cluster("up", healthy())).unwrap();
    fx.store.seed(&cluster("down", unhealthy())).unwrap();
    fx.probe.set("querycoord", Outcome::Down);

    fx.syncer.sync_unhealthy().await.unwrap();
    assert_eq!(fx.runner.diff_batches(), vec![2]);
    // candidates are still unhealthy, so the pass leaves them alone
    assert_eq!(fx.store.status_updates(), 0);
    assert_eq!(stored(&fx.store, "unset").await.status, None);

    fx.syncer.sync_healthy().await.unwrap();
    assert_eq!(fx.runner.diff_batches(), vec![2, 1]);
    assert_eq!(fx.store.status_updates(), 1);
    assert_eq!(stored(&fx.store, "up").await.phase(), ClusterPhase::Unhealthy);
}

#[tokio::test]
async fn unhealthy_pass_promotes_recovered_clusters() {
    let fx = fixture();
    fx.store.seed(&cluster("unset", None)).unwrap();
    fx.store.seed(&cluster("down", unhealthy())).unwrap();

    fx.syncer.sync_unhealthy().await.unwrap();
    assert_eq!(fx.store.status_updates(), 2);
    for name in ["unset", "down"] {
        let mc = stored(&fx.store, name).await;
        assert_eq!(mc.phase(), ClusterPhase::Healthy, "{name}");
        assert_eq!(mc.status.unwrap().conditions.len(), Dimension::defaults().len());
    }
}

#[tokio::test]
async fn empty_selection_still_calls_the_runner() {
    let fx = fixture();
    fx.store.seed(&cluster("up", healthy())).unwrap();
    fx.syncer.sync_unhealthy().await.unwrap();
    assert_eq!(fx.runner.diff_batches(), vec![0]);
    assert_eq!(fx.store.writes(), 0);
}

#[tokio::test]
async fn unchanged_status_is_not_written() {
    let fx = fixture();
    fx.store.seed(&cluster("up", healthy())).unwrap();
    let mc = stored(&fx.store, "up").await;

    assert_eq!(fx.syncer.update_status(&mc).await.unwrap(), None);
    fx.syncer.sync_healthy().await.unwrap();
    assert_eq!(fx.store.writes(), 0);
}

#[tokio::test]
async fn uninitialised_status_is_left_alone() {
    let fx = fixture();
    fx.store.seed(&cluster("fresh", None)).unwrap();
    let mc = stored(&fx.store, "fresh").await;

    assert_eq!(fx.syncer.update_status(&mc).await.unwrap(), None);
    assert_eq!(fx.probe.calls(), 0);
    assert_eq!(fx.store.writes(), 0);
    assert!(stored(&fx.store, "fresh").await.status.is_none());
}

#[tokio::test]
async fn one_flipped_dimension_is_one_write() {
    let fx = fixture();
    fx.store.seed(&cluster("up", healthy())).unwrap();
    fx.probe.set("datacoord", Outcome::Down);
    let mc = stored(&fx.store, "up").await;

    let written = fx.syncer.update_status(&mc).await.unwrap().expect("status written");
    assert_eq!(written.status, ClusterPhase::Unhealthy);
    assert_eq!(fx.store.status_updates(), 1);

    let after = stored(&fx.store, "up").await.status.unwrap();
    assert_eq!(after.status, ClusterPhase::Unhealthy);
    for cond in &after.conditions {
        if cond.name == "datacoord" {
            assert_eq!(cond.status, ConditionStatus::False);
            assert_ne!(cond.last_transition_time, Some(t0()));
        } else {
            assert_eq!(cond.last_transition_time, Some(t0()), "{}", cond.name);
        }
    }

    // same evidence again: nothing to write
    let mc = stored(&fx.store, "up").await;
    assert_eq!(fx.syncer.update_status(&mc).await.unwrap(), None);
    assert_eq!(fx.store.status_updates(), 1);
}

#[tokio::test]
async fn probe_errors_abort_without_writing() {
    let fx = fixture();
    let syncer = fx.syncer.with_dimensions(vec![Dimension::Role(Role::RootCoord), Dimension::Etcd]);
    fx.probe.set("rootcoord", Outcome::Broken);
    fx.probe.set("etcd", Outcome::Broken);
    fx.store.seed(&cluster("up", healthy())).unwrap();
    let mc = stored(&fx.store, "up").await;

    let err = syncer.update_status(&mc).await.unwrap_err();
    assert!(matches!(err, SyncError::Probe { dimension: Dimension::Role(Role::RootCoord), .. }), "{err}");
    assert_eq!(fx.store.writes(), 0);
    assert_eq!(stored(&fx.store, "up").await.status, healthy());
}

#[tokio::test]
async fn store_errors_surface() {
    let fx = fixture();
    fx.store.seed(&cluster("unset", None)).unwrap();

    fx.store.fail_next(Op::List, 1);
    assert!(matches!(fx.syncer.sync_unhealthy().await, Err(SyncError::List(_))));

    fx.store.fail_next(Op::UpdateStatus, 1);
    match fx.syncer.sync_unhealthy().await {
        Err(SyncError::Batch(e)) => assert_eq!((e.total, e.failed()), (1, 1)),
        other => panic!("expected batch error, got {other:?}"),
    }
    assert_eq!(fx.store.status_updates(), 0);
}

#[tokio::test]
async fn run_loop_syncs_until_cancelled() {
    let store = Arc::new(MemStore::new());
    store.seed(&cluster("unset", None)).unwrap();
    let config = SyncerConfig {
        unhealthy_interval: Duration::from_millis(10),
        healthy_interval: Duration::from_millis(10),
        ..SyncerConfig::default()
    };
    let syncer = Arc::new(StatusSyncer::new(
        store.clone(),
        Arc::new(ScriptedProbe::default()),
        Arc::new(RecordingRunner::default()),
        config,
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(syncer.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

    assert!(stored(&store, "unset").await.is_healthy());
    // later passes found nothing to change
    assert_eq!(store.status_updates(), 1);
}
