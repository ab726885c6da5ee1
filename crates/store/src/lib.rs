//! In-RAM resource store with API-server-like semantics: uid and
//! resourceVersion assignment, optimistic concurrency on replace and a
//! separate status sub-resource. Counts writes and can inject failures, which
//! is what the controller tests lean on.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use milvop_kubehub::{object_key, ListFilter, ResourceStore, StoreError, StoreObject};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjectRef {
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectRef {
    fn of<K: StoreObject>(namespace: &str, name: &str) -> Self {
        Self { kind: kind_key::<K>(), namespace: namespace.to_string(), name: name.to_string() }
    }

    fn from_obj<K: StoreObject>(obj: &K) -> Result<Self, StoreError> {
        let meta = obj.meta();
        match (meta.namespace.as_deref(), meta.name.as_deref()) {
            (Some(ns), Some(name)) => Ok(Self::of::<K>(ns, name)),
            _ => Err(StoreError::Invalid(format!("{} needs metadata.name and metadata.namespace", object_key(obj)))),
        }
    }
}

fn kind_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

/// Store operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    List,
    UpdateStatus,
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    updates: AtomicU64,
    status_updates: AtomicU64,
}

#[derive(Default)]
pub struct MemStore {
    objects: Mutex<FxHashMap<ObjectRef, Value>>,
    failures: Mutex<FxHashMap<Op, u32>>,
    revision: AtomicU64,
    counters: Counters,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an object as-is, status included, without counting a write.
    pub fn seed<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError> {
        let key = ObjectRef::from_obj(obj)?;
        let mut value = serde_json::to_value(obj)?;
        self.stamp(&mut value, true);
        self.lock_objects()?.insert(key, value);
        Ok(())
    }

    /// Make the next `times` calls of `op` fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, op: Op, times: u32) {
        if let Ok(mut f) = self.failures.lock() {
            *f.entry(op).or_default() += times;
        }
    }

    pub fn creates(&self) -> u64 {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u64 {
        self.counters.updates.load(Ordering::SeqCst)
    }

    pub fn status_updates(&self) -> u64 {
        self.counters.status_updates.load(Ordering::SeqCst)
    }

    /// Every create, update and status update so far.
    pub fn writes(&self) -> u64 {
        self.creates() + self.updates() + self.status_updates()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_objects(&self) -> Result<std::sync::MutexGuard<'_, FxHashMap<ObjectRef, Value>>, StoreError> {
        self.objects.lock().map_err(|_| StoreError::Unavailable("object map poisoned".into()))
    }

    fn check_failure(&self, op: Op) -> Result<(), StoreError> {
        let mut failures = self.failures.lock().map_err(|_| StoreError::Unavailable("failure map poisoned".into()))?;
        match failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(StoreError::Unavailable(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn stamp(&self, value: &mut Value, new_uid: bool) {
        let rv = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            if new_uid && !meta.contains_key("uid") {
                meta.insert("uid".into(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
            meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        }
    }
}

fn resource_version(v: &Value) -> Option<&str> {
    v.get("metadata")?.get("resourceVersion")?.as_str()
}

fn labels_of(v: &Value) -> BTreeMap<String, String> {
    v.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ResourceStore for MemStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.check_failure(Op::Get)?;
        let found = self.lock_objects()?.get(&ObjectRef::of::<K>(namespace, name)).cloned();
        Ok(found.map(serde_json::from_value).transpose()?)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        self.check_failure(Op::Create)?;
        let key = ObjectRef::from_obj(obj)?;
        let mut value = serde_json::to_value(obj)?;
        let mut objects = self.lock_objects()?;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(object_key(obj)));
        }
        self.stamp(&mut value, true);
        objects.insert(key, value.clone());
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        debug!(object = %object_key(obj), "mem create");
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        self.check_failure(Op::Update)?;
        let key = ObjectRef::from_obj(obj)?;
        let mut value = serde_json::to_value(obj)?;
        let mut objects = self.lock_objects()?;
        let stored = objects.get(&key).ok_or_else(|| StoreError::NotFound(object_key(obj)))?;
        if let Some(rv) = resource_version(&value) {
            if Some(rv) != resource_version(stored) {
                return Err(StoreError::Conflict(object_key(obj)));
            }
        }
        // status belongs to the sub-resource
        let status = stored.get("status").cloned();
        if let Some(map) = value.as_object_mut() {
            match status {
                Some(s) => map.insert("status".into(), s),
                None => map.remove("status"),
            };
        }
        self.stamp(&mut value, false);
        objects.insert(key, value.clone());
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        debug!(object = %object_key(obj), "mem update");
        Ok(serde_json::from_value(value)?)
    }

    async fn list<K: StoreObject>(&self, filter: &ListFilter) -> Result<Vec<K>, StoreError> {
        self.check_failure(Op::List)?;
        let kind = kind_key::<K>();
        let objects = self.lock_objects()?;
        let mut hits: Vec<(&ObjectRef, &Value)> = objects
            .iter()
            .filter(|(k, v)| {
                k.kind == kind && filter.matches_namespace(Some(&k.namespace)) && filter.matches_labels(&labels_of(v))
            })
            .collect();
        hits.sort_by(|a, b| a.0.cmp(b.0));
        hits.into_iter()
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect()
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        self.check_failure(Op::UpdateStatus)?;
        let key = ObjectRef::from_obj(obj)?;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or(Value::Null);
        let mut objects = self.lock_objects()?;
        let stored = objects.get_mut(&key).ok_or_else(|| StoreError::NotFound(object_key(obj)))?;
        if let Some(map) = stored.as_object_mut() {
            map.insert("status".into(), status);
        }
        let mut updated = stored.clone();
        self.stamp(&mut updated, false);
        *stored = updated.clone();
        self.counters.status_updates.fetch_add(1, Ordering::SeqCst);
        debug!(object = %object_key(obj), "mem status update");
        Ok(serde_json::from_value(updated)?)
    }
}
