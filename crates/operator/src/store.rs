use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::core::ErrorResponse;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};

use crate::crd::Alpine;
use crate::error::IndexError;
use crate::owner_index::OwnerIndex;

/// Kubernetes event to attach to an `Alpine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub warning: bool,
    pub reason: &'static str,
    pub note: String,
}

impl WorkerEvent {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self { warning: false, reason, note: note.into() }
    }
    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self { warning: true, reason, note: note.into() }
    }
}

/// Everything the reconciler reads from or writes to the cluster.
#[async_trait]
pub trait WorkloadStore: Send + Sync + 'static {
    /// `Ok(None)` when the Alpine no longer exists.
    async fn get_alpine(&self, namespace: &str, name: &str) -> Result<Option<Alpine>, kube::Error>;
    /// Pods controlled by the named Alpine, served from the owner index.
    fn children(&self, owner: &str, namespace: &str) -> Result<Vec<Arc<Pod>>, IndexError>;
    /// Writes the status sub-resource. Fails with 409 if `alpine` is stale.
    async fn replace_status(&self, namespace: &str, alpine: &Alpine) -> Result<Alpine, kube::Error>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error>;
    async fn publish_event(&self, alpine: &Alpine, event: WorkerEvent) -> Result<(), kube::Error>;
}

/// Store backed by the API server, with children served from a watch-fed index.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    index: OwnerIndex<Alpine>,
    reporter: Reporter,
}

impl KubeStore {
    pub fn new(client: Client, index: OwnerIndex<Alpine>, reporter: Reporter) -> Self {
        Self { client, index, reporter }
    }
}

#[async_trait]
impl WorkloadStore for KubeStore {
    async fn get_alpine(&self, namespace: &str, name: &str) -> Result<Option<Alpine>, kube::Error> {
        Api::<Alpine>::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    fn children(&self, owner: &str, namespace: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        self.index.children(owner, namespace)
    }

    async fn replace_status(&self, namespace: &str, alpine: &Alpine) -> Result<Alpine, kube::Error> {
        let api = Api::<Alpine>::namespaced(self.client.clone(), namespace);
        let data = serde_json::to_vec(alpine).map_err(kube::Error::SerdeError)?;
        api.replace_status(&alpine.name_any(), &PostParams::default(), data).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        let created = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), pod)
            .await?;
        // The pod watch may lag; the next pass must already count this pod.
        self.index.observe_created(&created);
        Ok(created)
    }

    async fn publish_event(&self, alpine: &Alpine, event: WorkerEvent) -> Result<(), kube::Error> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), alpine.object_ref(&()));
        recorder
            .publish(Event {
                type_: if event.warning { EventType::Warning } else { EventType::Normal },
                reason: event.reason.into(),
                note: Some(event.note),
                action: "Reconcile".into(),
                secondary: None,
            })
            .await
    }
}

/// Operations recorded by [`MemoryStore`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    ReplaceStatus { name: String, active: usize },
    CreatePod(String),
    Event(&'static str),
}

/// Calls [`MemoryStore`] can be told to fail. `StatusWrite` fails with a
/// version conflict, the others with a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Get,
    StatusWrite,
    Create,
    Event,
}

type Key = (String, String);

#[derive(Debug, Default)]
struct Memory {
    alpines: BTreeMap<Key, Alpine>,
    pods: BTreeMap<Key, Pod>,
    ops: Vec<StoreOp>,
    failing: HashSet<FailPoint>,
    version: u64,
    status_delay: Option<Duration>,
    /// Pod watch events not yet delivered to the index, when the watch lags.
    pending: Vec<watcher::Event<Pod>>,
}

impl Memory {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message, reason: reason.into(), code })
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.meta().namespace.clone().unwrap_or_default(), obj.meta().name.clone().unwrap_or_default())
}

/// In-process store with API-server-like versioning and a real owner index.
///
/// Like [`KubeStore`], pods it creates are recorded in the index directly.
/// Every other pod change reaches the index as a watch event, either at once or,
/// for a [`MemoryStore::lagging`] store, only on [`MemoryStore::deliver_watch`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Memory>,
    index: OwnerIndex<Alpine>,
    lagging: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let store = Self::unsynced();
        store.index.apply(&watcher::Event::Restarted(Vec::new()));
        store
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose owner index has not seen its initial listing yet.
    pub fn unsynced() -> Self {
        Self { inner: Mutex::default(), index: OwnerIndex::new(), lagging: false }
    }

    /// A synced store whose pod watch holds events until [`Self::deliver_watch`].
    pub fn lagging() -> Self {
        Self { lagging: true, ..Self::default() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Memory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watch(&self, event: watcher::Event<Pod>) {
        if self.lagging {
            self.lock().pending.push(event);
        } else {
            self.index.apply(&event);
        }
    }

    /// Feeds held-back watch events to the index, returning how many there were.
    pub fn deliver_watch(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending);
        for event in &pending {
            self.index.apply(event);
        }
        pending.len()
    }

    /// Delays every status write by `delay`.
    pub fn slow_status_writes(&self, delay: Duration) {
        self.lock().status_delay = Some(delay);
    }

    /// Stores `alpine`, assigning a uid and a fresh resourceVersion.
    pub fn insert_alpine(&self, mut alpine: Alpine) -> Alpine {
        let mut mem = self.lock();
        let key = key_of(&alpine);
        if alpine.metadata.uid.is_none() {
            alpine.metadata.uid = Some(format!("uid-{}-{}", key.0, key.1));
        }
        alpine.metadata.resource_version = Some(mem.next_version());
        mem.alpines.insert(key, alpine.clone());
        alpine
    }

    /// Stores `alpine` as given, without assigning a uid.
    pub fn insert_alpine_raw(&self, mut alpine: Alpine) -> Alpine {
        let mut mem = self.lock();
        alpine.metadata.resource_version = Some(mem.next_version());
        mem.alpines.insert(key_of(&alpine), alpine.clone());
        alpine
    }

    pub fn delete_alpine(&self, namespace: &str, name: &str) {
        self.lock().alpines.remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn alpine(&self, namespace: &str, name: &str) -> Option<Alpine> {
        self.lock().alpines.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Simulates a concurrent writer by bumping the stored resourceVersion.
    pub fn touch_alpine(&self, namespace: &str, name: &str) {
        let mut mem = self.lock();
        let version = mem.next_version();
        if let Some(a) = mem.alpines.get_mut(&(namespace.to_string(), name.to_string())) {
            a.metadata.resource_version = Some(version);
        }
    }

    /// Adds a pod as if created by someone else, and feeds it to the index.
    pub fn insert_pod(&self, pod: Pod) {
        self.lock().pods.insert(key_of(&pod), pod.clone());
        self.watch(watcher::Event::Applied(pod));
    }

    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let removed = self.lock().pods.remove(&(namespace.to_string(), name.to_string()));
        if let Some(pod) = removed {
            self.watch(watcher::Event::Deleted(pod));
        }
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn fail(&self, point: FailPoint) {
        self.lock().failing.insert(point);
    }

    pub fn heal(&self, point: FailPoint) {
        self.lock().failing.remove(&point);
    }

    pub fn index(&self) -> &OwnerIndex<Alpine> {
        &self.index
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn get_alpine(&self, namespace: &str, name: &str) -> Result<Option<Alpine>, kube::Error> {
        let mem = self.lock();
        if mem.failing.contains(&FailPoint::Get) {
            return Err(api_error(500, "InternalError", "injected get failure".into()));
        }
        Ok(mem.alpines.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    fn children(&self, owner: &str, namespace: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        self.index.children(owner, namespace)
    }

    async fn replace_status(&self, namespace: &str, alpine: &Alpine) -> Result<Alpine, kube::Error> {
        let delay = self.lock().status_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut mem = self.lock();
        let name = alpine.name_any();
        let version = mem.next_version();
        let key = (namespace.to_string(), name.clone());
        let injected = mem.failing.contains(&FailPoint::StatusWrite);
        let Some(stored) = mem.alpines.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("alpines \"{name}\" not found")));
        };
        if injected || stored.metadata.resource_version != alpine.metadata.resource_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("Operation cannot be fulfilled on alpines \"{name}\": the object has been modified"),
            ));
        }
        stored.status = alpine.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        let active = updated.status.as_ref().map_or(0, |s| s.active.len());
        mem.ops.push(StoreOp::ReplaceStatus { name, active });
        Ok(updated)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        let mut created = pod.clone();
        let name = pod.name_any();
        {
            let mut mem = self.lock();
            if mem.failing.contains(&FailPoint::Create) {
                return Err(api_error(500, "InternalError", "injected create failure".into()));
            }
            let key = (namespace.to_string(), name.clone());
            if mem.pods.contains_key(&key) {
                return Err(api_error(409, "AlreadyExists", format!("pods \"{name}\" already exists")));
            }
            created.metadata.uid = Some(format!("uid-pod-{name}"));
            created.metadata.resource_version = Some(mem.next_version());
            mem.pods.insert(key, created.clone());
            mem.ops.push(StoreOp::CreatePod(name));
        }
        self.index.observe_created(&created);
        self.watch(watcher::Event::Applied(created.clone()));
        Ok(created)
    }

    async fn publish_event(&self, _alpine: &Alpine, event: WorkerEvent) -> Result<(), kube::Error> {
        let mut mem = self.lock();
        if mem.failing.contains(&FailPoint::Event) {
            return Err(api_error(500, "InternalError", "injected event failure".into()));
        }
        mem.ops.push(StoreOp::Event(event.reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AlpineSpec, AlpineStatus};
    use crate::error::is_conflict;

    fn web() -> Alpine {
        let mut a = Alpine::new("web", AlpineSpec::default());
        a.metadata.namespace = Some("ns1".into());
        a
    }

    #[tokio::test]
    async fn stale_status_write_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_alpine(web());
        let mut read = store.get_alpine("ns1", "web").await.unwrap().unwrap();
        store.touch_alpine("ns1", "web");

        read.status = Some(AlpineStatus::default());
        let err = store.replace_status("ns1", &read).await.unwrap_err();
        assert!(is_conflict(&err));
        assert!(store.ops().is_empty());

        let fresh = store.get_alpine("ns1", "web").await.unwrap().unwrap();
        let updated = store.replace_status("ns1", &fresh).await.unwrap();
        assert_ne!(updated.metadata.resource_version, fresh.metadata.resource_version);
    }

    #[tokio::test]
    async fn status_write_for_deleted_alpine_is_not_found() {
        let store = MemoryStore::new();
        let stored = store.insert_alpine(web());
        store.delete_alpine("ns1", "web");
        let err = store.replace_status("ns1", &stored).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(ae) if ae.code == 404));
    }

    #[tokio::test]
    async fn lagging_watch_still_counts_own_creations() {
        let store = MemoryStore::lagging();
        let stored = store.insert_alpine(web());
        let pod = crate::pod::construct_pod(&stored, &Default::default(), chrono::Utc::now()).unwrap();
        store.create_pod("ns1", &pod).await.unwrap();
        assert_eq!(store.children("web", "ns1").unwrap().len(), 1);

        store.delete_pod("ns1", &pod.name_any());
        assert_eq!(store.children("web", "ns1").unwrap().len(), 1);
        assert_eq!(store.deliver_watch(), 2);
        assert!(store.children("web", "ns1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_pod_names_are_rejected() {
        let store = MemoryStore::new();
        let pod = Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("web-1".into()),
                namespace: Some("ns1".into()),
                ..Default::default()
            },
            ..Pod::default()
        };
        store.create_pod("ns1", &pod).await.unwrap();
        let err = store.create_pod("ns1", &pod).await.unwrap_err();
        assert!(is_conflict(&err));
        assert_eq!(store.pods("ns1").len(), 1);
    }
}
