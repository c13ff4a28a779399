//! Secondary index from controlling owner to the pods it controls.
//!
//! The index is a projection of the pod watch: each pod contributes at most
//! one entry, derived from its controller owner reference by [`index_key`].
//! Nothing else writes to it, so replaying the watch from a fresh listing
//! always reproduces the same contents.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::error::IndexError;

/// Namespace and name of the owning resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PodKey {
    namespace: String,
    name: String,
}

/// The pod's controller reference, if and only if it points at a `K`.
///
/// Group/version and kind come from `K`'s `Resource` impl, so a renamed or
/// re-versioned owner type can never be matched by a stale literal.
pub fn controller_of<K>(pod: &Pod) -> Option<&OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let owner = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))?;
    let is_k = owner.api_version == K::api_version(&()) && owner.kind == K::kind(&());
    is_k.then_some(owner)
}

/// Extraction function for the index: the owning `K` of a pod, if any.
pub fn index_key<K>(pod: &Pod) -> Option<OwnerKey>
where
    K: Resource<DynamicType = ()>,
{
    let owner = controller_of::<K>(pod)?;
    let namespace = pod.metadata.namespace.as_ref()?;
    Some(OwnerKey::new(namespace.clone(), owner.name.clone()))
}

#[derive(Debug, Default)]
struct State {
    synced: bool,
    by_owner: HashMap<OwnerKey, BTreeMap<String, Arc<Pod>>>,
    owner_of: HashMap<PodKey, OwnerKey>,
}

impl State {
    fn insert<K: Resource<DynamicType = ()>>(&mut self, pod: &Pod) {
        let (Some(name), Some(owner)) = (pod.metadata.name.clone(), index_key::<K>(pod)) else {
            return;
        };
        let key = PodKey { namespace: owner.namespace.clone(), name: name.clone() };
        self.by_owner.entry(owner.clone()).or_default().insert(name, Arc::new(pod.clone()));
        self.owner_of.insert(key, owner);
    }

    fn remove(&mut self, pod: &Pod) {
        let (Some(namespace), Some(name)) = (pod.metadata.namespace.clone(), pod.metadata.name.clone())
        else {
            return;
        };
        let Some(owner) = self.owner_of.remove(&PodKey { namespace, name: name.clone() }) else {
            return;
        };
        if let Some(children) = self.by_owner.get_mut(&owner) {
            children.remove(&name);
            if children.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

/// Shared, cheaply clonable owner index over pods controlled by `K`.
pub struct OwnerIndex<K> {
    state: Arc<RwLock<State>>,
    _owner: PhantomData<fn() -> K>,
}

impl<K> Clone for OwnerIndex<K> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state), _owner: PhantomData }
    }
}

impl<K> Default for OwnerIndex<K> {
    fn default() -> Self {
        Self { state: Arc::default(), _owner: PhantomData }
    }
}

impl<K> std::fmt::Debug for OwnerIndex<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("OwnerIndex")
            .field("synced", &state.synced)
            .field("owners", &state.by_owner.len())
            .finish()
    }
}

impl<K> OwnerIndex<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one pod watch event into the index.
    pub fn apply(&self, event: &Event<Pod>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            Event::Applied(pod) => {
                state.remove(pod);
                state.insert::<K>(pod);
            }
            Event::Deleted(pod) => state.remove(pod),
            Event::Restarted(pods) => {
                state.by_owner.clear();
                state.owner_of.clear();
                for pod in pods {
                    state.insert::<K>(pod);
                }
                state.synced = true;
            }
        }
    }

    /// Records a pod this process just created, ahead of its watch event.
    ///
    /// The later `Applied` for the same pod replaces this entry.
    pub fn observe_created(&self, pod: &Pod) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(pod);
        state.insert::<K>(pod);
    }

    /// True once a full listing has been applied.
    pub fn is_synced(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).synced
    }

    /// Pods controlled by the `K` named `owner_name` in `namespace`, ordered by name.
    pub fn children(&self, owner_name: &str, namespace: &str) -> Result<Vec<Arc<Pod>>, IndexError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.synced {
            return Err(IndexError::NotSynced);
        }
        let key = OwnerKey::new(namespace, owner_name);
        Ok(state
            .by_owner
            .get(&key)
            .map(|children| children.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Owner -> child pod names, for inspection and comparison.
    pub fn entries(&self) -> BTreeMap<OwnerKey, Vec<String>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_owner
            .iter()
            .map(|(owner, children)| (owner.clone(), children.keys().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Alpine;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn owner_ref(api_version: &str, kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    fn pod(ns: &str, name: &str, owners: Vec<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                owner_references: Some(owners),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn alpine_owned(ns: &str, name: &str, owner: &str) -> Pod {
        pod(ns, name, vec![owner_ref("staight.k8s.io/v1", "Alpine", owner, true)])
    }

    #[test]
    fn extracts_only_matching_controller() {
        assert_eq!(
            index_key::<Alpine>(&alpine_owned("ns1", "web-1", "web")),
            Some(OwnerKey::new("ns1", "web"))
        );
        // wrong kind
        let rs = pod("ns1", "p", vec![owner_ref("apps/v1", "ReplicaSet", "web", true)]);
        assert_eq!(index_key::<Alpine>(&rs), None);
        // right kind, other version
        let old = pod("ns1", "p", vec![owner_ref("staight.k8s.io/v1beta1", "Alpine", "web", true)]);
        assert_eq!(index_key::<Alpine>(&old), None);
        // owner but not controller
        let plain = pod("ns1", "p", vec![owner_ref("staight.k8s.io/v1", "Alpine", "web", false)]);
        assert_eq!(index_key::<Alpine>(&plain), None);
        // no owners at all
        assert_eq!(index_key::<Alpine>(&Pod::default()), None);
    }

    #[test]
    fn unsynced_index_refuses_queries() {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Applied(alpine_owned("ns1", "web-1", "web")));
        assert!(matches!(index.children("web", "ns1"), Err(IndexError::NotSynced)));
        index.apply(&Event::Restarted(vec![]));
        assert!(index.children("web", "ns1").unwrap().is_empty());
    }

    #[test]
    fn tracks_applied_and_deleted_pods() {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Restarted(vec![alpine_owned("ns1", "web-1", "web")]));
        index.apply(&Event::Applied(alpine_owned("ns1", "web-2", "web")));
        index.apply(&Event::Applied(alpine_owned("ns2", "web-3", "web")));

        let names: Vec<_> = index
            .children("web", "ns1")
            .unwrap()
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["web-1", "web-2"]);
        assert_eq!(index.children("web", "ns2").unwrap().len(), 1);

        index.apply(&Event::Deleted(alpine_owned("ns1", "web-1", "web")));
        assert_eq!(index.children("web", "ns1").unwrap().len(), 1);
        index.apply(&Event::Deleted(alpine_owned("ns1", "web-2", "web")));
        assert!(index.children("web", "ns1").unwrap().is_empty());
        assert!(!index.entries().contains_key(&OwnerKey::new("ns1", "web")));
    }

    #[test]
    fn reparented_pod_moves_between_owners() {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Restarted(vec![alpine_owned("ns1", "p", "a")]));
        index.apply(&Event::Applied(alpine_owned("ns1", "p", "b")));
        assert!(index.children("a", "ns1").unwrap().is_empty());
        assert_eq!(index.children("b", "ns1").unwrap().len(), 1);

        // orphaned: the owner reference was stripped
        index.apply(&Event::Applied(pod("ns1", "p", vec![])));
        assert!(index.entries().is_empty());
    }

    #[test]
    fn created_pod_is_counted_before_its_watch_event() {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Restarted(vec![]));
        index.observe_created(&alpine_owned("ns1", "web-1", "web"));
        assert_eq!(index.children("web", "ns1").unwrap().len(), 1);

        // the watch catches up with the same pod
        index.apply(&Event::Applied(alpine_owned("ns1", "web-1", "web")));
        assert_eq!(
            index.entries(),
            BTreeMap::from([(OwnerKey::new("ns1", "web"), vec!["web-1".to_string()])])
        );
    }

    #[test]
    fn restart_rebuilds_from_scratch() {
        let index = OwnerIndex::<Alpine>::new();
        index.apply(&Event::Restarted(vec![alpine_owned("ns1", "stale", "web")]));
        index.apply(&Event::Restarted(vec![alpine_owned("ns1", "fresh", "db")]));
        assert!(index.children("web", "ns1").unwrap().is_empty());
        assert_eq!(
            index.entries(),
            BTreeMap::from([(OwnerKey::new("ns1", "db"), vec!["fresh".to_string()])])
        );
    }
}
