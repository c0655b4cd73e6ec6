//! Keel store: the in-memory state cache.
//!
//! Mirrors watched orchestrator objects into an object index and folds every
//! object that carries the component-id label into its `Component`. Controllers
//! read the previous converged component from here, install new ones after
//! applying changes, and mirror their own deletes eagerly through `on_delete`.

#![forbid(unsafe_code)]

mod coalesce;
mod ingest;
mod resources;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use keel_core::{labels, CacheKey, Component, ComponentBase, ComponentStatus, WorkloadKind};
use keel_kubehub::{KubeObject, ObjectKey, ObjectKind, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, trace};

pub use coalesce::Coalescer;
pub use ingest::spawn_ingest;
pub use resources::{aggregate, tenant_of, TenantResource, TenantSnapshot};

/// Typed access from a `KubeObject` to one collection member type.
trait Pick: Clone + kube::Resource {
    const KIND: ObjectKind;
    fn pick(o: &KubeObject) -> Option<&Self>;
}

macro_rules! pick {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Pick for $ty {
            const KIND: ObjectKind = ObjectKind::$variant;
            fn pick(o: &KubeObject) -> Option<&Self> {
                match o {
                    KubeObject::$variant(x) => Some(x),
                    _ => None,
                }
            }
        })*
    };
}

pick! {
    Service => Service,
    Secret => Secret,
    ConfigMap => ConfigMap,
    Ingress => Ingress,
    Pod => Pod,
    HorizontalPodAutoscaler => Hpa,
    PersistentVolumeClaim => Pvc,
    kube::core::DynamicObject => ServiceMonitor,
}

#[derive(Default)]
struct Inner {
    components: FxHashMap<String, Component>,
    /// Components created from labels alone, not yet registered by a controller.
    skeletons: FxHashSet<String>,
    objects: FxHashMap<ObjectKey, KubeObject>,
    synced: FxHashSet<ObjectKind>,
    storage_classes: FxHashSet<String>,
    crds: FxHashSet<String>,
}

pub struct Store {
    inner: RwLock<Inner>,
    tenants: ArcSwap<TenantSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self { Self::new() }
}

fn observed(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> bool {
    meta.resource_version.as_deref().is_some_and(|rv| !rv.is_empty())
}

fn skeleton(id: &CacheKey, obj: &KubeObject) -> Component {
    let labels = obj.meta().labels.as_ref();
    let tenant = labels
        .and_then(|l| l.get(labels::TENANT_ID))
        .cloned()
        .unwrap_or_else(|| obj.namespace().to_string());
    let kind = match obj.kind() {
        ObjectKind::StatefulSet => WorkloadKind::StatefulSet,
        _ => WorkloadKind::Deployment,
    };
    let mut base = ComponentBase::new(tenant, id.as_str(), kind);
    base.namespace = obj.namespace().to_string();
    base.deploy_version = labels.and_then(|l| l.get(labels::VERSION)).cloned().unwrap_or_default();
    Component::new(base)
}

/// Fold one observed object into its component.
fn install(comp: &mut Component, obj: KubeObject, is_skeleton: bool) {
    match obj {
        KubeObject::StatefulSet(s) => {
            if is_skeleton {
                comp.base.replicas = s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
            }
            comp.set_statefulset(s);
        }
        KubeObject::Deployment(d) => {
            if is_skeleton {
                comp.base.replicas = d.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
            }
            comp.set_deployment(d);
        }
        KubeObject::Pod(p) => comp.set_pod(p),
        KubeObject::Service(s) => comp.set_service(s),
        KubeObject::Secret(s) => comp.set_secret(s),
        KubeObject::ConfigMap(c) => comp.set_config_map(c),
        KubeObject::Ingress(i) => comp.set_ingress(i),
        KubeObject::Hpa(h) => comp.set_hpa(h),
        KubeObject::Pvc(p) => comp.set_claim(p),
        KubeObject::ServiceMonitor(m) => comp.set_monitor(m),
        KubeObject::Namespace(_) | KubeObject::StorageClass(_) | KubeObject::Crd(_) => {}
    }
}

/// Drop one object from its component. Returns true when the component is now empty.
fn uninstall(comp: &mut Component, obj: &KubeObject) -> bool {
    let name = obj.name();
    match obj.kind() {
        kind @ (ObjectKind::StatefulSet | ObjectKind::Deployment) => {
            let same_kind = comp.workload_kind().map(workload_object_kind) == Some(kind);
            if same_kind && comp.workload().name() == Some(name) {
                comp.delete_workload();
            }
        }
        ObjectKind::Pod => { comp.delete_pod(name); }
        ObjectKind::Service => { comp.delete_service(name); }
        ObjectKind::Secret => { comp.delete_secret(name); }
        ObjectKind::ConfigMap => { comp.delete_config_map(name); }
        ObjectKind::Ingress => { comp.delete_ingress(name); }
        ObjectKind::Hpa => { comp.delete_hpa(name); }
        ObjectKind::Pvc => { comp.delete_claim(name); }
        ObjectKind::ServiceMonitor => { comp.delete_monitor(name); }
        ObjectKind::Namespace | ObjectKind::StorageClass | ObjectKind::Crd => {}
    }
    comp.workload().is_none() && comp.pods().is_empty()
}

/// Keep desired-but-unobserved members, replace observed ones with their
/// indexed copy, drop observed ones that left the index.
fn refresh_list<K: Pick>(items: &mut Vec<K>, ns: &str, objects: &FxHashMap<ObjectKey, KubeObject>) {
    items.retain_mut(|item| {
        let meta = item.meta();
        let key = (
            K::KIND,
            meta.namespace.clone().unwrap_or_else(|| ns.to_string()),
            meta.name.clone().unwrap_or_default(),
        );
        match objects.get(&key).and_then(K::pick) {
            Some(fresh) => {
                *item = fresh.clone();
                true
            }
            None => !observed(item.meta()),
        }
    });
}

fn workload_object_kind(kind: WorkloadKind) -> ObjectKind {
    match kind {
        WorkloadKind::StatefulSet => ObjectKind::StatefulSet,
        WorkloadKind::Deployment => ObjectKind::Deployment,
    }
}

fn refresh(comp: &mut Component, objects: &FxHashMap<ObjectKey, KubeObject>) {
    let id = comp.id().to_string();
    let ns = comp.namespace().to_string();
    let belongs = |o: &KubeObject| o.component_id().as_ref().map(CacheKey::as_str) == Some(id.as_str());

    match comp.workload_kind() {
        Some(kind) => {
            let name = comp.workload().name().unwrap_or_default().to_string();
            let wns = comp.workload().namespace().unwrap_or(&ns).to_string();
            match objects.get(&(workload_object_kind(kind), wns, name)) {
                Some(KubeObject::StatefulSet(s)) => comp.set_statefulset(s.clone()),
                Some(KubeObject::Deployment(d)) => comp.set_deployment(d.clone()),
                _ if comp.workload().resource_version().is_some() => comp.forget_workload(),
                _ => {}
            }
        }
        None if !comp.is_deleted() => {
            let adopted = objects
                .values()
                .find(|o| matches!(o.kind(), ObjectKind::StatefulSet | ObjectKind::Deployment) && belongs(o))
                .cloned();
            if let Some(obj) = adopted {
                install(comp, obj, false);
            }
        }
        None => {}
    }

    refresh_list(comp.services_mut(), &ns, objects);
    refresh_list(comp.secrets_mut(), &ns, objects);
    refresh_list(comp.config_maps_mut(), &ns, objects);
    refresh_list(comp.ingresses_mut(), &ns, objects);
    refresh_list(comp.hpas_mut(), &ns, objects);
    refresh_list(comp.claims_mut(), &ns, objects);
    refresh_list(comp.monitors_mut(), &ns, objects);
    refresh_list(comp.pods_mut(), &ns, objects);
    let pods: Vec<Pod> = objects
        .values()
        .filter(|o| o.kind() == ObjectKind::Pod && belongs(o))
        .filter_map(|o| Pod::pick(o).cloned())
        .collect();
    for p in pods {
        comp.set_pod(p);
    }
}

impl Inner {
    fn update(&mut self, mut obj: KubeObject) {
        obj.strip_managed_fields();
        match obj.kind() {
            ObjectKind::StorageClass => {
                self.storage_classes.insert(obj.name().to_string());
            }
            ObjectKind::Crd => {
                self.crds.insert(obj.name().to_string());
            }
            _ => {}
        }
        self.objects.insert(obj.key(), obj.clone());
        let Some(id) = obj.component_id() else { return };
        let is_skeleton = if self.components.contains_key(id.as_str()) {
            self.skeletons.contains(id.as_str())
        } else {
            self.components.insert(id.to_string(), skeleton(&id, &obj));
            self.skeletons.insert(id.to_string());
            true
        };
        if let Some(comp) = self.components.get_mut(id.as_str()) {
            install(comp, obj, is_skeleton);
        }
    }

    fn delete(&mut self, obj: &KubeObject) {
        self.objects.remove(&obj.key());
        match obj.kind() {
            ObjectKind::StorageClass => {
                self.storage_classes.remove(obj.name());
            }
            ObjectKind::Crd => {
                self.crds.remove(obj.name());
            }
            _ => {}
        }
        let Some(id) = obj.component_id() else { return };
        let emptied = match self.components.get_mut(id.as_str()) {
            Some(comp) => uninstall(comp, obj),
            None => false,
        };
        if emptied {
            debug!(component = %id, "workload and pods gone; discarding component");
            self.components.remove(id.as_str());
            self.skeletons.remove(id.as_str());
        }
    }
}

impl Store {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { inner: RwLock::new(Inner::default()), tenants: ArcSwap::from_pointee(TenantSnapshot::default()), epoch_tx }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> { self.inner.read().unwrap_or_else(|p| p.into_inner()) }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> { self.inner.write().unwrap_or_else(|p| p.into_inner()) }

    // ---- readiness ----

    /// True once every required kind finished its initial list.
    pub fn ready(&self) -> bool {
        let inner = self.read();
        ObjectKind::REQUIRED.iter().all(|k| inner.synced.contains(k))
    }

    pub fn mark_synced(&self, kind: ObjectKind) {
        debug!(%kind, "initial list synced");
        self.write().synced.insert(kind);
    }

    /// For offline use: treat every required kind as synced.
    pub fn mark_all_synced(&self) {
        let mut inner = self.write();
        inner.synced.extend(ObjectKind::REQUIRED);
    }

    // ---- components ----

    pub fn get_component(&self, id: &str) -> Option<Component> { self.read().components.get(id).cloned() }

    /// Read-through: reconcile the cached component against the object index first.
    pub fn update_and_get_component(&self, id: &str) -> Option<Component> {
        let mut guard = self.write();
        let inner = &mut *guard;
        let comp = inner.components.get_mut(id)?;
        refresh(comp, &inner.objects);
        Some(comp.clone())
    }

    /// Idempotent wholesale upsert.
    pub fn register_component(&self, c: Component) {
        let id = c.id().to_string();
        trace!(component = %id, "register");
        let mut inner = self.write();
        inner.skeletons.remove(&id);
        inner.components.insert(id, c);
        metrics::gauge!("store_components", inner.components.len() as f64);
    }

    pub fn remove_component(&self, id: &str) -> Option<Component> {
        let mut inner = self.write();
        inner.skeletons.remove(id);
        inner.components.remove(id)
    }

    pub fn all_components(&self) -> Vec<Component> { self.read().components.values().cloned().collect() }

    /// Absent components are closed.
    pub fn component_status(&self, id: &str) -> ComponentStatus {
        self.read().components.get(id).map(Component::status).unwrap_or(ComponentStatus::Closed)
    }

    pub fn components_status(&self, ids: &[String]) -> Vec<(String, ComponentStatus)> {
        let inner = self.read();
        ids.iter()
            .map(|id| (id.clone(), inner.components.get(id).map(Component::status).unwrap_or(ComponentStatus::Closed)))
            .collect()
    }

    pub fn tenant_running_components(&self, tenant_id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .read()
            .components
            .values()
            .filter(|c| c.base.tenant_id == tenant_id && c.status() == ComponentStatus::Running)
            .map(|c| c.id().to_string())
            .collect();
        out.sort();
        out
    }

    // ---- watch mirror ----

    pub fn on_add(&self, obj: KubeObject) { self.on_update(obj) }

    pub fn on_update(&self, obj: KubeObject) { self.write().update(obj) }

    /// Also called eagerly by controllers right after a successful delete.
    pub fn on_delete(&self, obj: &KubeObject) { self.write().delete(obj) }

    /// Apply a full relist of one kind under a single lock: cached objects of
    /// that kind missing from `objects` are deleted, the rest upserted.
    pub fn replace_kind(&self, kind: ObjectKind, objects: Vec<KubeObject>) {
        let mut inner = self.write();
        let listed: FxHashSet<ObjectKey> = objects.iter().map(KubeObject::key).collect();
        let stale: Vec<KubeObject> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.0 == kind && !listed.contains(*k))
            .map(|(_, o)| o.clone())
            .collect();
        debug!(%kind, listed = listed.len(), stale = stale.len(), "relist applied");
        for o in &stale {
            inner.delete(o);
        }
        for o in objects {
            inner.update(o);
        }
    }

    /// Mirror one watch event.
    pub fn apply(&self, ev: WatchEvent) {
        match ev {
            WatchEvent::Applied(o) => {
                metrics::counter!("store_events_total", 1u64, "kind" => "applied");
                self.on_update(o)
            }
            WatchEvent::Deleted(o) => {
                metrics::counter!("store_events_total", 1u64, "kind" => "deleted");
                self.on_delete(&o)
            }
            WatchEvent::Replaced(kind, objects) => {
                metrics::counter!("store_events_total", 1u64, "kind" => "replaced");
                self.replace_kind(kind, objects)
            }
            WatchEvent::Synced(kind) => self.mark_synced(kind),
        }
    }

    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<KubeObject> {
        self.read().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn has_crd(&self, name: &str) -> bool { self.read().crds.contains(name) }

    pub fn storage_classes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.read().storage_classes.iter().cloned().collect();
        v.sort();
        v
    }

    /// Forget everything cached under a namespace, including the namespace itself.
    pub fn evict_namespace(&self, ns: &str) {
        let mut guard = self.write();
        let inner = &mut *guard;
        inner.objects.retain(|(kind, ons, name), _| ons != ns && !(*kind == ObjectKind::Namespace && name == ns));
        let gone: Vec<String> = inner.components.values().filter(|c| c.namespace() == ns).map(|c| c.id().to_string()).collect();
        for id in gone {
            inner.components.remove(&id);
            inner.skeletons.remove(&id);
        }
    }

    // ---- tenant resources ----

    /// Recompute tenant totals from indexed pods and swap the published snapshot.
    pub fn publish_tenants(&self) -> u64 {
        let (tenants, components) = {
            let inner = self.read();
            let pods = inner.objects.values().filter_map(|o| match o {
                KubeObject::Pod(p) => Some(p),
                _ => None,
            });
            (resources::aggregate(pods), inner.components.len())
        };
        let epoch = self.tenants.load().epoch.saturating_add(1);
        self.tenants.store(Arc::new(TenantSnapshot { epoch, tenants }));
        self.epoch_tx.send_replace(epoch);
        metrics::gauge!("store_components", components as f64);
        epoch
    }

    pub fn tenant_resource(&self, tenant_id: &str) -> Option<TenantResource> {
        self.tenants.load().tenants.get(tenant_id).copied()
    }

    pub fn tenant_resource_list(&self) -> Arc<TenantSnapshot> { self.tenants.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(name: &str, id: &str, rv: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("t1".into()),
            labels: Some(BTreeMap::from([(labels::COMPONENT_ID.to_string(), id.to_string())])),
            resource_version: rv.map(String::from),
            ..Default::default()
        }
    }

    fn deploy(id: &str, rv: Option<&str>) -> Deployment {
        Deployment {
            metadata: meta("web", id, rv),
            spec: Some(DeploymentSpec { replicas: Some(2), ..Default::default() }),
            ..Default::default()
        }
    }

    fn pod(name: &str, id: &str) -> Pod { Pod { metadata: meta(name, id, Some("5")), ..Default::default() } }

    #[test]
    fn labelled_objects_build_a_skeleton() {
        let store = Store::new();
        store.on_add(KubeObject::from(deploy("c1", Some("3"))));
        let c = store.get_component("c1").unwrap();
        assert_eq!(c.base.tenant_id, "t1");
        assert_eq!(c.replicas(), 2);
        assert_eq!(c.workload_kind(), Some(WorkloadKind::Deployment));
    }

    #[test]
    fn deleting_workload_and_pods_discards_component() {
        let store = Store::new();
        store.on_add(KubeObject::from(deploy("c1", Some("3"))));
        store.on_add(KubeObject::from(pod("p0", "c1")));
        store.on_delete(&KubeObject::from(deploy("c1", Some("3"))));
        assert_eq!(store.component_status("c1"), ComponentStatus::Stopping);
        // a stale update after teardown does not resurrect the workload
        store.on_update(KubeObject::from(deploy("c1", Some("4"))));
        assert!(store.get_component("c1").unwrap().workload().is_none());
        store.on_delete(&KubeObject::from(pod("p0", "c1")));
        assert!(store.get_component("c1").is_none());
        assert_eq!(store.component_status("c1"), ComponentStatus::Closed);
    }

    #[test]
    fn deleting_another_kind_under_the_same_name_keeps_the_workload() {
        let store = Store::new();
        store.on_add(KubeObject::from(deploy("c1", Some("3"))));
        let sts = StatefulSet { metadata: meta("web", "c1", None), ..Default::default() };
        store.on_delete(&KubeObject::from(sts));
        let c = store.get_component("c1").unwrap();
        assert_eq!(c.workload_kind(), Some(WorkloadKind::Deployment));
        assert_eq!(c.workload().resource_version(), Some("3"));
    }

    #[test]
    fn refresh_keeps_desired_and_drops_vanished_observed() {
        let store = Store::new();
        let mut c = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::Deployment));
        c.set_deployment(deploy("c1", None));
        c.set_service(Service { metadata: meta("desired", "c1", None), ..Default::default() });
        c.set_service(Service { metadata: meta("gone", "c1", Some("9")), ..Default::default() });
        store.register_component(c);
        store.on_add(KubeObject::from(pod("p0", "c1")));

        let c = store.update_and_get_component("c1").unwrap();
        let names: Vec<_> = c.services().iter().filter_map(|s| s.metadata.name.clone()).collect();
        assert_eq!(names, vec!["desired".to_string()]);
        assert_eq!(c.pods().len(), 1);
        assert!(c.workload().resource_version().is_none());
    }

    #[test]
    fn readiness_requires_every_kind() {
        let store = Store::new();
        assert!(!store.ready());
        for k in ObjectKind::REQUIRED.iter().skip(1) {
            store.mark_synced(*k);
        }
        assert!(!store.ready());
        store.apply(WatchEvent::Synced(ObjectKind::REQUIRED[0]));
        assert!(store.ready());
    }

    #[test]
    fn evict_namespace_drops_components_and_objects() {
        let store = Store::new();
        store.on_add(KubeObject::from(deploy("c1", Some("3"))));
        store.evict_namespace("t1");
        assert!(store.get_component("c1").is_none());
        assert!(store.object(ObjectKind::Deployment, "t1", "web").is_none());
    }
}
