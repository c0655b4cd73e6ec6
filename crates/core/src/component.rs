//! Component model: one tenant's deployable unit plus the orchestrator objects
//! it owns or observes.
//!
//! A `Component` owns at most one workload. The workload is a tagged union so
//! that owning both a StatefulSet and a Deployment cannot be represented.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, PodTemplateSpec, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::DynamicObject;
use kube::Resource;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::logger::{OperationLogger, TracingLogger};
use crate::status::{self, ComponentStatus};

/// Well-known labels stamped on every object the engine creates.
pub mod labels {
    /// Selector label whose value is the component id (the cache key).
    pub const COMPONENT_ID: &str = "keel.io/component-id";
    pub const TENANT_ID: &str = "keel.io/tenant-id";
    pub const VERSION: &str = "version";
    /// ConfigMaps rendered for a plugin. Only these are touched by plugin config refreshes.
    pub const PLUGIN_ID: &str = "keel.io/plugin-id";
    pub const MANAGED_BY: &str = "keel.io/managed-by";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("component declares a {declared} workload but owns a {owned}")]
    KindMismatch { declared: WorkloadKind, owned: WorkloadKind },
    #[error("component id is empty")]
    MissingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    StatefulSet,
    Deployment,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::Deployment => "deployment",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// How the component is managed. Third-party components are opaque to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Application,
    ThirdParty,
}

/// The single workload a component may own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "object", rename_all = "lowercase")]
pub enum Workload {
    #[default]
    None,
    StatefulSet(Box<StatefulSet>),
    Deployment(Box<Deployment>),
}

impl Workload {
    pub fn kind(&self) -> Option<WorkloadKind> {
        match self {
            Workload::None => None,
            Workload::StatefulSet(_) => Some(WorkloadKind::StatefulSet),
            Workload::Deployment(_) => Some(WorkloadKind::Deployment),
        }
    }

    pub fn is_none(&self) -> bool { matches!(self, Workload::None) }

    fn meta(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta> {
        match self {
            Workload::None => None,
            Workload::StatefulSet(s) => Some(&s.metadata),
            Workload::Deployment(d) => Some(&d.metadata),
        }
    }

    pub fn name(&self) -> Option<&str> { self.meta().and_then(|m| m.name.as_deref()) }

    pub fn namespace(&self) -> Option<&str> { self.meta().and_then(|m| m.namespace.as_deref()) }

    /// Empty when the object has never been observed from the orchestrator.
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().and_then(|m| m.resource_version.as_deref()).filter(|rv| !rv.is_empty())
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().and_then(|m| m.labels.as_ref())
    }

    pub fn ready_replicas(&self) -> i32 {
        match self {
            Workload::None => 0,
            Workload::StatefulSet(s) => s.status.as_ref().and_then(|st| st.ready_replicas).unwrap_or(0),
            Workload::Deployment(d) => d.status.as_ref().and_then(|st| st.ready_replicas).unwrap_or(0),
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::None => None,
            Workload::StatefulSet(s) => s.spec.as_ref().map(|sp| &sp.template),
            Workload::Deployment(d) => d.spec.as_ref().map(|sp| &sp.template),
        }
    }

    pub fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match self {
            Workload::None => None,
            Workload::StatefulSet(s) => s.spec.as_mut().map(|sp| &mut sp.template),
            Workload::Deployment(d) => d.spec.as_mut().map(|sp| &mut sp.template),
        }
    }
}

/// Cache identity of a component. Also the value of the component-id selector label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<Self> {
        labels
            .and_then(|l| l.get(labels::COMPONENT_ID))
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.clone()))
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str { &self.0 }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Identity and scalar spec of a component. Replaced wholesale on every reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentBase {
    pub tenant_id: String,
    /// Orchestrator namespace; falls back to the tenant id when empty.
    #[serde(default)]
    pub namespace: String,
    pub component_id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub deploy_version: String,
    pub kind: WorkloadKind,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub replicas: i32,
    /// Requested CPU in millicores.
    #[serde(default)]
    pub container_cpu: i32,
    /// Requested memory in MiB.
    #[serde(default)]
    pub container_memory: i32,
    #[serde(default)]
    pub need_proxy: bool,
    /// Ids of the components this one depends on.
    #[serde(default)]
    pub dependencies: SmallVec<[String; 4]>,
}

impl ComponentBase {
    pub fn new(tenant_id: impl Into<String>, component_id: impl Into<String>, kind: WorkloadKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace: String::new(),
            component_id: component_id.into(),
            alias: String::new(),
            deploy_version: String::new(),
            kind,
            service_type: ServiceType::Application,
            replicas: 1,
            container_cpu: 0,
            container_memory: 0,
            need_proxy: false,
            dependencies: SmallVec::new(),
        }
    }
}

fn default_logger() -> Arc<dyn OperationLogger> { Arc::new(TracingLogger::default()) }

fn upsert_named<K: Resource>(items: &mut Vec<K>, obj: K) {
    let name = obj.meta().name.clone();
    match items.iter_mut().find(|o| o.meta().name == name) {
        Some(slot) => *slot = obj,
        None => items.push(obj),
    }
}

fn remove_named<K: Resource>(items: &mut Vec<K>, name: &str) -> Option<K> {
    let idx = items.iter().position(|o| o.meta().name.as_deref() == Some(name))?;
    Some(items.remove(idx))
}

fn union_named<K: Resource + Clone>(items: &mut Vec<K>, other: &[K]) {
    for o in other {
        if !items.iter().any(|i| i.meta().name == o.meta().name) {
            items.push(o.clone());
        }
    }
}

macro_rules! owned_collection {
    ($field:ident, $field_mut:ident, $ty:ty, $set:ident, $del:ident) => {
        pub fn $field(&self) -> &[$ty] { &self.$field }

        pub fn $field_mut(&mut self) -> &mut Vec<$ty> { &mut self.$field }

        /// Upsert by object name.
        pub fn $set(&mut self, obj: $ty) { upsert_named(&mut self.$field, obj) }

        pub fn $del(&mut self, name: &str) -> Option<$ty> { remove_named(&mut self.$field, name) }
    };
}

/// One component: desired spec plus cached orchestrator objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    #[serde(flatten)]
    pub base: ComponentBase,
    #[serde(default)]
    workload: Workload,
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    secrets: Vec<Secret>,
    #[serde(default)]
    config_maps: Vec<ConfigMap>,
    #[serde(default)]
    ingresses: Vec<Ingress>,
    #[serde(default)]
    pods: Vec<Pod>,
    #[serde(default)]
    hpas: Vec<HorizontalPodAutoscaler>,
    #[serde(default)]
    claims: Vec<PersistentVolumeClaim>,
    #[serde(default)]
    monitors: Vec<DynamicObject>,
    #[serde(skip)]
    upgrade_patch: HashMap<WorkloadKind, serde_json::Value>,
    #[serde(skip)]
    deleted: bool,
    #[serde(skip, default = "default_logger")]
    logger: Arc<dyn OperationLogger>,
}

impl Component {
    pub fn new(base: ComponentBase) -> Self {
        Self {
            base,
            workload: Workload::None,
            services: Vec::new(),
            secrets: Vec::new(),
            config_maps: Vec::new(),
            ingresses: Vec::new(),
            pods: Vec::new(),
            hpas: Vec::new(),
            claims: Vec::new(),
            monitors: Vec::new(),
            upgrade_patch: HashMap::new(),
            deleted: false,
            logger: default_logger(),
        }
    }

    /// Attach the workload, enforcing that it matches the declared kind.
    pub fn with_workload(mut self, workload: Workload) -> Result<Self, ModelError> {
        if let Some(owned) = workload.kind() {
            if owned != self.base.kind {
                return Err(ModelError::KindMismatch { declared: self.base.kind, owned });
            }
        }
        self.workload = workload;
        Ok(self)
    }

    pub fn with_logger(mut self, logger: Arc<dyn OperationLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Checks the invariants a manifest loaded from disk may violate.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.base.component_id.is_empty() {
            return Err(ModelError::MissingId);
        }
        match self.workload.kind() {
            Some(owned) if owned != self.base.kind => {
                Err(ModelError::KindMismatch { declared: self.base.kind, owned })
            }
            _ => Ok(()),
        }
    }

    pub fn id(&self) -> &str { &self.base.component_id }

    pub fn key(&self) -> CacheKey { CacheKey::new(self.base.component_id.clone()) }

    pub fn alias(&self) -> &str {
        if self.base.alias.is_empty() { &self.base.component_id } else { &self.base.alias }
    }

    pub fn namespace(&self) -> &str {
        if self.base.namespace.is_empty() { &self.base.tenant_id } else { &self.base.namespace }
    }

    pub fn replicas(&self) -> i32 { self.base.replicas }

    pub fn is_third_party(&self) -> bool { self.base.service_type == ServiceType::ThirdParty }

    pub fn logger(&self) -> &Arc<dyn OperationLogger> { &self.logger }

    pub fn set_logger(&mut self, logger: Arc<dyn OperationLogger>) { self.logger = logger; }

    // ---- workload ----

    pub fn workload(&self) -> &Workload { &self.workload }

    pub fn workload_kind(&self) -> Option<WorkloadKind> { self.workload.kind() }

    pub fn statefulset(&self) -> Option<&StatefulSet> {
        match &self.workload {
            Workload::StatefulSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        match &self.workload {
            Workload::Deployment(d) => Some(d),
            _ => None,
        }
    }

    /// No-op once the workload was explicitly torn down.
    pub fn set_statefulset(&mut self, sts: StatefulSet) {
        if self.deleted {
            return;
        }
        self.base.kind = WorkloadKind::StatefulSet;
        self.workload = Workload::StatefulSet(Box::new(sts));
    }

    /// No-op once the workload was explicitly torn down.
    pub fn set_deployment(&mut self, deploy: Deployment) {
        if self.deleted {
            return;
        }
        self.base.kind = WorkloadKind::Deployment;
        self.workload = Workload::Deployment(Box::new(deploy));
    }

    /// Explicit teardown: drops the workload and ignores later stale updates.
    pub fn delete_workload(&mut self) {
        self.workload = Workload::None;
        self.deleted = true;
    }

    /// Drops the workload after it vanished from the orchestrator without marking a teardown.
    pub fn forget_workload(&mut self) { self.workload = Workload::None; }

    pub fn is_deleted(&self) -> bool { self.deleted }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> { self.workload.pod_template() }

    pub fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> { self.workload.pod_template_mut() }

    /// Initial delay of the first container probe: readiness first, liveness otherwise.
    pub fn probe_initial_delay(&self) -> i32 {
        let Some(spec) = self.pod_template().and_then(|t| t.spec.as_ref()) else { return 0 };
        for c in &spec.containers {
            if let Some(p) = &c.readiness_probe {
                return p.initial_delay_seconds.unwrap_or(0);
            }
            if let Some(p) = &c.liveness_probe {
                return p.initial_delay_seconds.unwrap_or(0);
            }
        }
        0
    }

    pub fn ready_replicas(&self) -> i32 { self.workload.ready_replicas() }

    pub fn running_version(&self) -> Option<&str> {
        self.workload.labels().and_then(|l| l.get(labels::VERSION)).map(String::as_str)
    }

    // ---- upgrade patches ----

    pub fn upgrade_patch(&self, kind: WorkloadKind) -> Option<&serde_json::Value> { self.upgrade_patch.get(&kind) }

    pub fn set_upgrade_patch(&mut self, kind: WorkloadKind, patch: serde_json::Value) {
        self.upgrade_patch.insert(kind, patch);
    }

    pub fn clear_upgrade_patches(&mut self) { self.upgrade_patch.clear(); }

    // ---- collateral objects ----

    owned_collection!(services, services_mut, Service, set_service, delete_service);
    owned_collection!(secrets, secrets_mut, Secret, set_secret, delete_secret);
    owned_collection!(config_maps, config_maps_mut, ConfigMap, set_config_map, delete_config_map);
    owned_collection!(ingresses, ingresses_mut, Ingress, set_ingress, delete_ingress);
    owned_collection!(pods, pods_mut, Pod, set_pod, delete_pod);
    owned_collection!(hpas, hpas_mut, HorizontalPodAutoscaler, set_hpa, delete_hpa);
    owned_collection!(claims, claims_mut, PersistentVolumeClaim, set_claim, delete_claim);
    owned_collection!(monitors, monitors_mut, DynamicObject, set_monitor, delete_monitor);

    /// ConfigMaps rendered for plugins (those carrying the plugin-id label).
    pub fn plugin_config_maps(&self) -> impl Iterator<Item = &ConfigMap> {
        self.config_maps
            .iter()
            .filter(|c| c.metadata.labels.as_ref().is_some_and(|l| l.contains_key(labels::PLUGIN_ID)))
    }

    /// Folds in what the cache observed: pods, a workload this value lacks, and any
    /// collateral object not already listed. Used to build a complete teardown target.
    pub fn merge_observed(&mut self, observed: &Component) {
        if self.workload.is_none() && !observed.workload.is_none() {
            self.workload = observed.workload.clone();
        }
        union_named(&mut self.pods, &observed.pods);
        union_named(&mut self.services, &observed.services);
        union_named(&mut self.secrets, &observed.secrets);
        union_named(&mut self.config_maps, &observed.config_maps);
        union_named(&mut self.ingresses, &observed.ingresses);
        union_named(&mut self.hpas, &observed.hpas);
        union_named(&mut self.claims, &observed.claims);
        union_named(&mut self.monitors, &observed.monitors);
    }

    // ---- state predicates ----

    pub fn has_terminated_container(&self) -> bool { status::has_terminated_container(&self.pods) }

    /// No pods and no workload the orchestrator has ever acknowledged.
    pub fn is_closed(&self) -> bool {
        self.pods.is_empty() && (self.workload.is_none() || self.workload.resource_version().is_none())
    }

    pub fn ready(&self) -> bool { !self.workload.is_none() && self.ready_replicas() >= self.base.replicas }

    /// All cached pods run the deploy version and the workload is ready.
    pub fn upgrade_complete(&self) -> bool {
        let version = self.base.deploy_version.as_str();
        let all_current = self.pods.iter().all(|p| {
            p.metadata.labels.as_ref().and_then(|l| l.get(labels::VERSION)).map(String::as_str) == Some(version)
        });
        all_current && self.ready()
    }

    pub fn status(&self) -> ComponentStatus { status::derive(self) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sts(name: &str) -> StatefulSet {
        StatefulSet { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    fn deploy(name: &str) -> Deployment {
        Deployment { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn with_workload_rejects_mismatched_kind() {
        let base = ComponentBase::new("t1", "c1", WorkloadKind::Deployment);
        let err = Component::new(base).with_workload(Workload::StatefulSet(Box::new(sts("x")))).unwrap_err();
        assert_eq!(err, ModelError::KindMismatch { declared: WorkloadKind::Deployment, owned: WorkloadKind::StatefulSet });
    }

    #[test]
    fn setting_other_kind_replaces_workload() {
        let mut c = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::StatefulSet));
        c.set_statefulset(sts("a"));
        c.set_deployment(deploy("b"));
        assert!(c.statefulset().is_none());
        assert_eq!(c.deployment().and_then(|d| d.metadata.name.as_deref()), Some("b"));
        assert_eq!(c.base.kind, WorkloadKind::Deployment);
    }

    #[test]
    fn deleted_flag_blocks_stale_sets() {
        let mut c = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::StatefulSet));
        c.set_statefulset(sts("a"));
        c.delete_workload();
        c.set_statefulset(sts("a"));
        assert!(c.workload().is_none());
        assert!(c.is_deleted());
    }

    #[test]
    fn upsert_replaces_same_name() {
        let mut c = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::Deployment));
        let mut svc = Service { metadata: ObjectMeta { name: Some("web".into()), ..Default::default() }, ..Default::default() };
        c.set_service(svc.clone());
        svc.metadata.resource_version = Some("2".into());
        c.set_service(svc);
        assert_eq!(c.services().len(), 1);
        assert_eq!(c.services()[0].metadata.resource_version.as_deref(), Some("2"));
        assert!(c.delete_service("web").is_some());
        assert!(c.services().is_empty());
    }

    #[test]
    fn manifest_keeps_identity() {
        let raw = serde_json::json!({
            "tenant_id": "t1",
            "component_id": "c1",
            "kind": "deployment",
            "replicas": 2,
            "dependencies": ["c0"],
            "workload": { "kind": "deployment", "object": { "metadata": { "name": "web" } } }
        });
        let c: Component = serde_json::from_value(raw).unwrap();
        assert_eq!(c.id(), "c1");
        assert_eq!(c.namespace(), "t1");
        assert_eq!(c.base.dependencies.as_slice(), &["c0".to_string()]);
        assert_eq!(c.workload_kind(), Some(WorkloadKind::Deployment));
        assert!(c.validate().is_ok());
    }
}
