//! Closed set of orchestrator objects the engine touches.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::CacheKey;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

/// CRD name that must be present before monitoring objects are reconciled.
pub const SERVICE_MONITOR_CRD: &str = "servicemonitors.monitoring.coreos.com";

pub fn service_monitor_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor");
    ApiResource::from_gvk_with_plural(&gvk, "servicemonitors")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Namespace,
    StatefulSet,
    Deployment,
    Pod,
    Service,
    Secret,
    ConfigMap,
    Ingress,
    Hpa,
    Pvc,
    StorageClass,
    Crd,
    ServiceMonitor,
}

impl ObjectKind {
    /// Kinds whose initial list must complete before the cache reports ready.
    pub const REQUIRED: [ObjectKind; 12] = [
        ObjectKind::Namespace,
        ObjectKind::StatefulSet,
        ObjectKind::Deployment,
        ObjectKind::Pod,
        ObjectKind::Service,
        ObjectKind::Secret,
        ObjectKind::ConfigMap,
        ObjectKind::Ingress,
        ObjectKind::Hpa,
        ObjectKind::Pvc,
        ObjectKind::StorageClass,
        ObjectKind::Crd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Pod => "Pod",
            ObjectKind::Service => "Service",
            ObjectKind::Secret => "Secret",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::Hpa => "HorizontalPodAutoscaler",
            ObjectKind::Pvc => "PersistentVolumeClaim",
            ObjectKind::StorageClass => "StorageClass",
            ObjectKind::Crd => "CustomResourceDefinition",
            ObjectKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace | ObjectKind::StorageClass | ObjectKind::Crd)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone)]
pub enum KubeObject {
    Namespace(Namespace),
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    Pod(Pod),
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Ingress(Ingress),
    Hpa(HorizontalPodAutoscaler),
    Pvc(PersistentVolumeClaim),
    StorageClass(StorageClass),
    Crd(CustomResourceDefinition),
    ServiceMonitor(DynamicObject),
}

/// Runs `$body` with `$o` bound to the typed object inside any variant.
macro_rules! each_variant {
    ($obj:expr, $o:ident => $body:expr) => {
        match $obj {
            KubeObject::Namespace($o) => $body,
            KubeObject::StatefulSet($o) => $body,
            KubeObject::Deployment($o) => $body,
            KubeObject::Pod($o) => $body,
            KubeObject::Service($o) => $body,
            KubeObject::Secret($o) => $body,
            KubeObject::ConfigMap($o) => $body,
            KubeObject::Ingress($o) => $body,
            KubeObject::Hpa($o) => $body,
            KubeObject::Pvc($o) => $body,
            KubeObject::StorageClass($o) => $body,
            KubeObject::Crd($o) => $body,
            KubeObject::ServiceMonitor($o) => $body,
        }
    };
}

macro_rules! from_typed {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for KubeObject {
            fn from(o: $ty) -> Self { KubeObject::$variant(o) }
        })*
    };
}

from_typed! {
    Namespace => Namespace,
    StatefulSet => StatefulSet,
    Deployment => Deployment,
    Pod => Pod,
    Service => Service,
    Secret => Secret,
    ConfigMap => ConfigMap,
    Ingress => Ingress,
    HorizontalPodAutoscaler => Hpa,
    PersistentVolumeClaim => Pvc,
    StorageClass => StorageClass,
    CustomResourceDefinition => Crd,
    DynamicObject => ServiceMonitor,
}

/// (kind, namespace, name); namespace is empty for cluster-scoped kinds.
pub type ObjectKey = (ObjectKind, String, String);

impl KubeObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            KubeObject::Namespace(_) => ObjectKind::Namespace,
            KubeObject::StatefulSet(_) => ObjectKind::StatefulSet,
            KubeObject::Deployment(_) => ObjectKind::Deployment,
            KubeObject::Pod(_) => ObjectKind::Pod,
            KubeObject::Service(_) => ObjectKind::Service,
            KubeObject::Secret(_) => ObjectKind::Secret,
            KubeObject::ConfigMap(_) => ObjectKind::ConfigMap,
            KubeObject::Ingress(_) => ObjectKind::Ingress,
            KubeObject::Hpa(_) => ObjectKind::Hpa,
            KubeObject::Pvc(_) => ObjectKind::Pvc,
            KubeObject::StorageClass(_) => ObjectKind::StorageClass,
            KubeObject::Crd(_) => ObjectKind::Crd,
            KubeObject::ServiceMonitor(_) => ObjectKind::ServiceMonitor,
        }
    }

    pub fn meta(&self) -> &ObjectMeta { each_variant!(self, o => &o.metadata) }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta { each_variant!(self, o => &mut o.metadata) }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or_default() }

    pub fn namespace(&self) -> &str {
        if self.kind().namespaced() { self.meta().namespace.as_deref().unwrap_or_default() } else { "" }
    }

    pub fn key(&self) -> ObjectKey { (self.kind(), self.namespace().to_string(), self.name().to_string()) }

    pub fn component_id(&self) -> Option<CacheKey> { CacheKey::from_labels(self.meta().labels.as_ref()) }

    pub fn resource_version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        each_variant!(self, o => serde_json::to_value(o))
    }

    /// Decode an untyped object of the given kind.
    pub fn from_value(kind: ObjectKind, v: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ObjectKind::Namespace => KubeObject::Namespace(serde_json::from_value(v)?),
            ObjectKind::StatefulSet => KubeObject::StatefulSet(serde_json::from_value(v)?),
            ObjectKind::Deployment => KubeObject::Deployment(serde_json::from_value(v)?),
            ObjectKind::Pod => KubeObject::Pod(serde_json::from_value(v)?),
            ObjectKind::Service => KubeObject::Service(serde_json::from_value(v)?),
            ObjectKind::Secret => KubeObject::Secret(serde_json::from_value(v)?),
            ObjectKind::ConfigMap => KubeObject::ConfigMap(serde_json::from_value(v)?),
            ObjectKind::Ingress => KubeObject::Ingress(serde_json::from_value(v)?),
            ObjectKind::Hpa => KubeObject::Hpa(serde_json::from_value(v)?),
            ObjectKind::Pvc => KubeObject::Pvc(serde_json::from_value(v)?),
            ObjectKind::StorageClass => KubeObject::StorageClass(serde_json::from_value(v)?),
            ObjectKind::Crd => KubeObject::Crd(serde_json::from_value(v)?),
            ObjectKind::ServiceMonitor => KubeObject::ServiceMonitor(serde_json::from_value(v)?),
        })
    }

    /// Drop server-managed bookkeeping that only adds noise to cached copies.
    pub fn strip_managed_fields(&mut self) { self.meta_mut().managed_fields = None; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_objects_have_empty_namespace_in_key() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("t1".into());
        ns.metadata.namespace = Some("ignored".into());
        let obj = KubeObject::from(ns);
        assert_eq!(obj.key(), (ObjectKind::Namespace, String::new(), "t1".to_string()));
    }

    #[test]
    fn component_label_becomes_cache_key() {
        let raw = serde_json::json!({
            "metadata": { "name": "web", "namespace": "t1", "labels": { "keel.io/component-id": "c1" } }
        });
        let obj = KubeObject::from_value(ObjectKind::Service, raw).unwrap();
        assert_eq!(obj.component_id(), Some(CacheKey::new("c1")));
        assert_eq!(obj.namespace(), "t1");
    }
}
