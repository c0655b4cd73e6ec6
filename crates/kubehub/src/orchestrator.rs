//! Orchestrator control-plane vocabulary: get/create/replace/patch/delete per kind.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use tracing::debug;

use crate::error::ClientError;
use crate::object::{service_monitor_resource, KubeObject, ObjectKind};

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<KubeObject, ClientError>;
    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, ClientError>;
    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, ClientError>;
    /// JSON merge patch.
    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<KubeObject, ClientError>;
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// kube-rs backed orchestrator.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await.map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client { &self.client }
}

/// Binds `$api` to a typed `Api` for `$kind` and `$wrap` to the matching
/// `KubeObject` constructor, then evaluates `$body`.
macro_rules! with_api {
    ($client:expr, $kind:expr, $ns:expr, $api:ident, $wrap:ident => $body:expr) => {
        match $kind {
            ObjectKind::Namespace => { let $api: Api<Namespace> = Api::all($client); let $wrap = KubeObject::Namespace; $body }
            ObjectKind::StatefulSet => { let $api: Api<StatefulSet> = Api::namespaced($client, $ns); let $wrap = KubeObject::StatefulSet; $body }
            ObjectKind::Deployment => { let $api: Api<Deployment> = Api::namespaced($client, $ns); let $wrap = KubeObject::Deployment; $body }
            ObjectKind::Pod => { let $api: Api<Pod> = Api::namespaced($client, $ns); let $wrap = KubeObject::Pod; $body }
            ObjectKind::Service => { let $api: Api<Service> = Api::namespaced($client, $ns); let $wrap = KubeObject::Service; $body }
            ObjectKind::Secret => { let $api: Api<Secret> = Api::namespaced($client, $ns); let $wrap = KubeObject::Secret; $body }
            ObjectKind::ConfigMap => { let $api: Api<ConfigMap> = Api::namespaced($client, $ns); let $wrap = KubeObject::ConfigMap; $body }
            ObjectKind::Ingress => { let $api: Api<Ingress> = Api::namespaced($client, $ns); let $wrap = KubeObject::Ingress; $body }
            ObjectKind::Hpa => { let $api: Api<HorizontalPodAutoscaler> = Api::namespaced($client, $ns); let $wrap = KubeObject::Hpa; $body }
            ObjectKind::Pvc => { let $api: Api<PersistentVolumeClaim> = Api::namespaced($client, $ns); let $wrap = KubeObject::Pvc; $body }
            ObjectKind::StorageClass => { let $api: Api<StorageClass> = Api::all($client); let $wrap = KubeObject::StorageClass; $body }
            ObjectKind::Crd => { let $api: Api<CustomResourceDefinition> = Api::all($client); let $wrap = KubeObject::Crd; $body }
            ObjectKind::ServiceMonitor => {
                let $api: Api<DynamicObject> = Api::namespaced_with($client, $ns, &service_monitor_resource());
                let $wrap = KubeObject::ServiceMonitor;
                $body
            }
        }
    };
}

/// Binds `$api` and `$o` (the typed payload of `$obj`), then evaluates `$body`
/// and rewraps its `Ok` value.
macro_rules! with_object {
    ($client:expr, $obj:expr, $ns:expr, $api:ident, $o:ident => $body:expr) => {
        match $obj {
            KubeObject::Namespace($o) => { let $api: Api<Namespace> = Api::all($client); $body.map(KubeObject::Namespace) }
            KubeObject::StatefulSet($o) => { let $api: Api<StatefulSet> = Api::namespaced($client, $ns); $body.map(KubeObject::StatefulSet) }
            KubeObject::Deployment($o) => { let $api: Api<Deployment> = Api::namespaced($client, $ns); $body.map(KubeObject::Deployment) }
            KubeObject::Pod($o) => { let $api: Api<Pod> = Api::namespaced($client, $ns); $body.map(KubeObject::Pod) }
            KubeObject::Service($o) => { let $api: Api<Service> = Api::namespaced($client, $ns); $body.map(KubeObject::Service) }
            KubeObject::Secret($o) => { let $api: Api<Secret> = Api::namespaced($client, $ns); $body.map(KubeObject::Secret) }
            KubeObject::ConfigMap($o) => { let $api: Api<ConfigMap> = Api::namespaced($client, $ns); $body.map(KubeObject::ConfigMap) }
            KubeObject::Ingress($o) => { let $api: Api<Ingress> = Api::namespaced($client, $ns); $body.map(KubeObject::Ingress) }
            KubeObject::Hpa($o) => { let $api: Api<HorizontalPodAutoscaler> = Api::namespaced($client, $ns); $body.map(KubeObject::Hpa) }
            KubeObject::Pvc($o) => { let $api: Api<PersistentVolumeClaim> = Api::namespaced($client, $ns); $body.map(KubeObject::Pvc) }
            KubeObject::StorageClass($o) => { let $api: Api<StorageClass> = Api::all($client); $body.map(KubeObject::StorageClass) }
            KubeObject::Crd($o) => { let $api: Api<CustomResourceDefinition> = Api::all($client); $body.map(KubeObject::Crd) }
            KubeObject::ServiceMonitor($o) => {
                let $api: Api<DynamicObject> = Api::namespaced_with($client, $ns, &service_monitor_resource());
                $body.map(KubeObject::ServiceMonitor)
            }
        }
    };
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<KubeObject, ClientError> {
        let client = self.client.clone();
        with_api!(client, kind, namespace, api, wrap => api.get(name).await.map(wrap))
            .map_err(|e| ClientError::from_kube(e, kind, namespace, name))
    }

    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, ClientError> {
        let (kind, namespace, name) = obj.key();
        debug!(%kind, ns = %namespace, name = %name, "create");
        let client = self.client.clone();
        let pp = PostParams::default();
        with_object!(client, obj, &namespace, api, o => api.create(&pp, o).await)
            .map_err(|e| ClientError::from_kube(e, kind, &namespace, &name))
    }

    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, ClientError> {
        let (kind, namespace, name) = obj.key();
        debug!(%kind, ns = %namespace, name = %name, "replace");
        let client = self.client.clone();
        let pp = PostParams::default();
        with_object!(client, obj, &namespace, api, o => api.replace(&name, &pp, o).await)
            .map_err(|e| ClientError::from_kube(e, kind, &namespace, &name))
    }

    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<KubeObject, ClientError> {
        debug!(%kind, ns = %namespace, name, "merge patch");
        let client = self.client.clone();
        let pp = PatchParams::default();
        let body = Patch::Merge(patch);
        with_api!(client, kind, namespace, api, wrap => api.patch(name, &pp, &body).await.map(wrap))
            .map_err(|e| ClientError::from_kube(e, kind, namespace, name))
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), ClientError> {
        debug!(%kind, ns = %namespace, name, "delete");
        let client = self.client.clone();
        let dp = DeleteParams::default();
        with_api!(client, kind, namespace, api, _wrap => api.delete(name, &dp).await.map(|_| ()))
            .map_err(|e| ClientError::from_kube(e, kind, namespace, name))
    }
}
