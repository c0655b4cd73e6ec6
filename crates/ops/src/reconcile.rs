//! Object-level building blocks shared by the controllers: identity
//! stamping, create-if-absent, evicting deletes and diff-and-apply.

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::DynamicObject;
use kube::Resource;
use keel_core::logger::step;
use keel_core::{labels, Component, StepStatus, Workload};
use keel_kubehub::{IgnoreAlreadyExists, IgnoreNotFound, KubeObject, ObjectKind};
use tracing::{debug, warn};

use crate::controllers::OpContext;
use crate::error::{ClientContext, ControllerError};

/// A collateral object type a component owns by name.
pub(crate) trait Owned: Clone + Resource + Into<KubeObject> + Send + Sync {
    const KIND: ObjectKind;

    fn from_object(o: KubeObject) -> Option<Self>;

    /// Carry server-side identity from the live object into the desired one
    /// before a replace.
    fn adopt(&mut self, live: &Self) {
        let (meta, live) = (self.meta_mut(), live.meta());
        meta.uid = live.uid.clone();
        meta.resource_version = live.resource_version.clone();
    }
}

macro_rules! owned {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Owned for $ty {
            const KIND: ObjectKind = ObjectKind::$variant;
            fn from_object(o: KubeObject) -> Option<Self> {
                match o {
                    KubeObject::$variant(x) => Some(x),
                    _ => None,
                }
            }
        })*
    };
}

owned! {
    Pod => Pod,
    Secret => Secret,
    ConfigMap => ConfigMap,
    Ingress => Ingress,
    HorizontalPodAutoscaler => Hpa,
    PersistentVolumeClaim => Pvc,
    DynamicObject => ServiceMonitor,
}

impl Owned for Service {
    const KIND: ObjectKind = ObjectKind::Service;

    fn from_object(o: KubeObject) -> Option<Self> {
        match o {
            KubeObject::Service(s) => Some(s),
            _ => None,
        }
    }

    /// Ports, type and labels come from the desired object; the allocated
    /// cluster IPs stay.
    fn adopt(&mut self, live: &Self) {
        self.metadata.uid = live.metadata.uid.clone();
        self.metadata.resource_version = live.metadata.resource_version.clone();
        if let (Some(spec), Some(live)) = (self.spec.as_mut(), live.spec.as_ref()) {
            spec.cluster_ip = live.cluster_ip.clone();
            spec.cluster_ips = live.cluster_ips.clone();
        }
    }
}

fn name_of<K: Resource>(o: &K) -> &str { o.meta().name.as_deref().unwrap_or_default() }

/// Default the namespace to the component's and make sure the identity labels
/// are present so the cache folds the object back into the component. The
/// managed labels put the object inside the watchers' selector.
pub(crate) fn stamp<K: Resource>(cx: &OpContext, obj: &mut K, c: &Component) { stamp_meta(cx, obj.meta_mut(), c) }

pub(crate) fn stamp_meta(cx: &OpContext, meta: &mut ObjectMeta, c: &Component) {
    if meta.namespace.as_deref().map_or(true, str::is_empty) {
        meta.namespace = Some(c.namespace().to_string());
    }
    stamp_labels(cx, meta, c.id(), &c.base.tenant_id);
}

fn stamp_labels(cx: &OpContext, meta: &mut ObjectMeta, id: &str, tenant: &str) {
    let l = meta.labels.get_or_insert_with(BTreeMap::new);
    l.entry(labels::COMPONENT_ID.to_string()).or_insert_with(|| id.to_string());
    l.entry(labels::TENANT_ID.to_string()).or_insert_with(|| tenant.to_string());
    for (k, v) in cx.config.managed_labels() {
        l.insert(k, v);
    }
}

/// Pods inherit the template labels; without them a pod never reaches the
/// cache or its component.
pub(crate) fn stamp_template(cx: &OpContext, c: &mut Component) {
    let (id, tenant) = (c.id().to_string(), c.base.tenant_id.clone());
    if let Some(t) = c.pod_template_mut() {
        stamp_labels(cx, t.metadata.get_or_insert_with(ObjectMeta::default), &id, &tenant);
    }
}

/// The owned workload as an orchestrator object, identity stamped down to
/// its pod template.
pub(crate) fn workload_object(cx: &OpContext, c: &Component) -> Option<KubeObject> {
    let mut w = c.workload().clone();
    if let Some(t) = w.pod_template_mut() {
        stamp_labels(cx, t.metadata.get_or_insert_with(ObjectMeta::default), c.id(), &c.base.tenant_id);
    }
    let mut obj = match w {
        Workload::None => return None,
        Workload::StatefulSet(s) => KubeObject::from(*s),
        Workload::Deployment(d) => KubeObject::from(*d),
    };
    stamp_meta(cx, obj.meta_mut(), c);
    Some(obj)
}

/// How a diff-and-apply pass treats a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnError {
    Abort,
    Warn,
}

/// Get the tenant namespace, creating it when missing. A concurrent create is success.
pub(crate) async fn ensure_namespace(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    let ns = c.namespace();
    let found = cx.orchestrator.get(ObjectKind::Namespace, "", ns).await.ignore_not_found();
    if found.context(|| format!("check namespace {ns}"))?.is_some() {
        return Ok(());
    }
    let mut obj = Namespace::default();
    obj.metadata.name = Some(ns.to_string());
    let mut l = cx.config.managed_labels();
    l.insert(labels::TENANT_ID.to_string(), c.base.tenant_id.clone());
    obj.metadata.labels = Some(l);
    cx.orchestrator
        .create(&obj.into())
        .await
        .ignore_already_exists()
        .context(|| format!("create namespace {ns}"))?;
    debug!(namespace = %ns, "namespace created");
    Ok(())
}

/// Create one object; an existing object with the same name is success.
pub(crate) async fn create_if_absent<K: Owned>(cx: &OpContext, c: &Component, obj: &K) -> Result<(), ControllerError> {
    let mut obj = obj.clone();
    stamp(cx, &mut obj, c);
    let name = name_of(&obj).to_string();
    cx.orchestrator
        .create(&obj.into())
        .await
        .ignore_already_exists()
        .context(|| format!("create {} {name}", K::KIND))?;
    Ok(())
}

pub(crate) async fn create_all<K: Owned>(cx: &OpContext, c: &Component, objs: &[K]) -> Result<(), ControllerError> {
    for o in objs {
        create_if_absent(cx, c, o).await?;
    }
    Ok(())
}

/// Delete one object (absent is success) and evict it from the cache right away.
pub(crate) async fn delete_evict(cx: &OpContext, obj: KubeObject) -> Result<(), ControllerError> {
    let (kind, ns, name) = obj.key();
    cx.orchestrator
        .delete(kind, &ns, &name)
        .await
        .ignore_not_found()
        .context(|| format!("delete {kind} {ns}/{name}"))?;
    cx.store.on_delete(&obj);
    Ok(())
}

pub(crate) async fn delete_all<K: Owned>(cx: &OpContext, c: &Component, objs: &[K]) -> Result<(), ControllerError> {
    for o in objs {
        let mut o = o.clone();
        stamp(cx, &mut o, c);
        delete_evict(cx, o.into()).await?;
    }
    Ok(())
}

/// Turn `live` into `desired`: same-named objects are replaced in place,
/// new ones created, objects missing from `desired` deleted. Returns the
/// objects as the orchestrator stored them; under `OnError::Warn` a failed
/// object is returned as desired.
pub(crate) async fn diff_apply<K: Owned>(
    cx: &OpContext,
    c: &Component,
    live: &[K],
    desired: &[K],
    on_error: OnError,
) -> Result<Vec<K>, ControllerError> {
    let mut current: BTreeMap<&str, &K> = live.iter().map(|o| (name_of(o), o)).collect();
    let mut applied = Vec::with_capacity(desired.len());
    let mut degraded = Vec::new();

    for want in desired {
        let mut obj = want.clone();
        stamp(cx, &mut obj, c);
        let name = name_of(&obj).to_string();
        let fallback = obj.clone();
        let res = match current.remove(name.as_str()) {
            Some(existing) => {
                obj.adopt(existing);
                match cx.orchestrator.replace(&obj.clone().into()).await {
                    Err(e) if e.is_not_found() => cx.orchestrator.create(&obj.into()).await,
                    other => other,
                }
                .context(|| format!("update {} {name}", K::KIND))
            }
            None => match cx.orchestrator.create(&obj.clone().into()).await {
                Err(e) if e.is_already_exists() => Ok(obj.into()),
                other => other,
            }
            .context(|| format!("create {} {name}", K::KIND)),
        };
        match res {
            Ok(stored) => {
                debug!(component = %c.id(), kind = %K::KIND, %name, "applied");
                applied.extend(K::from_object(stored));
            }
            Err(e) if on_error == OnError::Abort => return Err(e),
            Err(e) => {
                degraded.push(e);
                applied.push(fallback);
            }
        }
    }

    for stale in current.into_values() {
        let mut o = stale.clone();
        stamp(cx, &mut o, c);
        match delete_evict(cx, o.into()).await {
            Err(e) if on_error == OnError::Abort => return Err(e),
            Err(e) => degraded.push(e),
            Ok(()) => {}
        }
    }

    for e in &degraded {
        warn!(component = %c.id(), kind = %K::KIND, error = %e, "reconcile degraded");
        c.logger().error(&e.to_string(), step::RUNTIME, StepStatus::Running);
    }
    Ok(applied)
}
