//! List+watch wiring for every kind the state cache mirrors.

use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::object::{service_monitor_resource, KubeObject, ObjectKind, SERVICE_MONITOR_CRD};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(KubeObject),
    Deleted(KubeObject),
    /// A full relist: whatever is cached for this kind and missing here was
    /// deleted while the watch was down.
    Replaced(ObjectKind, Vec<KubeObject>),
    /// Initial list for this kind completed.
    Synced(ObjectKind),
}

impl WatchEvent {
    fn object_count(&self) -> usize {
        match self {
            WatchEvent::Applied(_) | WatchEvent::Deleted(_) => 1,
            WatchEvent::Replaced(_, list) => list.len(),
            WatchEvent::Synced(_) => 0,
        }
    }
}

async fn watch_kind<K>(
    api: Api<K>,
    kind: ObjectKind,
    selector: Option<String>,
    wrap: fn(K) -> KubeObject,
    tx: mpsc::Sender<WatchEvent>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let cfg = match &selector {
        Some(s) => watcher::Config::default().labels(s),
        None => watcher::Config::default(),
    };
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(%kind, selector = ?selector, "watcher started");
    let mut synced = false;
    while let Some(ev) = stream.next().await {
        let out = match ev {
            Ok(Event::Applied(o)) => vec![WatchEvent::Applied(wrap(o))],
            Ok(Event::Deleted(o)) => vec![WatchEvent::Deleted(wrap(o))],
            Ok(Event::Restarted(list)) => {
                debug!(%kind, count = list.len(), "watch restart");
                let mut evs = vec![WatchEvent::Replaced(kind, list.into_iter().map(wrap).collect())];
                if !synced {
                    synced = true;
                    evs.push(WatchEvent::Synced(kind));
                }
                evs
            }
            Err(e) => {
                warn!(%kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        let objects: usize = out.iter().map(WatchEvent::object_count).sum();
        metrics::counter!("watch_events_total", objects as u64, "kind" => kind.as_str());
        for mut ev in out {
            match &mut ev {
                WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o.strip_managed_fields(),
                WatchEvent::Replaced(_, list) => list.iter_mut().for_each(KubeObject::strip_managed_fields),
                WatchEvent::Synced(_) => {}
            }
            if tx.send(ev).await.is_err() {
                debug!(%kind, "event receiver dropped; stopping watcher");
                return;
            }
        }
    }
    warn!(%kind, "watcher stream ended");
}

/// Spawn one watcher per mirrored kind. Managed kinds are filtered by `selector`;
/// storage classes and CRDs are watched unfiltered. ServiceMonitors are only
/// watched when their CRD is installed.
pub async fn start_watchers(client: Client, selector: &str, tx: mpsc::Sender<WatchEvent>) -> Vec<JoinHandle<()>> {
    let sel = (!selector.is_empty()).then(|| selector.to_string());
    let c = || client.clone();
    let mut handles = vec![
        tokio::spawn(watch_kind(Api::<Namespace>::all(c()), ObjectKind::Namespace, sel.clone(), KubeObject::Namespace, tx.clone())),
        tokio::spawn(watch_kind(Api::<StatefulSet>::all(c()), ObjectKind::StatefulSet, sel.clone(), KubeObject::StatefulSet, tx.clone())),
        tokio::spawn(watch_kind(Api::<Deployment>::all(c()), ObjectKind::Deployment, sel.clone(), KubeObject::Deployment, tx.clone())),
        tokio::spawn(watch_kind(Api::<Pod>::all(c()), ObjectKind::Pod, sel.clone(), KubeObject::Pod, tx.clone())),
        tokio::spawn(watch_kind(Api::<Service>::all(c()), ObjectKind::Service, sel.clone(), KubeObject::Service, tx.clone())),
        tokio::spawn(watch_kind(Api::<Secret>::all(c()), ObjectKind::Secret, sel.clone(), KubeObject::Secret, tx.clone())),
        tokio::spawn(watch_kind(Api::<ConfigMap>::all(c()), ObjectKind::ConfigMap, sel.clone(), KubeObject::ConfigMap, tx.clone())),
        tokio::spawn(watch_kind(Api::<Ingress>::all(c()), ObjectKind::Ingress, sel.clone(), KubeObject::Ingress, tx.clone())),
        tokio::spawn(watch_kind(Api::<HorizontalPodAutoscaler>::all(c()), ObjectKind::Hpa, sel.clone(), KubeObject::Hpa, tx.clone())),
        tokio::spawn(watch_kind(Api::<PersistentVolumeClaim>::all(c()), ObjectKind::Pvc, sel.clone(), KubeObject::Pvc, tx.clone())),
        tokio::spawn(watch_kind(Api::<StorageClass>::all(c()), ObjectKind::StorageClass, None, KubeObject::StorageClass, tx.clone())),
        tokio::spawn(watch_kind(Api::<CustomResourceDefinition>::all(c()), ObjectKind::Crd, None, KubeObject::Crd, tx.clone())),
    ];
    let crds: Api<CustomResourceDefinition> = Api::all(c());
    match crds.get_opt(SERVICE_MONITOR_CRD).await {
        Ok(Some(_)) => {
            let api: Api<DynamicObject> = Api::all_with(c(), &service_monitor_resource());
            handles.push(tokio::spawn(watch_kind(api, ObjectKind::ServiceMonitor, sel, KubeObject::ServiceMonitor, tx)));
        }
        Ok(None) => info!("ServiceMonitor CRD not installed; monitors will not be mirrored"),
        Err(e) => warn!(error = %e, "probing ServiceMonitor CRD failed"),
    }
    handles
}
