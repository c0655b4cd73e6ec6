use std::collections::BTreeSet;

use async_trait::async_trait;
use keel_core::logger::step;
use keel_core::{Component, StepStatus};
use keel_kubehub::{IgnoreNotFound, KubeObject, ObjectKind, SERVICE_MONITOR_CRD};
use tracing::{info, warn};

use super::{run_each, OpContext, Operation};
use crate::error::{ClientContext, ControllerError};
use crate::reconcile::{delete_all, delete_evict, stamp, workload_object};
use crate::wait::stop_timeout;

pub(crate) struct Stop {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Stop {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "stop", |c| stop_one(cx, c)).await
    }
}

/// Teardown plus stop wait. Absent or closed components need nothing.
pub(crate) async fn stop_one(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    let Some(observed) = cx.store.get_component(c.id()) else {
        cx.trace(c, "not cached; nothing to stop");
        return Ok(());
    };
    if observed.is_closed() {
        cx.trace(c, "already closed");
        return Ok(());
    }
    teardown(cx, c, Some(&observed)).await?;
    c.logger().info("all objects deleted, waiting for close", step::RUNTIME, StepStatus::Running);
    wait_stopped(cx, c, observed.replicas()).await
}

pub(crate) async fn wait_stopped(cx: &OpContext, c: &Component, cached_replicas: i32) -> Result<(), ControllerError> {
    cx.wait(c, stop_timeout(cached_replicas, cx.config.min_wait)).stopped().await?;
    Ok(())
}

/// Every workload either side knows about, deduplicated by key.
fn workloads(cx: &OpContext, desired: &Component, observed: Option<&Component>) -> Vec<KubeObject> {
    let mut seen = BTreeSet::new();
    workload_object(cx, desired)
        .into_iter()
        .chain(observed.and_then(|o| workload_object(cx, o)))
        .filter(|o| seen.insert(o.key()))
        .collect()
}

/// Delete a component's objects in reverse creation order, mirroring each
/// delete into the cache. Absent objects are skipped.
pub(crate) async fn teardown(cx: &OpContext, desired: &Component, observed: Option<&Component>) -> Result<(), ControllerError> {
    let mut target = desired.clone();
    if let Some(o) = observed {
        target.merge_observed(o);
    }
    let c = &target;
    delete_all(cx, c, c.services()).await?;
    delete_all(cx, c, c.secrets()).await?;
    delete_all(cx, c, c.ingresses()).await?;
    delete_all(cx, c, c.config_maps()).await?;
    for w in workloads(cx, desired, observed) {
        delete_evict(cx, w).await?;
    }
    delete_all(cx, c, c.pods()).await?;
    delete_all(cx, c, c.hpas()).await?;

    if !c.monitors().is_empty() && cx.store.has_crd(SERVICE_MONITOR_CRD) {
        for m in c.monitors() {
            let mut m = m.clone();
            stamp(cx, &mut m, c);
            if let Err(e) = delete_evict(cx, m.into()).await {
                warn!(component = %c.id(), error = %e, "service monitor not deleted");
            }
        }
    }
    cx.trace(c, "teardown complete");
    Ok(())
}

/// Tenant teardown: delete without waiting, then drop the namespaces.
pub(crate) struct Delete {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Delete {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        let torn = run_each(cx, &self.components, "delete", |c| async move {
            let observed = cx.store.get_component(c.id());
            teardown(cx, c, observed.as_ref()).await
        })
        .await;

        let namespaces: BTreeSet<&str> = self.components.iter().map(Component::namespace).collect();
        for ns in namespaces {
            cx.orchestrator
                .delete(ObjectKind::Namespace, "", ns)
                .await
                .ignore_not_found()
                .context(|| format!("delete namespace {ns}"))?;
            cx.store.evict_namespace(ns);
            info!(controller = %cx.controller_id, namespace = %ns, "namespace deleted");
        }
        torn
    }
}
