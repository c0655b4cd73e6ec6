use async_trait::async_trait;
use keel_core::logger::step;
use keel_core::{Component, ComponentStatus, StepStatus};
use keel_kubehub::SERVICE_MONITOR_CRD;
use tracing::{debug, info, warn};

use super::stop::{teardown, wait_stopped};
use super::{run_each, OpContext, Operation};
use crate::error::{ClientContext, ControllerError};
use crate::reconcile::{create_all, create_if_absent, ensure_namespace, stamp_template, workload_object};
use crate::sequencer;
use crate::wait::start_timeout;

pub(crate) struct Start {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Start {
    /// Layer by in-batch dependencies; each layer starts concurrently and must
    /// finish before the next one begins.
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        let layers = sequencer::layers(self.components.clone())?;
        let depth = layers.len();
        debug!(controller = %cx.controller_id, plan = ?sequencer::layer_index(&layers), "start plan");
        for (i, layer) in layers.iter().enumerate() {
            info!(controller = %cx.controller_id, layer = i, of = depth, components = layer.len(), "starting layer");
            run_each(cx, layer, "start", |c| start_one(cx, c)).await?;
        }
        Ok(())
    }
}

/// Create everything for one component, then wait for readiness. A creation
/// failure rolls back what was created; a wait timeout does not.
pub(crate) async fn start_one(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    let status = cx.store.component_status(c.id());
    if status != ComponentStatus::Closed {
        return Err(ControllerError::AlreadyRunning(c.id().to_string()));
    }
    if let Err(e) = create_objects(cx, c).await {
        c.logger().error(&format!("create objects failed, rolling back: {e}"), step::RUNTIME, StepStatus::Failure);
        rollback(cx, c).await;
        return Err(e);
    }
    c.logger().info("all objects created, waiting for ready", step::RUNTIME, StepStatus::Running);
    cx.wait(c, start_timeout(c, cx.config.min_wait)).ready().await?;
    Ok(())
}

async fn create_objects(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    ensure_namespace(cx, c).await?;
    create_all(cx, c, c.config_maps()).await?;
    create_all(cx, c, c.claims()).await?;

    let mut desired = c.clone();
    if let Some(dns) = cx.dns.resolve(c).await {
        if let Some(spec) = desired.pod_template_mut().and_then(|t| t.spec.as_mut()) {
            spec.dns_config = Some(dns);
            spec.dns_policy = Some("None".into());
        }
    }
    stamp_template(cx, &mut desired);
    cx.store.register_component(desired.clone());

    if let Some(obj) = workload_object(cx, &desired) {
        let (kind, ns, name) = obj.key();
        cx.orchestrator.create(&obj).await.context(|| format!("create {kind} {ns}/{name}"))?;
        cx.trace(c, "workload created");
    }

    create_all(cx, c, c.services()).await?;
    create_all(cx, c, c.secrets()).await?;
    create_all(cx, c, c.ingresses()).await?;
    create_all(cx, c, c.hpas()).await?;

    if !c.monitors().is_empty() && cx.store.has_crd(SERVICE_MONITOR_CRD) {
        for m in c.monitors() {
            if let Err(e) = create_if_absent(cx, c, m).await {
                warn!(component = %c.id(), error = %e, "service monitor not created");
                c.logger().error(&e.to_string(), step::RUNTIME, StepStatus::Running);
            }
        }
    }
    Ok(())
}

/// Best effort: tear down whatever exists and give it the stop deadline to go.
async fn rollback(cx: &OpContext, c: &Component) {
    let observed = cx.store.get_component(c.id());
    let replicas = observed.as_ref().map_or(c.replicas(), Component::replicas);
    if let Err(e) = teardown(cx, c, observed.as_ref()).await {
        warn!(component = %c.id(), error = %e, "rollback teardown failed");
        return;
    }
    if let Err(e) = wait_stopped(cx, c, replicas).await {
        warn!(component = %c.id(), error = %e, "rollback did not settle");
    }
}
