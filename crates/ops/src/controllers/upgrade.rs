use async_trait::async_trait;
use keel_apply::PatchOutcome;
use keel_core::logger::step;
use keel_core::{Component, StepStatus, WorkloadKind};
use keel_kubehub::{KubeObject, ObjectKind, SERVICE_MONITOR_CRD};
use serde_json::Value;

use super::{run_each, OpContext, Operation};
use crate::error::{ClientContext, ControllerError};
use crate::reconcile::{create_all, diff_apply, ensure_namespace, stamp_template, OnError};
use crate::wait::upgrade_timeout;

/// In-place change of a running component.
pub(crate) struct Upgrade {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Upgrade {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "upgrade", |c| upgrade_one(cx, c)).await
    }
}

fn is_empty_patch(p: &Value) -> bool {
    match p {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// The precomputed patch if the caller attached one, otherwise computed
/// against the cached component. `None` means nothing changed.
fn resolve_patch(old: &Component, new: &mut Component, kind: WorkloadKind) -> Result<Option<Value>, ControllerError> {
    if let Some(p) = new.upgrade_patch(kind) {
        return Ok((!is_empty_patch(p)).then(|| p.clone()));
    }
    match keel_apply::set_upgrade_patch(old, new)? {
        PatchOutcome::NoChange => Ok(None),
        PatchOutcome::Patch(p) => Ok((!is_empty_patch(&p)).then_some(p)),
    }
}

async fn upgrade_one(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    let Some(old) = cx.store.get_component(c.id()).filter(|o| !o.workload().is_none()) else {
        return Err(ControllerError::NotRunning(c.id().to_string()));
    };
    let mut new = c.clone();
    // The cached workload carries the stamped template labels; stamp the
    // desired one the same way so they never show up in the patch.
    stamp_template(cx, &mut new);
    let (Some(old_kind), Some(kind)) = (old.workload_kind(), new.workload_kind()) else {
        return Err(ControllerError::NotRunning(c.id().to_string()));
    };
    if old_kind != kind {
        return Err(ControllerError::KindChanged { id: c.id().to_string(), old: old_kind, new: kind });
    }
    let Some(patch) = resolve_patch(&old, &mut new, kind)? else {
        c.logger().info("no upgrade required", step::LAST, StepStatus::Success);
        return Ok(());
    };

    ensure_namespace(cx, c).await?;

    let cms = diff_apply(cx, c, old.config_maps(), c.config_maps(), OnError::Abort).await?;
    *new.config_maps_mut() = cms;

    let object_kind = match kind {
        WorkloadKind::StatefulSet => ObjectKind::StatefulSet,
        WorkloadKind::Deployment => ObjectKind::Deployment,
    };
    let name = old.workload().name().unwrap_or_default().to_string();
    let ns = old.workload().namespace().unwrap_or(old.namespace()).to_string();
    let patched = cx
        .orchestrator
        .patch(object_kind, &ns, &name, &patch)
        .await
        .context(|| format!("patch {object_kind} {ns}/{name}"));
    let patched = match patched {
        Ok(p) => p,
        Err(e) => {
            c.logger().error(&format!("upgrade {} failure: {e}", c.alias()), step::RUNTIME, StepStatus::Failure);
            return Err(e);
        }
    };
    match patched {
        KubeObject::StatefulSet(s) => new.set_statefulset(s),
        KubeObject::Deployment(d) => new.set_deployment(d),
        _ => {}
    }
    cx.trace(c, "workload patched");

    create_all(cx, c, c.claims()).await?;

    // Degraded from here on: failures are warnings.
    *new.services_mut() = diff_apply(cx, c, old.services(), c.services(), OnError::Warn).await?;
    *new.secrets_mut() = diff_apply(cx, c, old.secrets(), c.secrets(), OnError::Warn).await?;
    *new.ingresses_mut() = diff_apply(cx, c, old.ingresses(), c.ingresses(), OnError::Warn).await?;
    if cx.store.has_crd(SERVICE_MONITOR_CRD) {
        *new.monitors_mut() = diff_apply(cx, c, old.monitors(), c.monitors(), OnError::Warn).await?;
    }

    for p in old.pods() {
        new.set_pod(p.clone());
    }
    new.clear_upgrade_patches();
    let replicas = new.replicas();
    cx.store.register_component(new.clone());

    c.logger().info("upgrade applied, waiting for new version", step::RUNTIME, StepStatus::Running);
    cx.wait(&new, upgrade_timeout(&new, replicas, cx.config.min_wait)).upgraded().await?;
    Ok(())
}
