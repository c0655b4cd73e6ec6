use async_trait::async_trait;
use keel_core::{Component, WorkloadKind};
use keel_kubehub::{KubeObject, ObjectKind};
use serde_json::json;

use super::{run_each, OpContext, Operation};
use crate::error::{ClientContext, ControllerError};

/// Patch the replica count and return once accepted. Convergence is
/// surfaced by the cache, not awaited here.
pub(crate) struct Scale {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Scale {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "scale", |c| scale_one(cx, c)).await
    }
}

async fn scale_one(cx: &OpContext, c: &Component) -> Result<(), ControllerError> {
    if c.is_third_party() {
        cx.trace(c, "externally managed; scaling skipped");
        return Ok(());
    }
    let cached = cx.store.get_component(c.id());
    let owner = cached.as_ref().filter(|o| !o.workload().is_none()).unwrap_or(c);
    let Some(kind) = owner.workload_kind() else {
        return Err(ControllerError::NotRunning(c.id().to_string()));
    };
    let kind = match kind {
        WorkloadKind::StatefulSet => ObjectKind::StatefulSet,
        WorkloadKind::Deployment => ObjectKind::Deployment,
    };
    let name = owner.workload().name().unwrap_or_default().to_string();
    let ns = owner.workload().namespace().unwrap_or(owner.namespace()).to_string();
    let replicas = c.replicas();

    let patched = cx
        .orchestrator
        .patch(kind, &ns, &name, &json!({ "spec": { "replicas": replicas } }))
        .await
        .context(|| format!("scale {kind} {ns}/{name} to {replicas}"))?;

    if let Some(mut comp) = cached {
        comp.base.replicas = replicas;
        match patched {
            KubeObject::StatefulSet(s) => comp.set_statefulset(s),
            KubeObject::Deployment(d) => comp.set_deployment(d),
            _ => {}
        }
        cx.store.register_component(comp);
    }
    cx.trace(c, "replicas patched");
    Ok(())
}
