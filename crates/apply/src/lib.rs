//! Keel apply: restricted workload projections and minimal merge-patch payloads
//! for in-place upgrades.

#![forbid(unsafe_code)]

mod node;

use keel_core::{Component, Workload, WorkloadKind};
use serde_json::{Map, Value as Json};
use tracing::debug;

pub use node::{diff, summarize, DiffSummary, Node};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("encode workload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("workload kind changed from {old} to {new}")]
    KindMismatch { old: WorkloadKind, new: WorkloadKind },
    #[error("component {0} owns no workload")]
    MissingWorkload(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    /// Projections are identical; nothing to send.
    NoChange,
    Patch(Json),
}

/// Pod spec fields the orchestrator accepts on an existing workload.
const POD_SPEC_FIELDS: &[&str] = &[
    "volumes",
    "initContainers",
    "containers",
    "imagePullSecrets",
    "nodeSelector",
    "tolerations",
    "affinity",
    "hostAliases",
    "hostname",
    "nodeName",
    "hostNetwork",
    "schedulerName",
];

const TEMPLATE_META_FIELDS: &[&str] = &["labels", "annotations"];

fn pick(src: Option<&Json>, fields: &[&str]) -> Map<String, Json> {
    let mut out = Map::new();
    if let Some(Json::Object(m)) = src {
        for f in fields {
            if let Some(v) = m.get(*f).filter(|v| !v.is_null()) {
                out.insert((*f).to_string(), v.clone());
            }
        }
    }
    out
}

/// Mutable subset of a workload: replicas, pod template and, for
/// StatefulSets, the update strategy.
pub fn project(workload: &Workload) -> Result<Option<Json>, PatchError> {
    let (encoded, kind) = match workload {
        Workload::None => return Ok(None),
        Workload::StatefulSet(s) => (serde_json::to_value(s)?, WorkloadKind::StatefulSet),
        Workload::Deployment(d) => (serde_json::to_value(d)?, WorkloadKind::Deployment),
    };
    let spec = encoded.get("spec");
    let template = spec.and_then(|s| s.get("template"));

    let mut tpl = Map::new();
    let meta = pick(template.and_then(|t| t.get("metadata")), TEMPLATE_META_FIELDS);
    if !meta.is_empty() {
        tpl.insert("metadata".into(), Json::Object(meta));
    }
    let pod = pick(template.and_then(|t| t.get("spec")), POD_SPEC_FIELDS);
    if !pod.is_empty() {
        tpl.insert("spec".into(), Json::Object(pod));
    }

    let mut out = pick(spec, &["replicas"]);
    if !tpl.is_empty() {
        out.insert("template".into(), Json::Object(tpl));
    }
    if kind == WorkloadKind::StatefulSet {
        out.extend(pick(spec, &["updateStrategy"]));
    }
    let mut root = Map::new();
    root.insert("spec".into(), Json::Object(out));
    Ok(Some(Json::Object(root)))
}

/// Merge-patch payload turning `old` into `new`, restricted to mutable fields.
pub fn workload_patch(old: &Workload, new: &Workload) -> Result<PatchOutcome, PatchError> {
    match (old.kind(), new.kind()) {
        (Some(o), Some(n)) if o != n => return Err(PatchError::KindMismatch { old: o, new: n }),
        _ => {}
    }
    let (Some(old_p), Some(new_p)) = (project(old)?, project(new)?) else {
        return Err(PatchError::MissingWorkload(new.name().or(old.name()).unwrap_or_default().to_string()));
    };
    let (old_n, new_n) = (Node::from_json(&old_p)?, Node::from_json(&new_p)?);
    match diff(&old_n, &new_n) {
        None => Ok(PatchOutcome::NoChange),
        Some(d) => Ok(PatchOutcome::Patch(d.to_json()?)),
    }
}

/// Computes the upgrade patch from the cached `old` component to `new` and
/// stores it on `new` under the workload kind.
pub fn set_upgrade_patch(old: &Component, new: &mut Component) -> Result<PatchOutcome, PatchError> {
    if old.workload().is_none() {
        return Err(PatchError::MissingWorkload(old.id().to_string()));
    }
    if new.workload().is_none() {
        return Err(PatchError::MissingWorkload(new.id().to_string()));
    }
    let outcome = workload_patch(old.workload(), new.workload())?;
    match &outcome {
        PatchOutcome::Patch(p) => {
            if let Some(kind) = new.workload_kind() {
                debug!(component = %new.id(), %kind, patch = %p, "upgrade patch computed");
                new.set_upgrade_patch(kind, p.clone());
            }
        }
        PatchOutcome::NoChange => {
            metrics::counter!("upgrade_noop_total", 1u64);
            debug!(component = %new.id(), "no upgrade required");
        }
    }
    Ok(outcome)
}

/// Change counts between the projections of two workloads.
pub fn workload_summary(old: &Workload, new: &Workload) -> Result<DiffSummary, PatchError> {
    let empty = Json::Object(Map::new());
    let o = Node::from_json(&project(old)?.unwrap_or_else(|| empty.clone()))?;
    let n = Node::from_json(&project(new)?.unwrap_or(empty))?;
    Ok(summarize(&o, &n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use keel_core::ComponentBase;
    use serde_json::json;

    fn template(image: &str, hostname: Option<&str>) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container { name: "app".into(), image: Some(image.into()), ..Default::default() }],
                hostname: hostname.map(String::from),
                ..Default::default()
            }),
        }
    }

    fn deploy(image: &str, replicas: i32) -> Workload {
        let mut d = Deployment::default();
        d.metadata.name = Some("web".into());
        d.spec = Some(DeploymentSpec { replicas: Some(replicas), template: template(image, None), ..Default::default() });
        Workload::Deployment(Box::new(d))
    }

    fn sts(image: &str, hostname: Option<&str>) -> Workload {
        let mut s = StatefulSet::default();
        s.metadata.name = Some("db".into());
        s.spec = Some(StatefulSetSpec {
            replicas: Some(1),
            template: template(image, hostname),
            update_strategy: Some(StatefulSetUpdateStrategy { type_: Some("RollingUpdate".into()), ..Default::default() }),
            ..Default::default()
        });
        Workload::StatefulSet(Box::new(s))
    }

    #[test]
    fn identical_projections_yield_no_change() {
        assert_eq!(workload_patch(&deploy("a:1", 2), &deploy("a:1", 2)).unwrap(), PatchOutcome::NoChange);
    }

    #[test]
    fn image_change_patches_only_containers() {
        let PatchOutcome::Patch(p) = workload_patch(&deploy("a:1", 2), &deploy("a:2", 2)).unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(p, json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "a:2"}]}}}}));
    }

    #[test]
    fn replicas_change_is_a_scalar_patch() {
        let PatchOutcome::Patch(p) = workload_patch(&deploy("a:1", 2), &deploy("a:1", 3)).unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(p, json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn removed_hostname_is_zeroed() {
        let PatchOutcome::Patch(p) = workload_patch(&sts("db:1", Some("h0")), &sts("db:1", None)).unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(p, json!({"spec": {"template": {"spec": {"hostname": ""}}}}));
    }

    #[test]
    fn update_strategy_only_projected_for_statefulsets() {
        let p = project(&sts("db:1", None)).unwrap().unwrap();
        assert!(p["spec"].get("updateStrategy").is_some());
        let p = project(&deploy("a:1", 1)).unwrap().unwrap();
        assert!(p["spec"].get("strategy").is_none());
    }

    #[test]
    fn kind_change_is_rejected() {
        let err = workload_patch(&deploy("a:1", 1), &sts("a:1", None)).unwrap_err();
        assert!(matches!(err, PatchError::KindMismatch { .. }));
    }

    #[test]
    fn set_upgrade_patch_stores_payload_on_new_component() {
        let old = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::Deployment))
            .with_workload(deploy("a:1", 1))
            .unwrap();
        let mut new = Component::new(ComponentBase::new("t1", "c1", WorkloadKind::Deployment))
            .with_workload(deploy("a:2", 1))
            .unwrap();
        assert!(matches!(set_upgrade_patch(&old, &mut new).unwrap(), PatchOutcome::Patch(_)));
        assert!(new.upgrade_patch(WorkloadKind::Deployment).is_some());
        assert!(old.upgrade_patch(WorkloadKind::Deployment).is_none());
    }
}
