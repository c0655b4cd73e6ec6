//! Per-tenant CPU/memory totals computed from cached pods.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use keel_core::labels;
use keel_core::quantity::{parse_cpu_millis, parse_memory_bytes};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TenantResource {
    pub cpu_request_millis: i64,
    pub cpu_limit_millis: i64,
    pub memory_request_bytes: i64,
    pub memory_limit_bytes: i64,
    pub pods: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantSnapshot {
    pub epoch: u64,
    pub tenants: BTreeMap<String, TenantResource>,
}

fn finished(p: &Pod) -> bool {
    matches!(p.status.as_ref().and_then(|s| s.phase.as_deref()), Some("Succeeded") | Some("Failed"))
}

fn sum(map: Option<&BTreeMap<String, Quantity>>, key: &str, parse: fn(&str) -> Option<i64>) -> i64 {
    map.and_then(|m| m.get(key)).and_then(|q| parse(&q.0)).unwrap_or(0)
}

/// Tenant key of a pod: its tenant-id label, else its namespace.
pub fn tenant_of(p: &Pod) -> Option<&str> {
    p.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::TENANT_ID))
        .map(String::as_str)
        .or(p.metadata.namespace.as_deref())
}

pub fn aggregate<'a>(pods: impl Iterator<Item = &'a Pod>) -> BTreeMap<String, TenantResource> {
    let mut out: BTreeMap<String, TenantResource> = BTreeMap::new();
    for p in pods.filter(|p| !finished(p)) {
        let Some(tenant) = tenant_of(p) else { continue };
        let entry = out.entry(tenant.to_string()).or_default();
        entry.pods += 1;
        for c in p.spec.iter().flat_map(|s| s.containers.iter()) {
            let Some(res) = c.resources.as_ref() else { continue };
            entry.cpu_request_millis += sum(res.requests.as_ref(), "cpu", parse_cpu_millis);
            entry.cpu_limit_millis += sum(res.limits.as_ref(), "cpu", parse_cpu_millis);
            entry.memory_request_bytes += sum(res.requests.as_ref(), "memory", parse_memory_bytes);
            entry.memory_limit_bytes += sum(res.limits.as_ref(), "memory", parse_memory_bytes);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};

    fn pod(ns: &str, tenant: Option<&str>, cpu: &str, mem: &str, phase: &str) -> Pod {
        let mut p = Pod::default();
        p.metadata.namespace = Some(ns.into());
        if let Some(t) = tenant {
            p.metadata.labels = Some([(labels::TENANT_ID.to_string(), t.to_string())].into());
        }
        let req: BTreeMap<String, Quantity> =
            [("cpu".to_string(), Quantity(cpu.into())), ("memory".to_string(), Quantity(mem.into()))].into();
        p.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".into(),
                resources: Some(ResourceRequirements { requests: Some(req.clone()), limits: Some(req), ..Default::default() }),
                ..Default::default()
            }],
            ..Default::default()
        });
        p.status = Some(PodStatus { phase: Some(phase.into()), ..Default::default() });
        p
    }

    #[test]
    fn tenant_label_wins_over_namespace_and_finished_pods_are_skipped() {
        let pods = vec![
            pod("ns-a", Some("t1"), "500m", "128Mi", "Running"),
            pod("t1", None, "1", "1Gi", "Running"),
            pod("t1", None, "4", "4Gi", "Succeeded"),
        ];
        let totals = aggregate(pods.iter());
        let t1 = totals["t1"];
        assert_eq!(t1.pods, 2);
        assert_eq!(t1.cpu_request_millis, 1500);
        assert_eq!(t1.memory_limit_bytes, 134_217_728 + 1_073_741_824);
        assert!(!totals.contains_key("ns-a"));
    }
}
