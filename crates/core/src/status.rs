//! Component status derivation.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::component::Component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    Running,
    Closed,
    Starting,
    Stopping,
    Abnormal,
    SomeAbnormal,
    Unknown,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Running => "running",
            ComponentStatus::Closed => "closed",
            ComponentStatus::Starting => "starting",
            ComponentStatus::Stopping => "stopping",
            ComponentStatus::Abnormal => "abnormal",
            ComponentStatus::SomeAbnormal => "some_abnormal",
            ComponentStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A container exited non-zero, or restarted after terminating at least once.
pub fn has_terminated_container(pods: &[Pod]) -> bool {
    pods.iter()
        .filter_map(|p| p.status.as_ref())
        .flat_map(|s| s.container_statuses.iter().flatten())
        .any(|cs| {
            let exited = cs
                .state
                .as_ref()
                .and_then(|st| st.terminated.as_ref())
                .is_some_and(|t| t.exit_code != 0);
            let previously = cs.last_state.as_ref().and_then(|st| st.terminated.as_ref()).is_some();
            exited || previously
        })
}

/// Decision table over workload presence, cached pods, ready replicas and
/// terminated containers. First matching row wins.
pub fn derive(c: &Component) -> ComponentStatus {
    if c.is_closed() {
        return ComponentStatus::Closed;
    }
    let pods = c.pods().len() as i64;
    if c.workload().is_none() {
        return if pods > 0 { ComponentStatus::Stopping } else { ComponentStatus::Closed };
    }
    let replicas = i64::from(c.replicas());
    let ready = i64::from(c.ready_replicas());
    if pods < replicas {
        return ComponentStatus::Starting;
    }
    if ready >= replicas {
        return ComponentStatus::Running;
    }
    let terminated = c.has_terminated_container();
    match ready {
        r if r > 0 && terminated => ComponentStatus::SomeAbnormal,
        r if r > 0 => ComponentStatus::Starting,
        0 if terminated => ComponentStatus::Abnormal,
        0 => ComponentStatus::Starting,
        _ => ComponentStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentBase, WorkloadKind};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn component(replicas: i32) -> Component {
        let mut base = ComponentBase::new("t1", "c1", WorkloadKind::Deployment);
        base.replicas = replicas;
        Component::new(base)
    }

    fn observed_deploy(ready: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta { name: Some("web".into()), resource_version: Some("7".into()), ..Default::default() },
            status: Some(DeploymentStatus { ready_replicas: Some(ready), ..Default::default() }),
            ..Default::default()
        }
    }

    fn pod(name: &str, crashed: bool) -> Pod {
        let terminated = crashed.then(|| ContainerState {
            terminated: Some(ContainerStateTerminated { exit_code: 137, ..Default::default() }),
            ..Default::default()
        });
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus { name: "app".into(), state: terminated, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn empty_component_is_closed() {
        assert_eq!(derive(&component(1)), ComponentStatus::Closed);
    }

    #[test]
    fn unobserved_workload_counts_as_closed() {
        let mut c = component(1);
        let mut d = observed_deploy(0);
        d.metadata.resource_version = None;
        c.set_deployment(d);
        assert_eq!(derive(&c), ComponentStatus::Closed);
    }

    #[test]
    fn pods_without_workload_are_stopping() {
        let mut c = component(1);
        c.set_pod(pod("p0", false));
        assert_eq!(derive(&c), ComponentStatus::Stopping);
    }

    #[test]
    fn fewer_pods_than_replicas_is_starting() {
        let mut c = component(3);
        c.set_deployment(observed_deploy(1));
        c.set_pod(pod("p0", false));
        assert_eq!(derive(&c), ComponentStatus::Starting);
    }

    #[test]
    fn ready_workload_is_running() {
        let mut c = component(2);
        c.set_deployment(observed_deploy(2));
        c.set_pod(pod("p0", false));
        c.set_pod(pod("p1", false));
        assert_eq!(derive(&c), ComponentStatus::Running);
    }

    #[test]
    fn partial_ready_with_crash_is_some_abnormal() {
        let mut c = component(2);
        c.set_deployment(observed_deploy(1));
        c.set_pod(pod("p0", false));
        c.set_pod(pod("p1", true));
        assert_eq!(derive(&c), ComponentStatus::SomeAbnormal);
    }

    #[test]
    fn partial_ready_without_crash_is_starting() {
        let mut c = component(2);
        c.set_deployment(observed_deploy(1));
        c.set_pod(pod("p0", false));
        c.set_pod(pod("p1", false));
        assert_eq!(derive(&c), ComponentStatus::Starting);
    }

    #[test]
    fn nothing_ready_with_crash_is_abnormal() {
        let mut c = component(1);
        c.set_deployment(observed_deploy(0));
        c.set_pod(pod("p0", true));
        assert_eq!(derive(&c), ComponentStatus::Abnormal);
        assert!(!c.ready());
    }

    #[test]
    fn clean_exit_is_not_terminated() {
        let mut p = pod("p0", true);
        if let Some(cs) = p.status.as_mut().and_then(|s| s.container_statuses.as_mut()) {
            cs[0].state = Some(ContainerState {
                terminated: Some(ContainerStateTerminated { exit_code: 0, ..Default::default() }),
                ..Default::default()
            });
        }
        assert!(!has_terminated_container(&[p]));
    }
}
