//! Wait engine: deadline-bounded, cancellable polling of the state cache.
//!
//! Every wait ticks at a tenth of its deadline. Each tick re-derives the
//! predicate from the cache; every third tick reads through the object index
//! first. Cancellation wins over an elapsed deadline, which wins over a tick.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use keel_core::logger::step;
use keel_core::{Component, OperationLogger, StepStatus};
use keel_store::Store;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WaitError;

const PER_REPLICA: u64 = 40;

fn probe_delay(c: &Component) -> u64 { c.probe_initial_delay().max(0) as u64 }

fn replicas(n: i32) -> u64 { n.max(0) as u64 }

/// `max(floor, (probe delay + 40s) × replicas)`.
pub fn start_timeout(c: &Component, floor: Duration) -> Duration {
    floor.max(Duration::from_secs((probe_delay(c) + PER_REPLICA) * replicas(c.replicas())))
}

/// `max(floor, 40s × replicas)`, using the replica count the cache holds.
pub fn stop_timeout(cached_replicas: i32, floor: Duration) -> Duration {
    floor.max(Duration::from_secs(PER_REPLICA * replicas(cached_replicas)))
}

/// `max(floor, (40s + probe delay) × 2 × replicas)`.
pub fn upgrade_timeout(c: &Component, cached_replicas: i32, floor: Duration) -> Duration {
    floor.max(Duration::from_secs((PER_REPLICA + probe_delay(c)) * 2 * replicas(cached_replicas)))
}

fn pod_ready(p: &Pod) -> bool {
    p.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// First pod condition currently false, rendered for the operation log.
fn first_false_condition(pods: &[Pod]) -> Option<String> {
    pods.iter().find_map(|p| {
        let cond = p.status.as_ref()?.conditions.as_ref()?.iter().find(|c| c.status == "False")?;
        let pod = p.metadata.name.as_deref().unwrap_or_default();
        let why = cond.reason.as_deref().or(cond.message.as_deref()).unwrap_or_default();
        Some(format!("pod {pod} {} is false {why}", cond.type_).trim_end().to_string())
    })
}

fn progress(logger: &dyn OperationLogger, c: Option<&Component>, what: &str) {
    let Some(c) = c else {
        logger.info(&format!("waiting for {what}: component not cached"), step::RUNTIME, StepStatus::Running);
        return;
    };
    let ready = c.pods().iter().filter(|p| pod_ready(p)).count();
    let not_ready = c.pods().len() - ready;
    let mut msg = format!("waiting for {what}: {ready} pods ready, {not_ready} not ready");
    if let Some(cond) = first_false_condition(c.pods()) {
        msg.push_str("; ");
        msg.push_str(&cond);
    }
    logger.info(&msg, step::RUNTIME, StepStatus::Running);
}

/// One wait: which component, how long, and what the caller is waiting for.
pub struct Wait<'a> {
    pub store: &'a Store,
    pub cancel: &'a CancellationToken,
    pub logger: &'a dyn OperationLogger,
    pub id: &'a str,
    pub timeout: Duration,
}

impl Wait<'_> {
    /// Poll until `done` holds for the cached component (or its absence).
    pub async fn until(&self, what: &'static str, done: impl Fn(Option<&Component>) -> bool) -> Result<(), WaitError> {
        let period = (self.timeout / 10).max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(component = %self.id, what, "wait cancelled");
                    return Err(WaitError::Cancelled);
                }
                _ = &mut deadline => {
                    metrics::counter!("wait_timeouts_total", 1u64, "what" => what);
                    warn!(component = %self.id, what, timeout = ?self.timeout, "wait timed out");
                    return Err(WaitError::Timeout { waited: self.timeout, what });
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    let c = if ticks % 3 == 0 {
                        self.store.update_and_get_component(self.id)
                    } else {
                        self.store.get_component(self.id)
                    };
                    if done(c.as_ref()) {
                        return Ok(());
                    }
                    progress(self.logger, c.as_ref(), what);
                }
            }
        }
    }

    pub async fn ready(&self) -> Result<(), WaitError> {
        self.until("ready", |c| c.is_some_and(Component::ready)).await
    }

    pub async fn stopped(&self) -> Result<(), WaitError> {
        self.until("stop", |c| c.map_or(true, Component::is_closed)).await
    }

    pub async fn upgraded(&self) -> Result<(), WaitError> {
        self.until("upgrade", |c| c.is_some_and(Component::upgrade_complete)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Probe};
    use keel_core::{ComponentBase, MemoryLogger, Workload, WorkloadKind};

    const FLOOR: Duration = Duration::from_secs(40);

    fn component(replicas: i32, delay: Option<i32>, ready: i32) -> Component {
        let mut base = ComponentBase::new("t1", "c1", WorkloadKind::Deployment);
        base.replicas = replicas;
        let mut d = Deployment::default();
        d.metadata.name = Some("web".into());
        d.metadata.resource_version = Some("1".into());
        d.spec = Some(DeploymentSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".into(),
                        readiness_probe: delay.map(|d| Probe { initial_delay_seconds: Some(d), ..Default::default() }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        });
        d.status = Some(DeploymentStatus { ready_replicas: Some(ready), ..Default::default() });
        Component::new(base).with_workload(Workload::Deployment(Box::new(d))).unwrap()
    }

    #[test]
    fn start_timeout_scales_with_probe_delay_and_replicas() {
        assert_eq!(start_timeout(&component(2, Some(5), 0), FLOOR), Duration::from_secs(90));
        assert_eq!(start_timeout(&component(1, None, 0), FLOOR), FLOOR);
        assert_eq!(start_timeout(&component(0, Some(30), 0), FLOOR), FLOOR);
    }

    #[test]
    fn stop_and_upgrade_timeouts_are_floored() {
        assert_eq!(stop_timeout(0, FLOOR), FLOOR);
        assert_eq!(stop_timeout(3, FLOOR), Duration::from_secs(120));
        assert_eq!(upgrade_timeout(&component(2, Some(10), 0), 2, FLOOR), Duration::from_secs(200));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_component_returns_on_first_tick() {
        let store = Store::new();
        store.register_component(component(1, None, 1));
        let cancel = CancellationToken::new();
        let logger = MemoryLogger::new();
        let w = Wait { store: &store, cancel: &cancel, logger: &logger, id: "c1", timeout: FLOOR };
        w.ready().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unready_component_times_out() {
        let store = Store::new();
        store.register_component(component(2, None, 1));
        let cancel = CancellationToken::new();
        let logger = MemoryLogger::new();
        let w = Wait { store: &store, cancel: &cancel, logger: &logger, id: "c1", timeout: FLOOR };
        let err = w.ready().await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout { waited, .. } if waited == FLOOR));
        assert!(logger.contains("waiting for ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_seen_only_in_the_index_arrives_on_a_read_through_tick() {
        let store = std::sync::Arc::new(Store::new());
        // desired and not yet observed, as a start registers it
        let mut c = component(1, None, 0);
        let mut desired = c.deployment().cloned().unwrap();
        desired.metadata.resource_version = None;
        c.set_deployment(desired);
        store.register_component(c);
        let feeder = store.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            // no component label: only the object index sees it
            let mut d = component(1, None, 1).deployment().cloned().unwrap();
            d.metadata.namespace = Some("t1".into());
            d.metadata.resource_version = Some("2".into());
            feeder.on_update(keel_kubehub::KubeObject::from(d));
        });
        let cancel = CancellationToken::new();
        let logger = MemoryLogger::new();
        let began = tokio::time::Instant::now();
        let w = Wait { store: &*store, cancel: &cancel, logger: &logger, id: "c1", timeout: FLOOR };
        w.ready().await.unwrap();
        // ticks every 4s; 12s and 16s read the stale component, 20s reads through
        let waited = began.elapsed();
        assert!(waited >= Duration::from_secs(20) && waited < Duration::from_secs(21), "{waited:?}");
        assert!(logger.contains("waiting for ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_elapsed_deadline() {
        let store = Store::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let logger = MemoryLogger::new();
        let w = Wait { store: &store, cancel: &cancel, logger: &logger, id: "c1", timeout: Duration::ZERO };
        assert_eq!(w.ready().await.unwrap_err(), WaitError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_component_counts_as_stopped() {
        let store = Store::new();
        let cancel = CancellationToken::new();
        let logger = MemoryLogger::new();
        let w = Wait { store: &store, cancel: &cancel, logger: &logger, id: "gone", timeout: FLOOR };
        w.stopped().await.unwrap();
    }
}
