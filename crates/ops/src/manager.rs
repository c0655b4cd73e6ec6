//! Controller admission and lifecycle.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use keel_core::{Component, EngineConfig, OperationLogger};
use keel_kubehub::{DnsResolver, Orchestrator};
use keel_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controllers::{build, Controller, ControllerHandle, ControllerKind, OpContext};
use crate::error::ControllerError;

/// Invoked once per finished controller with its id and outcome.
pub type CompletionHook = Arc<dyn Fn(&str, Option<&ControllerError>) + Send + Sync>;

struct Active {
    kind: &'static str,
    cancel: CancellationToken,
}

/// State shared between the manager and the handles it hands out.
pub(crate) struct Shared {
    active: Mutex<HashMap<String, Active>>,
    hook: Option<CompletionHook>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<String, Active>> { self.active.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Releases the controller's slot. Only the first call per id has effect.
    pub(crate) fn callback(&self, id: &str, started: Instant, err: Option<&ControllerError>) {
        let (removed, remaining) = {
            let mut active = self.active();
            let removed = active.remove(id);
            (removed, active.len())
        };
        let Some(entry) = removed else {
            warn!(controller = %id, "completion for unknown controller");
            return;
        };
        let kind = entry.kind;
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::gauge!("controllers_active", remaining as f64);
        metrics::histogram!("controller_duration_ms", ms, "kind" => kind);
        match err {
            None => info!(controller = %id, kind, elapsed_ms = ms as u64, "controller finished"),
            Some(e) => warn!(controller = %id, kind, elapsed_ms = ms as u64, error = %e, "controller finished with error"),
        }
        if let Some(hook) = &self.hook {
            hook(id, err);
        }
    }
}

pub struct ControllerManager {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    dns: Arc<dyn DnsResolver>,
    shared: Arc<Shared>,
}

impl ControllerManager {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, store: Arc<Store>, config: Arc<EngineConfig>, dns: Arc<dyn DnsResolver>) -> Self {
        Self::with_hook(orchestrator, store, config, dns, None)
    }

    pub fn with_hook(
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<Store>,
        config: Arc<EngineConfig>,
        dns: Arc<dyn DnsResolver>,
        hook: Option<CompletionHook>,
    ) -> Self {
        let shared = Arc::new(Shared { active: Mutex::new(HashMap::new()), hook });
        Self { orchestrator, store, config, dns, shared }
    }

    pub fn store(&self) -> &Arc<Store> { &self.store }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn active_count(&self) -> usize { self.shared.active().len() }

    fn reject(reason: &'static str, err: ControllerError) -> ControllerError {
        metrics::counter!("controllers_rejected_total", 1u64, "reason" => reason);
        warn!(reason, error = %err, "controller rejected");
        err
    }

    /// Admit a controller for `components`. Rejects while the cache is still
    /// syncing and when the active limit is reached; callers retry later.
    pub fn get_controller(
        &self,
        kind: ControllerKind,
        logger: Arc<dyn OperationLogger>,
        mut components: Vec<Component>,
    ) -> Result<Arc<dyn Controller>, ControllerError> {
        if !self.store.ready() {
            return Err(Self::reject("store_not_ready", ControllerError::StoreNotReady));
        }
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut active = self.shared.active();
            if active.len() >= self.config.max_controllers {
                drop(active);
                return Err(Self::reject("too_many", ControllerError::TooManyControllers(self.config.max_controllers)));
            }
            active.insert(id.clone(), Active { kind: kind.as_str(), cancel: cancel.clone() });
            metrics::gauge!("controllers_active", active.len() as f64);
        }
        for c in &mut components {
            c.set_logger(logger.clone());
        }
        debug!(controller = %id, %kind, components = components.len(), "controller admitted");

        let cx = OpContext {
            orchestrator: self.orchestrator.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            dns: self.dns.clone(),
            cancel,
            controller_id: id,
        };
        Ok(Arc::new(ControllerHandle {
            op: build(&kind, components),
            kind,
            cx,
            shared: self.shared.clone(),
            begun: AtomicBool::new(false),
            logger,
        }))
    }

    /// String-keyed entry point; unknown names are `NoSuchController`.
    pub fn get_controller_by_name(
        &self,
        kind: &str,
        logger: Arc<dyn OperationLogger>,
        components: Vec<Component>,
    ) -> Result<Arc<dyn Controller>, ControllerError> {
        self.get_controller(kind.parse()?, logger, components)
    }

    /// Admit and spawn `begin` on the runtime. Returns the controller id.
    pub fn start_controller(
        &self,
        kind: ControllerKind,
        logger: Arc<dyn OperationLogger>,
        components: Vec<Component>,
    ) -> Result<String, ControllerError> {
        let controller = self.get_controller(kind, logger, components)?;
        let id = controller.id().to_string();
        tokio::spawn(async move {
            // Outcome already went through the completion callback.
            let _ = controller.begin().await;
        });
        Ok(id)
    }

    /// Cancel a running controller's waits. False when the id is not active.
    pub fn stop_controller(&self, id: &str) -> bool {
        match self.shared.active().get(id) {
            Some(a) => {
                info!(controller = %id, kind = a.kind, "stopping controller");
                a.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ComponentBase, MemoryLogger, WorkloadKind};
    use keel_kubehub::{MockOrchestrator, StaticDnsResolver};

    fn manager(max: usize, ready: bool) -> ControllerManager {
        let store = Arc::new(Store::new());
        if ready {
            store.mark_all_synced();
        }
        let cfg = EngineConfig { max_controllers: max, ..Default::default() };
        ControllerManager::new(Arc::new(MockOrchestrator::new()), store, Arc::new(cfg), Arc::new(StaticDnsResolver::default()))
    }

    fn comp(id: &str) -> Component { Component::new(ComponentBase::new("t1", id, WorkloadKind::Deployment)) }

    #[test]
    fn unsynced_store_rejects() {
        let m = manager(2, false);
        let err = m.get_controller(ControllerKind::Stop, Arc::new(MemoryLogger::new()), vec![comp("a")]).err();
        assert!(matches!(err, Some(ControllerError::StoreNotReady)));
    }

    #[test]
    fn limit_rejects_until_a_slot_frees() {
        let m = manager(1, true);
        let logger: Arc<dyn OperationLogger> = Arc::new(MemoryLogger::new());
        let first = m.get_controller(ControllerKind::Stop, logger.clone(), vec![comp("a")]).unwrap();
        let err = m.get_controller(ControllerKind::Stop, logger.clone(), vec![comp("b")]).err();
        assert!(matches!(err, Some(ControllerError::TooManyControllers(1))));
        m.shared.callback(first.id(), Instant::now(), None);
        m.shared.callback(first.id(), Instant::now(), None);
        assert_eq!(m.active_count(), 0);
        assert!(m.get_controller(ControllerKind::Stop, logger, vec![comp("b")]).is_ok());
    }

    #[test]
    fn unknown_kind_is_no_such_controller() {
        let m = manager(1, true);
        let err = m.get_controller_by_name("teleport", Arc::new(MemoryLogger::new()), vec![]).err();
        assert!(matches!(err, Some(ControllerError::NoSuchController(k)) if k == "teleport"));
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn controller_ids_are_unique() {
        let m = manager(10, true);
        let logger: Arc<dyn OperationLogger> = Arc::new(MemoryLogger::new());
        let a = m.get_controller(ControllerKind::Stop, logger.clone(), vec![]).unwrap();
        let b = m.get_controller(ControllerKind::Stop, logger, vec![]).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(m.stop_controller(a.id()));
        assert!(!m.stop_controller("missing"));
    }
}
