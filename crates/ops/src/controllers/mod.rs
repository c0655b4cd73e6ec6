//! Operation controllers.
//!
//! Every kind is a typed `Operation` over a batch of components. The manager
//! wraps it in a `ControllerHandle` that owns the cancellation token, runs the
//! operation once and reports completion exactly once.

mod apply;
mod export;
mod restart;
mod scale;
mod start;
mod stop;
mod upgrade;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use keel_core::logger::step;
use keel_core::{Component, EngineConfig, OperationLogger, StepStatus};
use keel_kubehub::{DnsResolver, Orchestrator};
use keel_store::Store;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::manager::Shared;
use crate::wait::Wait;

pub use export::ExportOptions;

/// What a controller does. Closed set; string front ends go through `FromStr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Start,
    Stop,
    Restart,
    Scale,
    Upgrade,
    ApplyRule,
    ApplyPluginConfig,
    RefreshAutoscaler,
    Delete,
    Export(ExportOptions),
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::Start => "start",
            ControllerKind::Stop => "stop",
            ControllerKind::Restart => "restart",
            ControllerKind::Scale => "scale",
            ControllerKind::Upgrade => "upgrade",
            ControllerKind::ApplyRule => "apply_rule",
            ControllerKind::ApplyPluginConfig => "apply_plugin_config",
            ControllerKind::RefreshAutoscaler => "refresh_autoscaler",
            ControllerKind::Delete => "delete",
            ControllerKind::Export(_) => "export",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ControllerKind {
    type Err = ControllerError;

    /// Export parsed from a bare name carries default options.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "start" => ControllerKind::Start,
            "stop" => ControllerKind::Stop,
            "restart" => ControllerKind::Restart,
            "scale" | "scaling" => ControllerKind::Scale,
            "upgrade" => ControllerKind::Upgrade,
            "apply_rule" => ControllerKind::ApplyRule,
            "apply_plugin_config" => ControllerKind::ApplyPluginConfig,
            "refresh_autoscaler" | "refresh_hpa" => ControllerKind::RefreshAutoscaler,
            "delete" => ControllerKind::Delete,
            "export" => ControllerKind::Export(ExportOptions::default()),
            _ => return Err(ControllerError::NoSuchController(s.to_string())),
        })
    }
}

/// Everything an operation needs, bound at construction.
pub struct OpContext {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub store: Arc<Store>,
    pub config: Arc<EngineConfig>,
    pub dns: Arc<dyn DnsResolver>,
    pub cancel: CancellationToken,
    pub controller_id: String,
}

impl OpContext {
    pub(crate) fn wait<'a>(&'a self, c: &'a Component, timeout: Duration) -> Wait<'a> {
        Wait { store: &self.store, cancel: &self.cancel, logger: c.logger().as_ref(), id: c.id(), timeout }
    }

    /// Step trace; components on the debug list get it at info.
    pub(crate) fn trace(&self, c: &Component, msg: &str) {
        if self.config.is_debug_component(c.id()) {
            info!(controller = %self.controller_id, component = %c.id(), "{msg}");
        } else {
            debug!(controller = %self.controller_id, component = %c.id(), "{msg}");
        }
    }
}

#[async_trait]
pub(crate) trait Operation: Send + Sync {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError>;
}

/// Run `f` for every component concurrently, report each outcome to the
/// component's logger, and return the first failure once all are done.
pub(crate) async fn run_each<'a, F, Fut>(
    cx: &'a OpContext,
    components: &'a [Component],
    verb: &'static str,
    f: F,
) -> Result<(), ControllerError>
where
    F: Fn(&'a Component) -> Fut,
    Fut: Future<Output = Result<(), ControllerError>> + 'a,
{
    let results = join_all(components.iter().map(|c| {
        let fut = f(c);
        async move {
            c.logger().info(&format!("begin {verb} component {}", c.alias()), step::RUNTIME, StepStatus::Starting);
            let res = fut.await;
            report(cx, c, verb, &res);
            res
        }
    }))
    .await;
    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

fn report(cx: &OpContext, c: &Component, verb: &'static str, res: &Result<(), ControllerError>) {
    let logger = c.logger();
    match res {
        Ok(()) => logger.info(&format!("{verb} component {} success", c.alias()), step::LAST, StepStatus::Success),
        Err(e) if e.is_timeout() => {
            logger.error(&format!("{verb} component {} timeout", c.alias()), step::CALLBACK, StepStatus::Timeout)
        }
        Err(e) => {
            metrics::counter!("component_ops_failed_total", 1u64, "kind" => verb);
            warn!(controller = %cx.controller_id, component = %c.id(), error = %e, "{verb} failed");
            logger.error(&format!("{verb} component {} failure: {e}", c.alias()), step::CALLBACK, StepStatus::Failure)
        }
    }
}

/// Handler table from kind to typed operation.
pub(crate) fn build(kind: &ControllerKind, components: Vec<Component>) -> Box<dyn Operation> {
    match kind {
        ControllerKind::Start => Box::new(start::Start { components }),
        ControllerKind::Stop => Box::new(stop::Stop { components }),
        ControllerKind::Restart => Box::new(restart::Restart { components }),
        ControllerKind::Scale => Box::new(scale::Scale { components }),
        ControllerKind::Upgrade => Box::new(upgrade::Upgrade { components }),
        ControllerKind::ApplyRule => Box::new(apply::ApplyRule { components }),
        ControllerKind::ApplyPluginConfig => Box::new(apply::ApplyPluginConfig { components }),
        ControllerKind::RefreshAutoscaler => Box::new(apply::RefreshAutoscaler { components }),
        ControllerKind::Delete => Box::new(stop::Delete { components }),
        ControllerKind::Export(opts) => Box::new(export::Export { components, options: opts.clone() }),
    }
}

/// A controller admitted by the manager.
#[async_trait]
pub trait Controller: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> &ControllerKind;

    /// Run the operation to completion. The manager's completion callback
    /// fires exactly once, after every component finished.
    async fn begin(&self) -> Result<(), ControllerError>;

    /// Cancel pending waits; running orchestrator calls finish.
    fn stop(&self);
}

pub(crate) struct ControllerHandle {
    pub(crate) kind: ControllerKind,
    pub(crate) op: Box<dyn Operation>,
    pub(crate) cx: OpContext,
    pub(crate) shared: Arc<Shared>,
    pub(crate) begun: AtomicBool,
    pub(crate) logger: Arc<dyn OperationLogger>,
}

#[async_trait]
impl Controller for ControllerHandle {
    fn id(&self) -> &str { &self.cx.controller_id }

    fn kind(&self) -> &ControllerKind { &self.kind }

    async fn begin(&self) -> Result<(), ControllerError> {
        if self.begun.swap(true, Ordering::SeqCst) {
            warn!(controller = %self.id(), "begin called twice; ignoring");
            return Ok(());
        }
        let started = Instant::now();
        metrics::counter!("controllers_started_total", 1u64, "kind" => self.kind.as_str());
        info!(controller = %self.id(), kind = %self.kind, "controller begin");
        let res = self.op.run(&self.cx).await;
        match &res {
            Ok(()) => self.logger.info(&format!("{} finished", self.kind), step::LAST, StepStatus::Success),
            Err(e) => self.logger.error(&format!("{} finished with error: {e}", self.kind), step::LAST, StepStatus::Failure),
        }
        self.shared.callback(self.id(), started, res.as_ref().err());
        res
    }

    fn stop(&self) {
        debug!(controller = %self.id(), "stop requested");
        self.cx.cancel.cancel();
    }
}
