//! Keel kubehub: orchestrator client, watchers and the DNS collaborator.

#![forbid(unsafe_code)]

pub mod dns;
mod error;
pub mod mock;
mod object;
mod orchestrator;
pub mod watch;

pub use dns::{DnsResolver, StaticDnsResolver};
pub use error::{ClientError, IgnoreAlreadyExists, IgnoreNotFound};
pub use mock::{Call, MockOrchestrator, Verb};
pub use object::{service_monitor_resource, KubeObject, ObjectKey, ObjectKind, SERVICE_MONITOR_CRD};
pub use orchestrator::{KubeOrchestrator, Orchestrator};
pub use watch::{start_watchers, WatchEvent};
