//! Keel core types: the component model, status derivation, engine config
//! and the per-operation logger sink.

#![forbid(unsafe_code)]

pub mod component;
pub mod config;
pub mod logger;
pub mod quantity;
pub mod status;

pub use component::{
    labels, CacheKey, Component, ComponentBase, ModelError, ServiceType, Workload, WorkloadKind,
};
pub use config::EngineConfig;
pub use logger::{LogEntry, LogLevel, MemoryLogger, OperationLogger, StepStatus, TracingLogger};
pub use status::ComponentStatus;

pub mod prelude {
    pub use super::{
        CacheKey, Component, ComponentBase, ComponentStatus, EngineConfig, OperationLogger,
        StepStatus, Workload, WorkloadKind,
    };
}
