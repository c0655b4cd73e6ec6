//! Keel Ops: the operation controllers that converge orchestrator state
//! toward a component's desired spec, the wait engine they block on, the
//! dependency sequencer for batch starts and the manager that admits them.

#![forbid(unsafe_code)]

pub mod controllers;
mod error;
pub mod manager;
mod reconcile;
pub mod sequencer;
pub mod wait;

pub use controllers::{Controller, ControllerKind, ExportOptions, OpContext};
pub use error::{ControllerError, SequenceError, WaitError};
pub use manager::{CompletionHook, ControllerManager};
