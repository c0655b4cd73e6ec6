use std::time::Duration;

use keel_apply::PatchError;
use keel_core::WorkloadKind;
use keel_kubehub::ClientError;

/// Wait outcomes other than success. Neither is a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: &'static str },
    #[error("wait cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolvable dependencies among {stuck:?}")]
pub struct SequenceError {
    pub stuck: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no such controller kind: {0}")]
    NoSuchController(String),
    #[error("too many active controllers ({0}); retry later")]
    TooManyControllers(usize),
    #[error("state cache has not finished its initial sync")]
    StoreNotReady,
    #[error("component {0} is not closed")]
    AlreadyRunning(String),
    #[error("component {0} is not running")]
    NotRunning(String),
    #[error("component {id} changed workload kind from {old} to {new}")]
    KindChanged { id: String, old: WorkloadKind, new: WorkloadKind },
    #[error("{context}: {source}")]
    Client {
        context: String,
        #[source]
        source: ClientError,
    },
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("export: {0}")]
    Export(String),
}

impl ControllerError {
    pub fn is_timeout(&self) -> bool { matches!(self, ControllerError::Wait(WaitError::Timeout { .. })) }

    pub fn is_cancelled(&self) -> bool { matches!(self, ControllerError::Wait(WaitError::Cancelled)) }
}

/// Attaches a description of the failed call to a client error.
pub(crate) trait ClientContext<T> {
    fn context(self, what: impl FnOnce() -> String) -> Result<T, ControllerError>;
}

impl<T> ClientContext<T> for Result<T, ClientError> {
    fn context(self, what: impl FnOnce() -> String) -> Result<T, ControllerError> {
        self.map_err(|source| ControllerError::Client { context: what(), source })
    }
}
