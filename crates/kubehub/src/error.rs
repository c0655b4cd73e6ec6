use crate::object::ObjectKind;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: ObjectKind, namespace: String, name: String },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: ObjectKind, namespace: String, name: String },
    #[error("conflict on {kind} {namespace}/{name}: {message}")]
    Conflict { kind: ObjectKind, namespace: String, name: String, message: String },
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn not_found(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        ClientError::NotFound { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn already_exists(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        ClientError::AlreadyExists { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    /// Classify a kube client error against the object it targeted.
    pub fn from_kube(err: kube::Error, kind: ObjectKind, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::not_found(kind, namespace, name),
                409 if ae.reason == "AlreadyExists" => Self::already_exists(kind, namespace, name),
                409 => ClientError::Conflict {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    message: ae.message,
                },
                code => ClientError::Api { code, reason: ae.reason, message: ae.message },
            },
            kube::Error::SerdeError(e) => ClientError::Serialization(e),
            other => ClientError::Transport(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound { .. }) }

    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists { .. }) }
}

/// Maps not-found to `Ok(None)`; everything else passes through.
pub trait IgnoreNotFound<T> {
    fn ignore_not_found(self) -> Result<Option<T>, ClientError>;
}

impl<T> IgnoreNotFound<T> for Result<T, ClientError> {
    fn ignore_not_found(self) -> Result<Option<T>, ClientError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Maps already-exists to `Ok(None)`; everything else passes through.
pub trait IgnoreAlreadyExists<T> {
    fn ignore_already_exists(self) -> Result<Option<T>, ClientError>;
}

impl<T> IgnoreAlreadyExists<T> for Result<T, ClientError> {
    fn ignore_already_exists(self) -> Result<Option<T>, ClientError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_already_exists() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
