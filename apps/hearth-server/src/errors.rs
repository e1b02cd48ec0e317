use hearth_runtime::ContainerError;

/// Error taxonomy for the operations exposed to controllers. Variants map
/// onto distinct caller behavior: validation and not-found reject before
/// any state mutation, preflight/runtime leave the service in `error`,
/// and already-in-progress refers the caller to the existing work.
#[derive(thiserror::Error, Debug)]
pub enum OpsError {
    #[error("{0}")]
    Validation(String),
    #[error("preflight failed: {0}")]
    Preflight(String),
    #[error("runtime failure: {0}")]
    Runtime(String),
    #[error("already in progress: {0}")]
    AlreadyInProgress(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ContainerError> for OpsError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::InvalidSpec(msg) => OpsError::Validation(msg),
            other => OpsError::Runtime(other.to_string()),
        }
    }
}
