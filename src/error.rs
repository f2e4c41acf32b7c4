use thiserror::Error;

use crate::gvr::Gvr;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures surfaced by the watch factory, the port-forward grammar and the
/// tunnel registry. None of them is retried automatically.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{verbs:?} access denied on resource {namespace:?}:{gvr}")]
    AccessDenied {
        namespace: String,
        gvr: Gvr,
        verbs: Vec<String>,
    },
    #[error("{gvr} {path:?} not found")]
    NotFound { gvr: Gvr, path: String },
    #[error("no watch registered for resource {0}")]
    NoWatch(Gvr),
    #[error("invalid port-forward specification {0}")]
    InvalidSpec(String),
    #[error("invalid label selector {0:?}")]
    InvalidSelector(String),
    #[error("no port number assigned")]
    NoPortNumber,
    #[error("unable to forward port because pod {path} is not running. Current status={phase}")]
    NotRunning { path: String, phase: String },
    #[error("port {address}:{port} is not available on this host")]
    PortUnavailable {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("port-forward dial failed for {path}: {reason}")]
    DialFailure { path: String, reason: String },
    #[error("port-forward {0} is already active")]
    AlreadyActive(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("failed to decode resource: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EngineError {
    pub fn access_denied(namespace: &str, gvr: &Gvr, verbs: &[&str]) -> Self {
        Self::AccessDenied {
            namespace: namespace.to_string(),
            gvr: gvr.clone(),
            verbs: verbs.iter().map(|verb| verb.to_string()).collect(),
        }
    }

    /// Errors that should leave a view empty with a warning instead of
    /// being reported as a failed refresh.
    pub fn is_access_error(&self) -> bool {
        matches!(self, Self::AccessDenied { .. } | Self::NoWatch(_))
    }
}
