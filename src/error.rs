//! Error types for the GPU Fleet Operator
//!
//! Provides structured error types for the reconciliation engine, the
//! resource store adapters, workload probes and configuration loading.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A component was used before its collaborators were wired in
    #[error("Missing dependency: {0} was not configured")]
    MissingDependency(&'static str),

    // =========================================================================
    // Kubernetes / Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-lock rejection: the write was based on a stale resourceVersion
    #[error("Resource conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Probe Errors
    // =========================================================================
    #[error("Workload probe failed: {workload} - {reason}")]
    Probe { workload: String, reason: String },

    #[error("Workload probe timed out: {workload}")]
    ProbeTimeout { workload: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Several independent operations failed; all of them are kept
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("Label parse error: {0}")]
    LabelParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

/// Requeue delay after an optimistic-lock conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(5);

impl Error {
    /// Map a kube client error for a named resource onto the store taxonomy.
    ///
    /// HTTP 409 splits into `Conflict` (stale resourceVersion) and
    /// `ResourceExists` (create raced with another writer); 404 becomes
    /// `ResourceNotFound`.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    /// Collapse a list of independent failures into a single result
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Conflict { .. } | Error::ResourceExists { .. } => {
                ErrorAction::RequeueAfter(CONFLICT_REQUEUE)
            }

            // Probe timeouts are expected while pods start
            Error::ProbeTimeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(15)),

            // Configuration and wiring errors - don't retry automatically
            Error::Configuration(_)
            | Error::DurationParse(_)
            | Error::LabelParse(_)
            | Error::MissingDependency(_) => ErrorAction::NoRequeue,

            Error::Aggregate(errors) => {
                if errors.iter().all(|e| !e.is_retryable()) {
                    ErrorAction::NoRequeue
                } else {
                    ErrorAction::RequeueWithBackoff
                }
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::ResourceExists { .. })
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
