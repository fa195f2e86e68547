//! Error Types
//!
//! Configuration errors fail construction, backend errors describe a single
//! directory call, and discovery errors are what the host runtime must react to.

use std::time::Duration;
use thiserror::Error;

/// Backend operations named in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enumerate,
    Register,
    Deregister,
    RefreshLiveness,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Enumerate => "enumerate",
            Operation::Register => "register",
            Operation::Deregister => "deregister",
            Operation::RefreshLiveness => "refresh_liveness",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid or incomplete settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "service_check_ttl ({service_check_ttl:?}) must be greater than alive_interval ({alive_interval:?}) \
         and less than alive_timeout ({alive_timeout:?})"
    )]
    InvalidTiming {
        alive_interval: Duration,
        service_check_ttl: Duration,
        alive_timeout: Duration,
    },
    #[error("missing required setting `{0}`")]
    MissingField(&'static str),
    #[error("setting `{key}` must be {requirement}")]
    OutOfRange {
        key: &'static str,
        requirement: &'static str,
    },
    #[error("invalid value {value:?} for `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failure of a single directory call
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend does not support {operation}")]
    NotSupported { operation: Operation },
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("directory rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn not_supported(operation: Operation) -> Self {
        BackendError::NotSupported { operation }
    }
}

/// Failures surfaced to the host runtime
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("backend `{backend}` cannot {operation}")]
    CapabilityMissing {
        backend: String,
        operation: Operation,
    },
    #[error("failed to register after {attempts} attempts: {source}")]
    JoinFailed {
        attempts: u32,
        #[source]
        source: BackendError,
    },
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("discovery service is not ready")]
    NotReady,
}
