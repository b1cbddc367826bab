//! Error types for the Seldon operator
//!
//! Errors carry enough context to tell configuration mistakes, user
//! validation failures and transient cluster failures apart. The controller's
//! retry policy keys off [`Error::is_retryable`].

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// One cause of a multi-cause validation failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Path of the offending field, e.g. `spec.predictors[0].graph`
    pub path: String,
    /// The offending value, rendered as text
    pub value: String,
    /// Why the value is invalid
    pub reason: String,
}

impl FieldError {
    /// Create a field error
    pub fn new(
        path: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: Invalid value: {:?}: {}", self.path, self.value, self.reason)
    }
}

fn join_causes(causes: &[FieldError]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Main error type for Seldon operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Single validation failure
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.predictors[0].traffic")
        field: Option<String>,
    },

    /// Aggregated validation failure of a whole declaration
    #[error("SeldonDeployment.machinelearning.seldon.io \"{name}\" is invalid: [{}]", join_causes(.causes))]
    Invalid {
        /// Declaration name
        name: String,
        /// Every violation found
        causes: Vec<FieldError>,
    },

    /// Malformed environment or cluster configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's malformed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Desired state could not be synthesized
    #[error("synthesis error for {component}: {message}")]
    Synthesis {
        /// Workload, container or unit being synthesized
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an aggregated validation error
    pub fn invalid(name: impl Into<String>, causes: Vec<FieldError>) -> Self {
        Self::Invalid {
            name: name.into(),
            causes,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a synthesis error for a component
    pub fn synthesis(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Synthesis {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, validation and synthesis errors need a fix to the
    /// declaration or the operator configuration. Kubernetes errors are
    /// retried unless the API server rejected the request outright.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Invalid { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Synthesis { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the API server reported a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Validation causes carried by this error
    pub fn causes(&self) -> &[FieldError] {
        match self {
            Error::Invalid { causes, .. } => causes,
            _ => &[],
        }
    }
}
