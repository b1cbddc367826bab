//! Common types for the Seldon operator: CRDs, configuration, errors and utilities

#![deny(missing_docs)]

pub mod annotations;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod labels;
pub mod naming;
pub mod telemetry;

pub use error::{Error, FieldError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "seldon-controller";

/// Default HTTPS port of the admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Mount path of the pod-metadata (downward API) volume
pub const PODINFO_MOUNT_PATH: &str = "/etc/podinfo";

/// Name of the pod-metadata volume
pub const PODINFO_VOLUME: &str = "seldon-podinfo";

/// Where provisioned model artifacts are mounted inside containers
pub const MODEL_MOUNT_PATH: &str = "/mnt/models";
