//! Kubernetes Events emitted on SeldonDeployments
//!
//! The reconciler describes what happened as a [`DeploymentEvent`]; the
//! publisher turns it into a `kube::runtime::events::Event` visible through
//! `kubectl describe sdep`. Publishing is fire-and-forget: a failed write is
//! logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Event reason strings, shown in the REASON column
pub mod reasons {
    /// Owned resources were created or updated
    pub const UPDATED: &str = "Updated";
    /// A stale owned resource was removed
    pub const DELETED_STALE: &str = "DeletedStale";
    /// The declaration failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Reconciliation failed
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Garbage collection of stale resources
    pub const DELETE: &str = "Delete";
}

/// Something worth telling the owner of a SeldonDeployment about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// A pass created or updated owned resources
    Updated {
        /// Declaration name
        name: String,
        /// Number of create, update or replace calls made
        writes: usize,
    },
    /// An owned resource no longer in the desired set was deleted
    DeletedStale {
        /// Kind of the deleted resource
        kind: String,
        /// Name of the deleted resource
        name: String,
    },
    /// The declaration is invalid; carries the joined causes
    ValidationFailed(String),
    /// A pass failed for any other reason
    InternalError(String),
}

impl DeploymentEvent {
    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Updated { .. } => reasons::UPDATED,
            Self::DeletedStale { .. } => reasons::DELETED_STALE,
            Self::ValidationFailed(_) => reasons::VALIDATION_FAILED,
            Self::InternalError(_) => reasons::INTERNAL_ERROR,
        }
    }

    /// Action taken when the event was raised
    pub fn action(&self) -> &'static str {
        match self {
            Self::DeletedStale { .. } => actions::DELETE,
            _ => actions::RECONCILE,
        }
    }

    /// Failures are warnings, everything else is normal
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ValidationFailed(_) | Self::InternalError(_) => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            Self::Updated { name, writes } => {
                format!("Updated SeldonDeployment {name:?} ({writes} resource writes)")
            }
            Self::DeletedStale { kind, name } => format!("Deleted {kind} {name:?}"),
            Self::ValidationFailed(message) | Self::InternalError(message) => message.clone(),
        }
    }

    /// The kube event to record
    pub fn to_event(&self) -> Event {
        Event {
            type_: self.event_type(),
            reason: self.reason().to_string(),
            note: Some(self.note()),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

/// Sink for deployment events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against the object `target` refers to
    async fn publish(&self, target: &ObjectReference, event: DeploymentEvent);
}

/// Publisher backed by the cluster's events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as the instance when
    /// running in-cluster
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, target: &ObjectReference, event: DeploymentEvent) {
        if let Err(e) = self.recorder.publish(&event.to_event(), target).await {
            warn!(
                reason = event.reason(),
                object = ?target.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops everything, for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _target: &ObjectReference, _event: DeploymentEvent) {}
}
