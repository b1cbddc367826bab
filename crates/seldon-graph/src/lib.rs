//! Inference-graph normalization and validation for SeldonDeployments
//!
//! [`normalize`] fills in everything a declaration leaves implicit and
//! resolves orchestrator placement; [`validate`] checks the result and
//! reports every structural violation at once. Both run at admission and
//! again at the start of every reconcile.

#![deny(missing_docs)]

pub mod normalize;
pub mod validate;

pub use normalize::{
    annotation_enabled, has_no_engine, has_separate_pod, named_port, normalize,
    NormalizedDeployment, OrchestratorPlacement, PredictorPlan, GRPC_PORT_NAME, HTTP_PORT_NAME,
    LOCALHOST, METRICS_PORT_NAME,
};
pub use validate::{validate, violations};
