//! Resource synthesis, ingress generation and reconciliation for SeldonDeployments
//!
//! - [`synth`] turns a normalized declaration into workloads, services,
//!   autoscalers and disruption budgets
//! - [`ingress`] renders the routing resources of every enabled backend
//! - [`diff`] compares desired objects with what the API server returns
//! - [`controller`] drives all of the above from the reconcile loop

#![deny(missing_docs)]

pub mod controller;
pub mod diff;
pub mod ingress;
pub mod synth;

pub use controller::{
    error_policy, reconcile, DeploymentContext, DeploymentKubeClient, DeploymentKubeClientImpl,
};
pub use ingress::GeneratedIngress;
pub use synth::{synthesize, SynthesizedComponents};
