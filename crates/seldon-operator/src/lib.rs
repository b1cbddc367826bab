//! Seldon operator - reconciles SeldonDeployments into serving resources

#![deny(missing_docs)]

/// Controller construction
pub mod controller_runner;
/// Mutating and validating admission webhooks
pub mod webhook;
