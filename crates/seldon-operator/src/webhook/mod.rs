//! Admission webhooks for SeldonDeployments
//!
//! The mutating hook writes the normalized spec back through a JSON patch so
//! users see every defaulted field. The validating hook rejects declarations
//! the reconciler would mark `Failed`, with one cause per violation.

pub mod seldon_deployment;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tracing::info;

use seldon_common::config::OperatorConfig;

/// Path of the mutating hook
pub const MUTATE_PATH: &str = "/mutate-machinelearning-seldon-io-v1-seldondeployment";

/// Path of the validating hook
pub const VALIDATE_PATH: &str = "/validate-machinelearning-seldon-io-v1-seldondeployment";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Kubernetes client for reading the cluster configuration
    pub kube: Client,
    /// Process-wide operator configuration
    pub config: Arc<OperatorConfig>,
}

/// Errors that stop the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Certificate or key could not be loaded
    #[error("failed to load TLS material from {path}: {source}")]
    Tls {
        /// Directory the material was read from
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The listener failed
    #[error("webhook server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Create the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(seldon_deployment::mutate_handler))
        .route(VALIDATE_PATH, post(seldon_deployment::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhooks over HTTPS until the process exits
///
/// `cert_dir` holds `tls.crt` and `tls.key`, the layout cert-manager and
/// the API server's webhook configuration both use.
pub async fn serve(
    addr: SocketAddr,
    cert_dir: &Path,
    state: Arc<WebhookState>,
) -> Result<(), WebhookError> {
    let tls = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|source| WebhookError::Tls {
            path: cert_dir.display().to_string(),
            source,
        })?;

    info!(%addr, "starting admission webhook server");
    axum_server::bind_rustls(addr, tls)
        .serve(webhook_router(state).into_make_service())
        .await?;
    Ok(())
}
