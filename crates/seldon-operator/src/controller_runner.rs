//! Controller runner - builds the SeldonDeployment controller future
//!
//! Construction stays separate from `main` so the watch set can be read in
//! one place: the declarations themselves plus every kind they own.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use seldon_common::config::OperatorConfig;
use seldon_common::crd::SeldonDeployment;
use seldon_deployment::{error_policy, ingress, reconcile, DeploymentContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reconciles allowed in flight at once, across different declarations
const MAX_CONCURRENT_RECONCILES: u16 = 8;

/// Build the SeldonDeployment controller future
///
/// Watches are cluster-wide unless `WATCH_NAMESPACE` restricts them. Ingress
/// kinds are only watched for backends that are enabled, since their CRDs
/// may not exist on the cluster otherwise.
pub fn build_deployment_controller(
    client: Client,
    config: Arc<OperatorConfig>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let namespace = config.watch_namespace.clone();
    let ns = namespace.as_deref();
    let watcher = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    match ns {
        Some(ns) => tracing::info!(namespace = %ns, "- SeldonDeployment controller (namespaced)"),
        None => tracing::info!("- SeldonDeployment controller (cluster-wide)"),
    }

    let mut controller = Controller::new(scoped::<SeldonDeployment>(&client, ns), watcher.clone())
        .with_config(ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .owns(scoped::<Deployment>(&client, ns), watcher.clone())
        .owns(scoped::<Service>(&client, ns), watcher.clone())
        .owns(scoped::<HorizontalPodAutoscaler>(&client, ns), watcher.clone())
        .owns(scoped::<PodDisruptionBudget>(&client, ns), watcher.clone());

    for ar in ingress::owned_kinds(&config.ingress) {
        tracing::info!(kind = %ar.kind, "  watching owned ingress kind");
        controller = controller.owns_with(dynamic(&client, ns, &ar), ar, watcher.clone());
    }

    let ctx = Arc::new(DeploymentContext::from_client(client, config));
    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("SeldonDeployment")),
    )
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn dynamic(client: &Client, namespace: Option<&str>, ar: &ApiResource) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
