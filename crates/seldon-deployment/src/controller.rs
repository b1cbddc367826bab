//! SeldonDeployment controller implementation
//!
//! Every pass re-derives the full desired state from the declaration:
//! normalize, validate, synthesize, then apply in a fixed order (services,
//! autoscalers, disruption budgets, workloads). Once every workload has
//! converged the ingress resources are applied and owned resources that are
//! no longer desired are deleted. Nothing is remembered between passes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use seldon_common::config::{ClusterConfig, OperatorConfig, CLUSTER_CONFIG_MAP};
use seldon_common::crd::{
    ComponentDeploymentStatus, DeploymentState, SeldonDeployment, SeldonDeploymentStatus,
};
use seldon_common::events::{DeploymentEvent, EventPublisher, KubeEventPublisher};
use seldon_common::kube_utils::{
    condition_is_false, patch_resource_status, HasApiResource, CONDITION_AVAILABLE,
    CONDITION_PROGRESSING,
};
#[cfg(test)]
use seldon_common::events::NoopEventPublisher;
use seldon_common::{labels, Error, Result, FIELD_MANAGER};

use crate::diff::diff;
use crate::ingress::{self, contour, HttpProxy};
use crate::synth::{self, SynthesizedComponents};

/// Requeue interval while workloads roll out
const REQUEUE_CREATING: Duration = Duration::from_secs(10);
/// Resync interval once available
const REQUEUE_AVAILABLE: Duration = Duration::from_secs(300);
/// Requeue interval after a failed rollout or a transient error
const REQUEUE_FAILED: Duration = Duration::from_secs(30);

/// Description of a rollout that stopped progressing
const NOT_PROGRESSING: &str = "Deployment is no longer progressing and not available.";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for SeldonDeployment
///
/// Owned resources are handled as `DynamicObject`s so one set of methods
/// covers built-in kinds and the ingress custom resources alike.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentKubeClient: Send + Sync {
    /// Get an object, `None` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object in its namespace
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; `obj` carries the live resource version
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object, cascading to its dependents
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    /// List objects in a namespace by label selector
    ///
    /// A kind whose CRD is not installed lists as empty.
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// List objects across all namespaces by label selector
    async fn list_all(&self, ar: &ApiResource, selector: &str) -> Result<Vec<DynamicObject>>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Whether the namespace is gone or being deleted
    async fn namespace_terminating(&self, namespace: &str) -> Result<bool>;

    /// Patch the status of a SeldonDeployment
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SeldonDeploymentStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct DeploymentKubeClientImpl {
    client: Client,
}

impl DeploymentKubeClientImpl {
    /// Create a new DeploymentKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn object_namespace(obj: &DynamicObject) -> Result<&str> {
    obj.metadata.namespace.as_deref().ok_or_else(|| {
        Error::internal_with_context("apply", format!("{} has no namespace", obj.name_any()))
    })
}

#[async_trait]
impl DeploymentKubeClient for DeploymentKubeClientImpl {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(ar, namespace).get_opt(name).await?)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, object_namespace(obj)?);
        Ok(api.create(&post_params(), obj).await?)
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, object_namespace(obj)?);
        Ok(api.replace(&obj.name_any(), &post_params(), obj).await?)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(selector);
        match self.api(ar, namespace).list(&params).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self, ar: &ApiResource, selector: &str) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let params = ListParams::default().labels(selector);
        match api.list(&params).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn namespace_terminating(&self, namespace: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let terminating = api.get_opt(namespace).await?.map_or(true, |ns| {
            ns.metadata.deletion_timestamp.is_some()
                || ns.status.and_then(|s| s.phase).as_deref() == Some("Terminating")
        });
        Ok(terminating)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SeldonDeploymentStatus,
    ) -> Result<()> {
        patch_resource_status::<SeldonDeployment>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared across all reconciliations
pub struct DeploymentContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn DeploymentKubeClient>,
    /// Operator configuration, read once at startup
    pub config: Arc<OperatorConfig>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl DeploymentContext {
    /// Create a new DeploymentContext with the given dependencies
    pub fn new(
        kube: Arc<dyn DeploymentKubeClient>,
        config: Arc<OperatorConfig>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            config,
            events,
        }
    }

    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client, config: Arc<OperatorConfig>) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
        Self {
            kube: Arc::new(DeploymentKubeClientImpl::new(client)),
            config,
            events,
        }
    }

    /// Create a context for testing with a mock or fake client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn DeploymentKubeClient>) -> Self {
        Self {
            kube,
            config: Arc::new(synth::fixtures::config()),
            events: Arc::new(NoopEventPublisher),
        }
    }

    /// Whether this controller instance is responsible for the declaration
    ///
    /// The `seldon.io/controller-id` label must match `CONTROLLER_ID`; an
    /// empty label and an unset id both mean "the default controller".
    pub fn owns(&self, sdep: &SeldonDeployment) -> bool {
        let wanted = sdep
            .labels()
            .get(labels::CONTROLLER_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty());
        let ours = self.config.controller_id.as_deref().filter(|id| !id.is_empty());
        wanted == ours
    }
}

// =============================================================================
// SeldonDeployment reconciliation
// =============================================================================

/// Reconcile a SeldonDeployment
///
/// Validation failures are persisted as `Failed` and wait for a spec change.
/// Any other failure is recorded as an event and on the status, then returned
/// so [`error_policy`] decides on the requeue.
#[instrument(skip(sdep, ctx), fields(deployment = %sdep.name_any()))]
pub async fn reconcile(sdep: Arc<SeldonDeployment>, ctx: Arc<DeploymentContext>) -> Result<Action> {
    if sdep.metadata.deletion_timestamp.is_some() {
        debug!("deletion in progress, nothing to do");
        return Ok(Action::await_change());
    }
    if !ctx.owns(&sdep) {
        debug!("declaration belongs to another controller, skipping");
        return Ok(Action::await_change());
    }
    let Some(namespace) = sdep.namespace() else {
        error!("SeldonDeployment is missing namespace");
        return Ok(Action::await_change());
    };
    if ctx.kube.namespace_terminating(&namespace).await? {
        info!(namespace = %namespace, "namespace is terminating, skipping");
        return Ok(Action::await_change());
    }

    info!("reconciling deployment");
    match run_pass(&sdep, &namespace, &ctx).await {
        Ok(status) => {
            let state = status.state.clone();
            update_status(&sdep, &ctx, status).await?;
            Ok(match state {
                DeploymentState::Available => Action::requeue(REQUEUE_AVAILABLE),
                DeploymentState::Creating => Action::requeue(REQUEUE_CREATING),
                DeploymentState::Failed => Action::requeue(REQUEUE_FAILED),
            })
        }
        Err(e @ (Error::Invalid { .. } | Error::Validation { .. })) => {
            let msg = e.to_string();
            warn!(error = %msg, "declaration is invalid");
            if !is_failed_with(&sdep, &msg) {
                publish(&sdep, &ctx, DeploymentEvent::ValidationFailed(msg.clone())).await;
            }
            update_status_failed(&sdep, &ctx, &msg).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            let msg = e.to_string();
            error!(error = %msg, retryable = e.is_retryable(), "reconcile pass failed");
            publish(&sdep, &ctx, DeploymentEvent::InternalError(msg.clone())).await;
            // A conflict only means our read was stale; the next pass sorts it out
            if !e.is_conflict() {
                update_status_failed(&sdep, &ctx, &msg).await?;
            }
            Err(e)
        }
    }
}

/// Error policy for the deployment controller
///
/// Retryable errors requeue after 30 seconds; permanent ones wait for a
/// change to the declaration.
pub fn error_policy(sdep: Arc<SeldonDeployment>, error: &Error, _ctx: Arc<DeploymentContext>) -> Action {
    error!(
        ?error,
        deployment = %sdep.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(REQUEUE_FAILED)
    } else {
        Action::await_change()
    }
}

/// One full pass; returns the status to persist
async fn run_pass(
    sdep: &SeldonDeployment,
    namespace: &str,
    ctx: &DeploymentContext,
) -> Result<SeldonDeploymentStatus> {
    let name = sdep.name_any();
    let config = ctx.config.as_ref();
    let cluster = cluster_config(ctx).await?;

    let normalized = seldon_graph::normalize(&name, namespace, &sdep.spec, config, &cluster)?;
    seldon_graph::validate(&name, &normalized.spec, config, &cluster)?;

    let mut components = synth::synthesize(&normalized, config, &cluster)?;
    let generated = ingress::generate(&config.ingress, &normalized, &components)?;
    for (service, annotations) in &generated.service_annotations {
        components.annotate_service(service, annotations);
    }

    let owner = sdep.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("reconciler", format!("{name} has no uid"))
    })?;
    let applier = Applier {
        ctx,
        sdep,
        owner: &owner,
    };
    let mut pass = Pass::default();

    let autoscaled: BTreeSet<String> = components
        .hpas
        .iter()
        .filter_map(|h| h.spec.as_ref())
        .map(|s| s.scale_target_ref.name.clone())
        .collect();

    for svc in &components.services {
        let outcome = applier.apply(&typed(svc)?, KindPolicy::service()).await?;
        pass.observe_converged(&outcome);
    }
    for hpa in &components.hpas {
        let outcome = applier.apply(&typed(hpa)?, KindPolicy::default()).await?;
        pass.observe_converged(&outcome);
    }
    for pdb in &components.pdbs {
        let outcome = applier.apply(&typed(pdb)?, KindPolicy::default()).await?;
        pass.observe_converged(&outcome);
    }
    for deployment in &components.deployments {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let policy = KindPolicy::deployment(autoscaled.contains(&name));
        let outcome = applier.apply(&typed(deployment)?, policy).await?;
        pass.observe_workload(&name, &outcome, sdep, &components)?;
    }

    if pass.workloads_ready {
        for (ar, obj) in generated.to_dynamic()? {
            let outcome = applier.apply(&(ar, obj), KindPolicy::default()).await?;
            pass.observe_converged(&outcome);
        }
        if let Some(contour) = config.ingress.contour.as_ref().filter(|c| !c.per_model_vhost) {
            apply_root_proxy(ctx, contour).await?;
        }
        collect_garbage(sdep, namespace, ctx, &components, &generated).await?;
    } else {
        debug!("workloads not converged, deferring ingress and cleanup");
    }

    if pass.writes > 0 {
        let event = DeploymentEvent::Updated {
            name,
            writes: pass.writes,
        };
        publish(sdep, ctx, event).await;
    }
    Ok(pass.status(&components))
}

async fn cluster_config(ctx: &DeploymentContext) -> Result<ClusterConfig> {
    let namespace = &ctx.config.controller_namespace;
    let cm = ctx
        .kube
        .get_config_map(namespace, CLUSTER_CONFIG_MAP)
        .await?
        .ok_or_else(|| {
            Error::config(format!("ConfigMap {namespace}/{CLUSTER_CONFIG_MAP} not found"))
        })?;
    ClusterConfig::from_data(&cm.data.unwrap_or_default())
}

// =============================================================================
// Apply
// =============================================================================

/// What applying one object did
#[derive(Debug)]
enum Applied {
    Created,
    Updated,
    /// Live object already matches; carries the live object
    Unchanged(DynamicObject),
}

/// Per-kind rules for comparing and updating
#[derive(Default)]
struct KindPolicy {
    /// JSON pointers copied from the live object when the desired one omits them
    preserve: &'static [&'static str],
    /// Diff path prefixes the API server refuses to update in place
    immutable: &'static [&'static str],
    /// Drop `spec.replicas` from the comparison, an autoscaler owns it
    ignore_replicas: bool,
}

impl KindPolicy {
    fn service() -> Self {
        Self {
            preserve: &["/spec/clusterIP", "/spec/clusterIPs"],
            immutable: &["spec.clusterIP"],
            ignore_replicas: false,
        }
    }

    fn deployment(autoscaled: bool) -> Self {
        Self {
            preserve: &["/spec/replicas"],
            immutable: &["spec.selector"],
            ignore_replicas: autoscaled,
        }
    }
}

struct Applier<'a> {
    ctx: &'a DeploymentContext,
    sdep: &'a SeldonDeployment,
    owner: &'a OwnerReference,
}

impl Applier<'_> {
    /// Create, update or leave one owned object
    async fn apply(
        &self,
        (ar, desired): &(ApiResource, DynamicObject),
        policy: KindPolicy,
    ) -> Result<Applied> {
        let mut desired = desired.clone();
        desired.metadata.owner_references = Some(vec![self.owner.clone()]);
        let name = desired.name_any();
        let namespace = desired
            .metadata
            .namespace
            .clone()
            .or_else(|| self.sdep.namespace())
            .unwrap_or_default();
        desired.metadata.namespace = Some(namespace.clone());

        let Some(live) = self.ctx.kube.get(ar, &namespace, &name).await? else {
            info!(kind = %ar.kind, name = %name, "creating");
            self.ctx.kube.create(ar, &desired).await?;
            return Ok(Applied::Created);
        };

        let mut desired_value = to_value(&ar.kind, &desired)?;
        let live_value = to_value(&ar.kind, &live)?;
        if policy.ignore_replicas {
            if let Some(spec) = desired_value.get_mut("spec").and_then(Value::as_object_mut) {
                spec.remove("replicas");
            }
        }

        let changes = diff(&desired_value, &live_value);
        if changes.is_empty() {
            debug!(kind = %ar.kind, name = %name, "found identical");
            return Ok(Applied::Unchanged(live));
        }
        debug!(kind = %ar.kind, name = %name, ?changes, "live object differs");

        if changes
            .iter()
            .any(|path| policy.immutable.iter().any(|p| path.starts_with(p)))
        {
            info!(kind = %ar.kind, name = %name, "immutable field changed, recreating");
            self.ctx.kube.delete(ar, &namespace, &name).await?;
            self.ctx.kube.create(ar, &desired).await?;
            return Ok(Applied::Created);
        }

        for pointer in policy.preserve {
            if desired_value.pointer(pointer).is_none() {
                if let Some(value) = live_value.pointer(pointer) {
                    set_pointer(&mut desired_value, pointer, value.clone());
                }
            }
        }
        let mut update: DynamicObject = serde_json::from_value(desired_value)
            .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))?;
        update.metadata.resource_version = live.metadata.resource_version.clone();

        info!(kind = %ar.kind, name = %name, "updating");
        self.ctx.kube.replace(ar, &update).await?;
        Ok(Applied::Updated)
    }
}

/// Convert a built-in typed object for the dynamic client
fn typed<K>(obj: &K) -> Result<(ApiResource, DynamicObject)>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let ar = ApiResource::erase::<K>(&());
    let dynamic = serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(&ar.kind, e.to_string()))?;
    Ok((ar, dynamic))
}

fn to_value(kind: &str, obj: &DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Set a value at a JSON pointer whose parent object exists
fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let Some((parent, key)) = pointer.rsplit_once('/') else {
        return;
    };
    if let Some(obj) = root.pointer_mut(parent).and_then(Value::as_object_mut) {
        obj.insert(key.to_string(), value);
    }
}

// =============================================================================
// Convergence tracking
// =============================================================================

/// What one pass observed
struct Pass {
    writes: usize,
    /// Services, autoscalers, disruption budgets and ingress all match
    converged: bool,
    /// Every workload reports its replicas ready
    workloads_ready: bool,
    /// No workload has stalled
    progressing: bool,
    deployment_status: BTreeMap<String, ComponentDeploymentStatus>,
    replicas: Option<i32>,
}

impl Default for Pass {
    fn default() -> Self {
        Self {
            writes: 0,
            converged: true,
            workloads_ready: true,
            progressing: true,
            deployment_status: BTreeMap::new(),
            replicas: None,
        }
    }
}

impl Pass {
    fn observe_converged(&mut self, outcome: &Applied) {
        if !matches!(outcome, Applied::Unchanged(_)) {
            self.writes += 1;
            self.converged = false;
        }
    }

    fn observe_workload(
        &mut self,
        name: &str,
        outcome: &Applied,
        sdep: &SeldonDeployment,
        components: &SynthesizedComponents,
    ) -> Result<()> {
        let previous = sdep
            .status
            .as_ref()
            .and_then(|s| s.deployment_status.get(name));
        let mut entry = ComponentDeploymentStatus {
            name: name.to_string(),
            replicas: previous.map_or(0, |p| p.replicas),
            available_replicas: previous.map_or(0, |p| p.available_replicas),
            explainer_for: components.explainer_for.get(name).cloned().unwrap_or_default(),
            ..Default::default()
        };

        let ready = match outcome {
            Applied::Created | Applied::Updated => {
                self.writes += 1;
                false
            }
            Applied::Unchanged(live) => {
                let live: Deployment = live
                    .clone()
                    .try_parse()
                    .map_err(|e| Error::serialization_for_kind("Deployment", e.to_string()))?;
                let wanted = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let status = live.status.unwrap_or_default();
                entry.replicas = status.replicas.unwrap_or(0);
                entry.available_replicas = status.available_replicas.unwrap_or(0);

                let ready = wanted == 0
                    || (status.ready_replicas.unwrap_or(0) > 0
                        && status.unavailable_replicas.unwrap_or(0) == 0);
                let conditions = status.conditions.unwrap_or_default();
                if !ready
                    && condition_is_false(&conditions, CONDITION_AVAILABLE)
                    && condition_is_false(&conditions, CONDITION_PROGRESSING)
                {
                    warn!(deployment = %name, "rollout is no longer progressing");
                    self.progressing = false;
                }
                ready
            }
        };

        entry.status = if ready {
            DeploymentState::Available.to_string()
        } else {
            DeploymentState::Creating.to_string()
        };
        self.workloads_ready &= ready;
        if self.replicas.is_none() {
            self.replicas = Some(entry.replicas);
        }
        self.deployment_status.insert(name.to_string(), entry);
        Ok(())
    }

    fn status(self, components: &SynthesizedComponents) -> SeldonDeploymentStatus {
        let (state, description) = if self.workloads_ready && self.converged {
            (DeploymentState::Available, String::new())
        } else if !self.workloads_ready && !self.progressing {
            (DeploymentState::Failed, NOT_PROGRESSING.to_string())
        } else {
            (DeploymentState::Creating, String::new())
        };
        SeldonDeploymentStatus {
            state,
            description,
            deployment_status: self.deployment_status,
            service_status: components.service_status.clone(),
            replicas: self.replicas.unwrap_or(0),
            address: components.address.clone(),
        }
    }
}

// =============================================================================
// Ingress root and garbage collection
// =============================================================================

/// Rebuild the shared Contour root proxy from every proxy this controller owns
async fn apply_root_proxy(
    ctx: &DeploymentContext,
    config: &seldon_common::config::ContourConfig,
) -> Result<()> {
    let ar = HttpProxy::api_resource();
    let selector = format!("{}={}", labels::CONTOUR_CONTROLLER, config.controller_label);
    let children = ctx.kube.list_all(&ar, &selector).await?;
    let includes = children.iter().filter_map(|child| {
        Some(contour::Include {
            name: child.metadata.name.clone()?,
            namespace: child.metadata.namespace.clone()?,
        })
    });
    let root = ingress::to_dynamic(&contour::root_proxy(config, includes))?;

    let namespace = config.vhost_namespace.as_str();
    match ctx.kube.get(&ar, namespace, &config.vhost_name).await? {
        None => {
            info!(name = %config.vhost_name, "creating root HTTPProxy");
            ctx.kube.create(&ar, &root).await?;
        }
        Some(live) => {
            let changes = diff(&to_value(&ar.kind, &root)?, &to_value(&ar.kind, &live)?);
            if !changes.is_empty() {
                let mut update = root;
                update.metadata.resource_version = live.metadata.resource_version;
                info!(name = %config.vhost_name, ?changes, "updating root HTTPProxy");
                ctx.kube.replace(&ar, &update).await?;
            }
        }
    }
    Ok(())
}

/// Kinds the reconciler creates and therefore cleans up
fn owned_kinds(config: &OperatorConfig) -> Vec<ApiResource> {
    let mut kinds = vec![
        ApiResource::erase::<Deployment>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<HorizontalPodAutoscaler>(&()),
        ApiResource::erase::<PodDisruptionBudget>(&()),
    ];
    kinds.extend(ingress::owned_kinds(&config.ingress));
    kinds
}

/// Delete owned objects that are no longer desired
///
/// Only objects labelled with the declaration and carrying its uid as an
/// owner reference are candidates.
async fn collect_garbage(
    sdep: &SeldonDeployment,
    namespace: &str,
    ctx: &DeploymentContext,
    components: &SynthesizedComponents,
    generated: &ingress::GeneratedIngress,
) -> Result<()> {
    let name = sdep.name_any();
    let uid = sdep.uid().unwrap_or_default();
    let selector = format!("{}={}", labels::SELDON_ID, name);

    let mut desired: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut want = |kind: &str, name: Option<&String>| {
        if let Some(name) = name {
            desired.entry(kind.to_string()).or_default().insert(name.clone());
        }
    };
    for d in &components.deployments {
        want("Deployment", d.metadata.name.as_ref());
    }
    for s in &components.services {
        want("Service", s.metadata.name.as_ref());
    }
    for h in &components.hpas {
        want("HorizontalPodAutoscaler", h.metadata.name.as_ref());
    }
    for p in &components.pdbs {
        want("PodDisruptionBudget", p.metadata.name.as_ref());
    }
    for (ar, obj) in generated.to_dynamic()? {
        want(&ar.kind, obj.metadata.name.as_ref());
    }

    for ar in owned_kinds(&ctx.config) {
        let keep = desired.get(&ar.kind);
        for live in ctx.kube.list(&ar, namespace, &selector).await? {
            let live_name = live.name_any();
            let owned = live
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|o| o.uid == uid);
            if !owned || keep.is_some_and(|k| k.contains(&live_name)) {
                continue;
            }
            info!(kind = %ar.kind, name = %live_name, "deleting stale resource");
            ctx.kube.delete(&ar, namespace, &live_name).await?;
            let event = DeploymentEvent::DeletedStale {
                kind: ar.kind.clone(),
                name: live_name,
            };
            publish(sdep, ctx, event).await;
        }
    }
    Ok(())
}

// =============================================================================
// Status and events
// =============================================================================

/// Whether the status already reports this failure
fn is_failed_with(sdep: &SeldonDeployment, message: &str) -> bool {
    sdep.status
        .as_ref()
        .is_some_and(|s| s.state == DeploymentState::Failed && s.description == message)
}

/// Patch the status unless it already matches
async fn update_status(
    sdep: &SeldonDeployment,
    ctx: &DeploymentContext,
    status: SeldonDeploymentStatus,
) -> Result<()> {
    if sdep.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    debug!(state = %status.state, "updating status");
    ctx.kube
        .patch_status(&sdep.name_any(), &sdep.namespace().unwrap_or_default(), &status)
        .await
}

/// Mark the declaration `Failed`, keeping the rest of the last status
async fn update_status_failed(
    sdep: &SeldonDeployment,
    ctx: &DeploymentContext,
    message: &str,
) -> Result<()> {
    let mut status = sdep.status.clone().unwrap_or_default();
    status.state = DeploymentState::Failed;
    status.description = message.to_string();
    update_status(sdep, ctx, status).await
}

async fn publish(sdep: &SeldonDeployment, ctx: &DeploymentContext, event: DeploymentEvent) {
    ctx.events.publish(&sdep.object_ref(&()), event).await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use seldon_common::crd::SeldonDeploymentSpec;
    use serde_json::json;

    use crate::ingress::fixtures::canary;
    use crate::synth::fixtures::single_model;

    // =========================================================================
    // Test fixtures
    // =========================================================================

    fn declaration(spec: SeldonDeploymentSpec) -> SeldonDeployment {
        let mut sdep = SeldonDeployment::new("iris", spec);
        sdep.metadata.namespace = Some("models".to_string());
        sdep.metadata.uid = Some("uid-iris".to_string());
        sdep
    }

    fn cluster_config_map() -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    type Key = (String, String, String);

    /// In-memory API server that mimics the defaults a real one adds
    #[derive(Default)]
    struct FakeKube {
        objects: Mutex<BTreeMap<Key, DynamicObject>>,
        creates: Mutex<Vec<String>>,
        updates: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        statuses: Mutex<Vec<SeldonDeploymentStatus>>,
    }

    impl FakeKube {
        fn key(ar: &ApiResource, namespace: &str, name: &str) -> Key {
            (ar.kind.clone(), namespace.to_string(), name.to_string())
        }

        fn writes(&self) -> usize {
            self.creates.lock().unwrap().len() + self.updates.lock().unwrap().len()
        }

        fn reset(&self) {
            self.creates.lock().unwrap().clear();
            self.updates.lock().unwrap().clear();
            self.deletes.lock().unwrap().clear();
        }

        fn names(&self, kind: &str) -> BTreeSet<String> {
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(k, _, _)| k == kind)
                .map(|(_, _, n)| n.clone())
                .collect()
        }

        /// Report every workload fully rolled out
        fn roll_out(&self) {
            for ((kind, _, _), obj) in self.objects.lock().unwrap().iter_mut() {
                if kind == "Deployment" {
                    let replicas = obj.data["spec"]["replicas"].as_i64().unwrap_or(1);
                    obj.data["status"] = json!({
                        "replicas": replicas,
                        "readyReplicas": replicas,
                        "availableReplicas": replicas,
                        "updatedReplicas": replicas,
                    });
                }
            }
        }

        fn last_status(&self) -> SeldonDeploymentStatus {
            self.statuses.lock().unwrap().last().cloned().expect("status patched")
        }
    }

    #[async_trait]
    impl DeploymentKubeClient for FakeKube {
        async fn get(
            &self,
            ar: &ApiResource,
            namespace: &str,
            name: &str,
        ) -> Result<Option<DynamicObject>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&Self::key(ar, namespace, name))
                .cloned())
        }

        async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some("1".to_string());
            match ar.kind.as_str() {
                "Service" if stored.data["spec"].get("clusterIP").is_none() => {
                    stored.data["spec"]["clusterIP"] = json!("10.0.0.12");
                    stored.data["spec"]["sessionAffinity"] = json!("None");
                }
                "Deployment" => {
                    stored.data["spec"]["revisionHistoryLimit"] = json!(10);
                }
                _ => {}
            }
            let key = Self::key(ar, object_namespace(obj)?, &obj.name_any());
            self.creates.lock().unwrap().push(format!("{}/{}", ar.kind, key.2));
            self.objects.lock().unwrap().insert(key, stored.clone());
            Ok(stored)
        }

        async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
            let key = Self::key(ar, object_namespace(obj)?, &obj.name_any());
            let mut objects = self.objects.lock().unwrap();
            let mut stored = obj.clone();
            if let Some(live) = objects.get(&key) {
                if let Some(status) = live.data.get("status") {
                    stored.data["status"] = status.clone();
                }
            }
            stored.metadata.resource_version = Some("2".to_string());
            self.updates.lock().unwrap().push(format!("{}/{}", ar.kind, key.2));
            objects.insert(key, stored.clone());
            Ok(stored)
        }

        async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
            self.deletes.lock().unwrap().push(format!("{}/{}", ar.kind, name));
            self.objects
                .lock()
                .unwrap()
                .remove(&Self::key(ar, namespace, name));
            Ok(())
        }

        async fn list(
            &self,
            ar: &ApiResource,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<DynamicObject>> {
            let (label, value) = selector.split_once('=').unwrap();
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, ns, _), _)| *k == ar.kind && ns == namespace)
                .filter(|(_, o)| o.labels().get(label).map(String::as_str) == Some(value))
                .map(|(_, o)| o.clone())
                .collect())
        }

        async fn list_all(&self, ar: &ApiResource, selector: &str) -> Result<Vec<DynamicObject>> {
            let (label, value) = selector.split_once('=').unwrap();
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _, _), _)| *k == ar.kind)
                .filter(|(_, o)| o.labels().get(label).map(String::as_str) == Some(value))
                .map(|(_, o)| o.clone())
                .collect())
        }

        async fn get_config_map(&self, _: &str, _: &str) -> Result<Option<ConfigMap>> {
            Ok(Some(cluster_config_map()))
        }

        async fn namespace_terminating(&self, _: &str) -> Result<bool> {
            Ok(false)
        }

        async fn patch_status(
            &self,
            _: &str,
            _: &str,
            status: &SeldonDeploymentStatus,
        ) -> Result<()> {
            self.statuses.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    /// Reconcile once and feed the persisted status back into the declaration
    async fn pass(sdep: &mut SeldonDeployment, fake: &Arc<FakeKube>, ctx: &Arc<DeploymentContext>) -> Action {
        let action = reconcile(Arc::new(sdep.clone()), ctx.clone())
            .await
            .expect("reconcile");
        if let Some(status) = fake.statuses.lock().unwrap().last() {
            sdep.status = Some(status.clone());
        }
        action
    }

    fn fake_context() -> (Arc<FakeKube>, Arc<DeploymentContext>) {
        let fake = Arc::new(FakeKube::default());
        let ctx = Arc::new(DeploymentContext::for_testing(fake.clone()));
        (fake, ctx)
    }

    // =========================================================================
    // Convergence stories
    // =========================================================================

    /// Story: the first pass creates every resource and reports Creating
    #[tokio::test]
    async fn story_first_pass_creates_resources() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(single_model());

        let action = pass(&mut sdep, &fake, &ctx).await;

        assert_eq!(action, Action::requeue(REQUEUE_CREATING));
        assert!(fake.names("Deployment").contains("iris-default-0-classifier"));
        assert!(fake.names("Service").contains("iris-default"));
        let status = fake.last_status();
        assert_eq!(status.state, DeploymentState::Creating);
        assert!(status
            .address
            .as_ref()
            .is_some_and(|a| a.url.starts_with("http://iris-default.models.svc.cluster.local:")));
    }

    /// Story: reconciling an unchanged declaration a second time writes nothing
    #[tokio::test]
    async fn story_second_pass_issues_no_writes() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(single_model());

        pass(&mut sdep, &fake, &ctx).await;
        fake.reset();
        pass(&mut sdep, &fake, &ctx).await;

        assert_eq!(fake.writes(), 0, "updates: {:?}", fake.updates.lock().unwrap());
    }

    /// Story: once workloads roll out the declaration becomes Available,
    /// and a further pass does not even patch the status
    #[tokio::test]
    async fn story_rolled_out_deployment_becomes_available() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(single_model());

        pass(&mut sdep, &fake, &ctx).await;
        fake.roll_out();
        let action = pass(&mut sdep, &fake, &ctx).await;

        assert_eq!(action, Action::requeue(REQUEUE_AVAILABLE));
        let status = fake.last_status();
        assert_eq!(status.state, DeploymentState::Available);
        assert!(status.deployment_status.values().all(|d| d.status == "Available"));

        let patches = fake.statuses.lock().unwrap().len();
        pass(&mut sdep, &fake, &ctx).await;
        assert_eq!(fake.statuses.lock().unwrap().len(), patches);
        assert_eq!(fake.writes(), 0);
    }

    /// Story: a changed image updates the workload in place, keeping the
    /// replica count the cluster already runs
    #[tokio::test]
    async fn story_changed_spec_updates_in_place() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(single_model());
        pass(&mut sdep, &fake, &ctx).await;
        fake.reset();

        sdep.spec.predictors[0].component_specs[0].spec.containers[0].image =
            Some("example/classifier:2.0".to_string());
        pass(&mut sdep, &fake, &ctx).await;

        let updates = fake.updates.lock().unwrap().clone();
        assert!(updates.iter().any(|u| u == "Deployment/iris-default-0-classifier"));
        assert!(fake.creates.lock().unwrap().is_empty());
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Story: dropping the canary predictor deletes exactly its resources
    #[tokio::test]
    async fn story_removed_predictor_is_garbage_collected() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(canary());
        pass(&mut sdep, &fake, &ctx).await;
        fake.roll_out();
        pass(&mut sdep, &fake, &ctx).await;
        let before_deployments = fake.names("Deployment");
        let before_services = fake.names("Service");

        sdep.spec.predictors.retain(|p| p.name == "main");
        sdep.spec.predictors[0].traffic = 100;
        for _ in 0..3 {
            pass(&mut sdep, &fake, &ctx).await;
            fake.roll_out();
        }

        let deleted_deployments: BTreeSet<_> =
            before_deployments.difference(&fake.names("Deployment")).cloned().collect();
        let deleted_services: BTreeSet<_> =
            before_services.difference(&fake.names("Service")).cloned().collect();
        assert!(!deleted_deployments.is_empty());
        assert!(deleted_deployments.iter().all(|n| n.contains("canary")));
        assert!(deleted_services.contains("iris-canary"));
        assert!(deleted_services.iter().all(|n| n.contains("canary")));
        assert!(fake.names("Service").contains("iris-main"));
    }

    /// Story: nothing is deleted while workloads are still rolling out
    #[tokio::test]
    async fn story_cleanup_waits_for_rollout() {
        let (fake, ctx) = fake_context();
        let mut sdep = declaration(canary());
        pass(&mut sdep, &fake, &ctx).await;

        sdep.spec.predictors.retain(|p| p.name == "main");
        sdep.spec.predictors[0].traffic = 100;
        pass(&mut sdep, &fake, &ctx).await;

        assert!(fake.deletes.lock().unwrap().is_empty());
    }

    fn istio_context() -> (Arc<FakeKube>, Arc<DeploymentContext>) {
        let mut config = synth::fixtures::config();
        config.ingress.istio = Some(seldon_common::config::IstioConfig {
            gateway: "istio-system/seldon-gateway".to_string(),
            tls_mode: None,
        });
        let fake = Arc::new(FakeKube::default());
        let ctx = Arc::new(DeploymentContext::new(
            fake.clone(),
            Arc::new(config),
            Arc::new(NoopEventPublisher),
        ));
        (fake, ctx)
    }

    /// Story: Istio routing is applied once workloads converge, and the
    /// routes of a removed predictor and its explainer are deleted while
    /// the deployment-wide routes stay
    #[tokio::test]
    async fn story_stale_istio_routes_are_garbage_collected() {
        let (fake, ctx) = istio_context();
        let mut spec = canary();
        spec.predictors[1].explainer = Some(seldon_common::crd::Explainer {
            type_: "AnchorTabular".to_string(),
            container_spec: k8s_openapi::api::core::v1::Container {
                image: Some("seldonio/alibiexplainer:1.18.0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut sdep = declaration(spec);

        pass(&mut sdep, &fake, &ctx).await;
        assert!(fake.names("VirtualService").is_empty());
        assert!(fake.names("DestinationRule").is_empty());

        fake.roll_out();
        pass(&mut sdep, &fake, &ctx).await;
        assert_eq!(
            fake.names("VirtualService"),
            BTreeSet::from([
                "iris-grpc".to_string(),
                "iris-http".to_string(),
                "iris-canary-explainer-http".to_string(),
            ])
        );
        assert_eq!(
            fake.names("DestinationRule"),
            BTreeSet::from([
                "iris-main".to_string(),
                "iris-canary".to_string(),
                "iris-canary-explainer".to_string(),
            ])
        );

        sdep.spec.predictors.retain(|p| p.name == "main");
        sdep.spec.predictors[0].traffic = 100;
        for _ in 0..3 {
            pass(&mut sdep, &fake, &ctx).await;
            fake.roll_out();
        }

        assert_eq!(
            fake.names("VirtualService"),
            BTreeSet::from(["iris-grpc".to_string(), "iris-http".to_string()])
        );
        assert_eq!(
            fake.names("DestinationRule"),
            BTreeSet::from(["iris-main".to_string()])
        );
        let deletes = fake.deletes.lock().unwrap().clone();
        assert!(deletes.contains(&"DestinationRule/iris-canary".to_string()));
        assert!(deletes.contains(&"VirtualService/iris-canary-explainer-http".to_string()));
        assert!(!deletes.iter().any(|d| d.contains("iris-main") || d.ends_with("iris-http")));
    }

    // =========================================================================
    // Failure stories
    // =========================================================================

    /// Story: an invalid traffic split is persisted as Failed and not retried
    #[tokio::test]
    async fn story_invalid_declaration_fails() {
        let (fake, ctx) = fake_context();
        let mut spec = canary();
        spec.predictors[1].traffic = 60;
        let mut sdep = declaration(spec);

        let action = pass(&mut sdep, &fake, &ctx).await;

        assert_eq!(action, Action::await_change());
        assert_eq!(fake.writes(), 0);
        let status = fake.last_status();
        assert_eq!(status.state, DeploymentState::Failed);
        assert!(status.description.contains("Traffic must sum to 100"));
    }

    /// Story: a declaration labelled for another controller is left alone
    #[tokio::test]
    async fn story_foreign_controller_id_is_ignored() {
        // No expectations: any client call panics
        let mock = MockDeploymentKubeClient::new();
        let ctx = Arc::new(DeploymentContext::for_testing(Arc::new(mock)));
        let mut sdep = declaration(single_model());
        sdep.metadata.labels = Some(BTreeMap::from([(
            labels::CONTROLLER_ID.to_string(),
            "canary-operator".to_string(),
        )]));

        let action = reconcile(Arc::new(sdep), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: without the cluster ConfigMap nothing is applied and the
    /// declaration is marked Failed with a non-retryable error
    #[tokio::test]
    async fn story_missing_cluster_config_fails() {
        let mut mock = MockDeploymentKubeClient::new();
        mock.expect_namespace_terminating().returning(|_| Ok(false));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_patch_status()
            .withf(|name, _, status| {
                name == "iris"
                    && status.state == DeploymentState::Failed
                    && status.description.contains(CLUSTER_CONFIG_MAP)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(DeploymentContext::for_testing(Arc::new(mock)));

        let err = reconcile(Arc::new(declaration(single_model())), ctx)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn terminating_namespace_is_skipped() {
        let mut mock = MockDeploymentKubeClient::new();
        mock.expect_namespace_terminating().returning(|_| Ok(true));
        let ctx = Arc::new(DeploymentContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(declaration(single_model())), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_requeues_only_retryable_errors() {
        let ctx = Arc::new(DeploymentContext::for_testing(Arc::new(
            MockDeploymentKubeClient::new(),
        )));
        let sdep = Arc::new(declaration(single_model()));

        let transient = Error::internal("timeout");
        assert_eq!(
            error_policy(sdep.clone(), &transient, ctx.clone()),
            Action::requeue(REQUEUE_FAILED)
        );
        let permanent = Error::config("bad");
        assert_eq!(error_policy(sdep, &permanent, ctx), Action::await_change());
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn set_pointer_fills_missing_leaf() {
        let mut value = json!({"spec": {"ports": []}});
        set_pointer(&mut value, "/spec/clusterIP", json!("10.0.0.1"));
        assert_eq!(value["spec"]["clusterIP"], "10.0.0.1");

        set_pointer(&mut value, "/status/phase", json!("x"));
        assert!(value.get("status").is_none());
    }
}
