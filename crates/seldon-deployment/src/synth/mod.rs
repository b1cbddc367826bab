//! Component synthesis
//!
//! Turns a normalized, validated declaration into the complete set of
//! workloads, services, autoscalers and disruption budgets it needs, plus the
//! routing facts the ingress generators consume. Synthesis is a pure function
//! of its inputs: no clock, no randomness, no cluster reads.
//!
//! Per predictor the order is:
//! 1. one Deployment per component spec, with prepackaged servers injected
//!    and one internal Service per graph-unit container
//! 2. the orchestrator, co-located or dedicated
//! 3. the predictor Service
//! 4. the explainer Deployment and Service

mod autoscale;
mod explainer;
mod initializer;
mod orchestrator;
mod prepack;
mod service;
mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, Lifecycle, LifecycleHandler, Probe, Service,
    TCPSocketAction,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use seldon_common::config::{ClusterConfig, OperatorConfig};
use seldon_common::crd::{
    Addressable, ComponentServiceStatus, PredictorSpec, Protocol, SeldonDeploymentSpec,
};
use seldon_common::{labels, naming, Result};
use seldon_graph::{NormalizedDeployment, OrchestratorPlacement, PredictorPlan};
use tracing::debug;

pub use autoscale::resolve_replicas;
pub use explainer::explainer_tag;

/// Name of the orchestrator container
pub const ENGINE_CONTAINER_NAME: &str = "seldon-container-engine";
/// Name of the TensorFlow Serving sidecar
pub const TFSERVING_CONTAINER_NAME: &str = "tfserving";
/// gRPC port of the TensorFlow Serving sidecar
pub const TFSERVING_GRPC_PORT: i32 = 2000;
/// REST port of the TensorFlow Serving sidecar
pub const TFSERVING_REST_PORT: i32 = 2001;

// =============================================================================
// Output
// =============================================================================

/// Routing facts about one predictor, consumed by the ingress generators
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredictorRoute {
    /// Predictor name
    pub predictor: String,
    /// Name of the predictor Service
    pub service: String,
    /// HTTP port of the predictor Service, 0 when not exposed
    pub http_port: i32,
    /// gRPC port of the predictor Service, 0 when not exposed
    pub grpc_port: i32,
    /// Traffic percentage
    pub traffic: i32,
    /// Receives mirrored traffic only
    pub shadow: bool,
    /// Value of the predictor's `version` label, the traffic subset
    pub version: String,
}

/// Routing facts about one explainer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExplainerRoute {
    /// Predictor the explainer belongs to
    pub predictor: String,
    /// Name of the explainer Service
    pub service: String,
    /// HTTP port of the explainer Service
    pub port: i32,
    /// Whether the explainer speaks gRPC
    pub grpc: bool,
}

/// Every resource a declaration needs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesizedComponents {
    /// Workloads
    pub deployments: Vec<Deployment>,
    /// Internal, predictor and explainer services
    pub services: Vec<Service>,
    /// Autoscalers
    pub hpas: Vec<HorizontalPodAutoscaler>,
    /// Disruption budgets
    pub pdbs: Vec<PodDisruptionBudget>,
    /// Status entries for predictor and explainer services
    pub service_status: BTreeMap<String, ComponentServiceStatus>,
    /// Explainer workload name -> predictor service it explains
    pub explainer_for: BTreeMap<String, String>,
    /// Predictor routes in declaration order
    pub routes: Vec<PredictorRoute>,
    /// Explainer routes in declaration order
    pub explainer_routes: Vec<ExplainerRoute>,
    /// Public address of the declaration
    pub address: Option<Addressable>,
}

impl SynthesizedComponents {
    /// Total number of resources
    pub fn resource_count(&self) -> usize {
        self.deployments.len() + self.services.len() + self.hpas.len() + self.pdbs.len()
    }

    /// Merge annotations onto the named service
    pub fn annotate_service(&mut self, name: &str, extra: &BTreeMap<String, String>) {
        if let Some(svc) = self
            .services
            .iter_mut()
            .find(|s| s.metadata.name.as_deref() == Some(name))
        {
            svc.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    fn deployment_mut(&mut self, name: &str) -> Option<&mut Deployment> {
        self.deployments
            .iter_mut()
            .find(|d| d.metadata.name.as_deref() == Some(name))
    }
}

// =============================================================================
// Synthesis
// =============================================================================

/// Everything a predictor's synthesis reads
pub(crate) struct Scope<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub spec: &'a SeldonDeploymentSpec,
    pub predictor: &'a PredictorSpec,
    pub plan: &'a PredictorPlan,
    pub config: &'a OperatorConfig,
    pub cluster: &'a ClusterConfig,
}

impl Scope<'_> {
    /// Name of the predictor Service and value of its `seldon-app` label
    pub fn predictor_service(&self) -> String {
        naming::predictor_key(self.name, &self.predictor.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.spec.annotation(self.predictor, key)
    }

    /// Value of the `version` label traffic subsets select on
    pub fn version(&self) -> String {
        self.predictor
            .labels
            .get(labels::VERSION)
            .cloned()
            .unwrap_or_else(|| self.predictor.name.clone())
    }
}

/// Synthesize every resource of a normalized declaration
pub fn synthesize(
    normalized: &NormalizedDeployment,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> Result<SynthesizedComponents> {
    let mut out = SynthesizedComponents::default();

    for (predictor, plan) in normalized.predictors() {
        let scope = Scope {
            name: &normalized.name,
            namespace: &normalized.namespace,
            spec: &normalized.spec,
            predictor,
            plan,
            config,
            cluster,
        };
        synthesize_predictor(&scope, &mut out)?;
    }

    out.address = address(normalized, &out.routes);
    debug!(
        deployment = %normalized.name,
        resources = out.resource_count(),
        "synthesized components"
    );
    Ok(out)
}

fn synthesize_predictor(scope: &Scope<'_>, out: &mut SynthesizedComponents) -> Result<()> {
    for (index, component) in scope.predictor.component_specs.iter().enumerate() {
        let mut built = workload::component_workload(scope, index, component)?;
        for svc in built.services.drain(..) {
            out.services.push(svc);
        }
        if let Some(hpa) = built.hpa.take() {
            out.hpas.push(hpa);
        }
        if let Some(pdb) = built.pdb.take() {
            out.pdbs.push(pdb);
        }
        out.deployments.push(built.deployment);
    }

    let service_name = scope.predictor_service();
    match scope.plan.placement {
        OrchestratorPlacement::Dedicated => {
            out.deployments.push(orchestrator::dedicated_workload(scope)?);
        }
        OrchestratorPlacement::CoLocated { component } => {
            let name = workload::component_name(scope, component);
            if let Some(deployment) = out.deployment_mut(&name) {
                orchestrator::co_locate(scope, deployment)?;
            }
        }
        OrchestratorPlacement::Disabled => {
            let root = &scope.predictor.graph.name;
            if let Some(index) = scope.predictor.component_index_for(root) {
                let name = workload::component_name(scope, index);
                if let Some(deployment) = out.deployment_mut(&name) {
                    workload::select_as(deployment, &service_name);
                }
            }
        }
    }

    let (svc, status, route) = service::predictor_service(scope);
    out.services.push(svc);
    out.service_status.insert(service_name.clone(), status);

    if let Some(explainer) = scope.predictor.explainer.as_ref().filter(|e| !e.is_empty()) {
        let built = explainer::explainer(scope, explainer, &route)?;
        out.explainer_for
            .insert(built.route.service.clone(), service_name.clone());
        out.service_status
            .insert(built.route.service.clone(), built.status);
        out.deployments.push(built.deployment);
        out.services.push(built.service);
        out.explainer_routes.push(built.route);
    }
    out.routes.push(route);
    Ok(())
}

/// Prediction path of a protocol for a graph whose root is `model`
pub fn prediction_path(protocol: &Protocol, model: &str) -> String {
    match protocol {
        Protocol::Tensorflow => format!("/v1/models/{model}:predict"),
        p if p.is_v2() => format!("/v2/models/{model}/infer"),
        _ => "/api/v1.0/predictions".to_string(),
    }
}

fn address(normalized: &NormalizedDeployment, routes: &[PredictorRoute]) -> Option<Addressable> {
    let route = routes.iter().find(|r| !r.shadow && r.http_port > 0)?;
    let predictor = normalized
        .spec
        .predictors
        .iter()
        .find(|p| p.name == route.predictor)?;
    let host = naming::service_host(&route.service, &normalized.namespace);
    let path = prediction_path(&normalized.spec.protocol(), &predictor.graph.name);
    Some(Addressable {
        url: format!("http://{host}:{}{path}", route.http_port),
    })
}

// =============================================================================
// Container helpers
// =============================================================================

/// Add an env var unless one with the same name exists
pub(crate) fn env_default(container: &mut Container, name: &str, value: impl Into<String>) {
    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == name) {
        env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.into()),
            ..Default::default()
        });
    }
}

pub(crate) fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// Add a named TCP port unless the name is taken
pub(crate) fn port_default(container: &mut Container, name: &str, port: i32) {
    let ports = container.ports.get_or_insert_with(Vec::new);
    if !ports.iter().any(|p| p.name.as_deref() == Some(name)) {
        ports.push(tcp_port(name, port));
    }
}

/// Set a named TCP port, replacing any port with the same name or number
pub(crate) fn port_override(container: &mut Container, name: &str, port: i32) {
    let ports = container.ports.get_or_insert_with(Vec::new);
    ports.retain(|p| p.name.as_deref() != Some(name) && p.container_port != port);
    ports.push(tcp_port(name, port));
}

pub(crate) fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub(crate) fn tcp_probe(port: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        timeout_seconds: Some(1),
        ..Default::default()
    }
}

/// Sleep before termination so endpoints drain first
pub(crate) fn pre_stop_sleep() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "/bin/sleep 10".to_string(),
                ]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Declarations shared by the synthesis tests

    use k8s_openapi::api::core::v1::PodSpec;
    use seldon_common::crd::{PredictiveUnit, SeldonPodSpec};

    use super::*;

    pub fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("example/{name}:1.0")),
            ..Default::default()
        }
    }

    pub fn unit(name: &str, children: Vec<PredictiveUnit>) -> PredictiveUnit {
        PredictiveUnit {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    pub fn component(containers: Vec<Container>) -> SeldonPodSpec {
        SeldonPodSpec {
            spec: PodSpec {
                containers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn predictor(name: &str, graph: PredictiveUnit, components: Vec<SeldonPodSpec>) -> PredictorSpec {
        PredictorSpec {
            name: name.to_string(),
            graph,
            component_specs: components,
            traffic: 100,
            ..Default::default()
        }
    }

    pub fn single_model() -> SeldonDeploymentSpec {
        SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("classifier", vec![]),
                vec![component(vec![container("classifier")])],
            )],
            ..Default::default()
        }
    }

    pub fn config() -> OperatorConfig {
        let mut config = OperatorConfig::default();
        config.executor.image = Some("seldonio/seldon-core-executor:1.18.0".to_string());
        config
    }

    pub fn normalize(spec: &SeldonDeploymentSpec, cluster: &ClusterConfig) -> NormalizedDeployment {
        seldon_graph::normalize("iris", "models", spec, &config(), cluster).unwrap()
    }

    pub fn run(spec: &SeldonDeploymentSpec) -> SynthesizedComponents {
        run_with(spec, &ClusterConfig::default())
    }

    pub fn run_with(spec: &SeldonDeploymentSpec, cluster: &ClusterConfig) -> SynthesizedComponents {
        synthesize(&normalize(spec, cluster), &config(), cluster).unwrap()
    }

    pub fn deployment<'a>(out: &'a SynthesizedComponents, name: &str) -> &'a Deployment {
        out.deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some(name))
            .unwrap_or_else(|| panic!("no deployment {name}"))
    }

    pub fn service<'a>(out: &'a SynthesizedComponents, name: &str) -> &'a Service {
        out.services
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name))
            .unwrap_or_else(|| panic!("no service {name}"))
    }

    pub fn pod_container<'a>(deployment: &'a Deployment, name: &str) -> &'a Container {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.iter().find(|c| c.name == name))
            .unwrap_or_else(|| panic!("no container {name}"))
    }
}
