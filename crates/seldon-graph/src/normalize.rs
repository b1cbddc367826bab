//! Graph normalization
//!
//! Turns a partially specified declaration into a fully specified one:
//! unit types and implementations are defaulted, every hosted unit gets
//! HTTP/gRPC ports and an endpoint host while its container gets a metrics
//! port and the pod-metadata mount, prepackaged units get a container, and
//! each predictor's orchestrator placement is resolved.
//!
//! Ports a unit's endpoint already carries are kept, so normalizing an
//! already normalized declaration changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, VolumeMount};
use seldon_common::config::{ClusterConfig, OperatorConfig};
use seldon_common::crd::{
    Implementation, PredictiveUnit, PredictiveUnitType, PredictorSpec, Protocol,
    SeldonDeploymentSpec, SeldonPodSpec, Transport,
};
use seldon_common::{annotations, labels, naming, Error, Result};
use seldon_common::{PODINFO_MOUNT_PATH, PODINFO_VOLUME};
use tracing::debug;

/// Named container port carrying HTTP
pub const HTTP_PORT_NAME: &str = "http";
/// Named container port carrying gRPC
pub const GRPC_PORT_NAME: &str = "grpc";
/// Named container port carrying Prometheus metrics
pub const METRICS_PORT_NAME: &str = "metrics";
/// Host of units sharing the orchestrator's pod
pub const LOCALHOST: &str = "localhost";

/// Pod-metadata mount name used by declarations created before the rename
const LEGACY_PODINFO_VOLUME: &str = "podinfo";

// =============================================================================
// Placement
// =============================================================================

/// Where a predictor's service orchestrator runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorPlacement {
    /// In its own single-container workload
    Dedicated,
    /// As a sidecar in the workload of the component spec at this index
    CoLocated {
        /// Index into the predictor's component specs
        component: usize,
    },
    /// Not at all; the single graph unit is exposed directly
    Disabled,
}

impl OrchestratorPlacement {
    /// Whether an orchestrator container exists for the predictor
    pub fn has_orchestrator(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Per-predictor decisions made during normalization
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredictorPlan {
    /// Orchestrator placement
    pub placement: OrchestratorPlacement,
    /// Request-logger queue size for the orchestrator
    pub logger_queue_size: i64,
    /// Request-logger write timeout for the orchestrator
    pub logger_write_timeout_ms: i64,
}

/// A fully specified declaration plus the per-predictor plans
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedDeployment {
    /// Declaration name
    pub name: String,
    /// Declaration namespace
    pub namespace: String,
    /// Normalized spec
    pub spec: SeldonDeploymentSpec,
    /// Plans, index-aligned with `spec.predictors`
    pub plans: Vec<PredictorPlan>,
}

impl NormalizedDeployment {
    /// Predictors paired with their plans
    pub fn predictors(&self) -> impl Iterator<Item = (&PredictorSpec, &PredictorPlan)> {
        self.spec.predictors.iter().zip(self.plans.iter())
    }
}

/// Whether a switch-style annotation is turned on
///
/// Presence enables the knob unless the value is literally "false".
pub fn annotation_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().eq_ignore_ascii_case("false"))
}

/// Whether the orchestrator of `predictor` runs in a pod of its own
pub fn has_separate_pod(spec: &SeldonDeploymentSpec, predictor: &PredictorSpec) -> bool {
    annotation_enabled(spec.annotation(predictor, annotations::ENGINE_SEPARATE_POD))
}

/// Whether `predictor` runs without an orchestrator
pub fn has_no_engine(spec: &SeldonDeploymentSpec, predictor: &PredictorSpec) -> bool {
    annotation_enabled(spec.annotation(predictor, annotations::NO_ENGINE))
}

// =============================================================================
// Port allocation
// =============================================================================

/// Hands out ports by container name, skipping numbers already claimed
struct PortCounter {
    next: i32,
    used: BTreeSet<i32>,
    by_name: BTreeMap<String, i32>,
}

impl PortCounter {
    fn new(base: i32, used: BTreeSet<i32>) -> Self {
        Self {
            next: base,
            used,
            by_name: BTreeMap::new(),
        }
    }

    fn take(&mut self) -> i32 {
        while self.used.contains(&self.next) {
            self.next += 1;
        }
        let port = self.next;
        self.used.insert(port);
        self.next += 1;
        port
    }

    /// Port for a container name; a pinned number wins and is remembered
    fn resolve(&mut self, name: &str, pinned: Option<i32>) -> i32 {
        if let Some(port) = pinned {
            self.by_name.entry(name.to_string()).or_insert(port);
            return port;
        }
        if let Some(port) = self.by_name.get(name) {
            return *port;
        }
        let port = self.take();
        self.by_name.insert(name.to_string(), port);
        port
    }
}

struct PortAllocator {
    http: PortCounter,
    grpc: PortCounter,
    metrics: PortCounter,
}

impl PortAllocator {
    /// Seed the counters with every port the declaration already claims
    fn new(config: &OperatorConfig, spec: &SeldonDeploymentSpec) -> Self {
        let containers = || {
            spec.predictors
                .iter()
                .flat_map(|p| &p.component_specs)
                .flat_map(|c| &c.spec.containers)
        };
        let endpoints = || {
            spec.predictors
                .iter()
                .flat_map(|p| p.graph.units())
                .filter_map(|u| u.endpoint.as_ref())
        };

        let mut http: BTreeSet<i32> = containers()
            .filter_map(|c| named_port(c, HTTP_PORT_NAME))
            .collect();
        http.extend(endpoints().map(|e| e.http_port).filter(|p| *p != 0));

        let mut grpc: BTreeSet<i32> = containers()
            .filter_map(|c| named_port(c, GRPC_PORT_NAME))
            .collect();
        grpc.extend(endpoints().map(|e| e.grpc_port).filter(|p| *p != 0));

        let metrics = containers()
            .filter_map(|c| named_port(c, METRICS_PORT_NAME))
            .collect();

        Self {
            http: PortCounter::new(config.ports.http, http),
            grpc: PortCounter::new(config.ports.grpc, grpc),
            metrics: PortCounter::new(config.ports.metrics, metrics),
        }
    }
}

/// Container port number with the given name
pub fn named_port(container: &Container, name: &str) -> Option<i32> {
    container
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.container_port)
}

// =============================================================================
// Normalization
// =============================================================================

struct Scope<'a> {
    name: &'a str,
    namespace: &'a str,
    protocol: Protocol,
    transport: Transport,
}

/// Normalize a declaration
///
/// Fails only when a configuration value carried on the declaration, such
/// as an orchestrator logger annotation, is malformed.
pub fn normalize(
    name: &str,
    namespace: &str,
    spec: &SeldonDeploymentSpec,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> Result<NormalizedDeployment> {
    let mut spec = spec.clone();
    let mut ports = PortAllocator::new(config, &spec);
    let scope = Scope {
        name,
        namespace,
        protocol: spec.protocol(),
        transport: spec.transport(),
    };
    let separate: Vec<bool> = spec
        .predictors
        .iter()
        .map(|p| has_separate_pod(&spec, p))
        .collect();

    for (predictor, separate) in spec.predictors.iter_mut().zip(separate) {
        normalize_predictor(&scope, predictor, separate, &mut ports, config, cluster);
    }

    let plans = spec
        .predictors
        .iter()
        .map(|p| resolve_plan(&spec, p, config))
        .collect::<Result<Vec<_>>>()?;

    debug!(
        deployment = name,
        predictors = spec.predictors.len(),
        "normalized deployment"
    );
    Ok(NormalizedDeployment {
        name: name.to_string(),
        namespace: namespace.to_string(),
        spec,
        plans,
    })
}

fn normalize_predictor(
    scope: &Scope<'_>,
    predictor: &mut PredictorSpec,
    separate: bool,
    ports: &mut PortAllocator,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) {
    predictor
        .labels
        .entry(labels::VERSION.to_string())
        .or_insert_with(|| predictor.name.clone());

    default_graph(&mut predictor.graph);

    let predictor_name = predictor.name.clone();
    for (index, component) in predictor.component_specs.iter_mut().enumerate() {
        for container in component.spec.containers.iter_mut() {
            if let Some(unit) = predictor.graph.find_mut(&container.name) {
                let host = unit_host(scope, &predictor_name, &container.name, index, separate);
                apply_unit_defaults(scope, host, ports, unit, container);
            }
        }
    }

    inject_prepack_containers(scope, predictor, separate, ports, config, cluster);
}

/// Fill in unit type and implementation throughout the graph
fn default_graph(graph: &mut PredictiveUnit) {
    graph.walk_mut(&mut |unit| {
        if unit.type_.is_none() && unit.methods.is_none() && unit.implementation.is_none() {
            unit.type_ = Some(PredictiveUnitType::Model);
        }
        if unit.implementation.is_none() {
            unit.implementation = Some(Implementation::Unknown);
        } else if unit.is_prepack() {
            unit.type_ = Some(PredictiveUnitType::Model);
        }
    });
}

fn unit_host(
    scope: &Scope<'_>,
    predictor: &str,
    container: &str,
    component: usize,
    separate: bool,
) -> String {
    if component == 0 && !separate {
        LOCALHOST.to_string()
    } else {
        let service = naming::container_service_name(scope.name, predictor, container);
        naming::service_host(&service, scope.namespace)
    }
}

fn apply_unit_defaults(
    scope: &Scope<'_>,
    host: String,
    ports: &mut PortAllocator,
    unit: &mut PredictiveUnit,
    container: &mut Container,
) {
    let endpoint = unit.endpoint.get_or_insert_with(Default::default);

    let pinned_http = named_port(container, HTTP_PORT_NAME)
        .or(Some(endpoint.http_port).filter(|p| *p != 0));
    let pinned_grpc = named_port(container, GRPC_PORT_NAME)
        .or(Some(endpoint.grpc_port).filter(|p| *p != 0));
    let http = ports.http.resolve(&container.name, pinned_http);
    let grpc = ports.grpc.resolve(&container.name, pinned_grpc);

    add_podinfo_mount(container);
    if named_port(container, METRICS_PORT_NAME).is_none() {
        container.ports.get_or_insert_with(Vec::new).push(ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: ports.metrics.take(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    endpoint.service_host = host;
    endpoint.service_port = if endpoint.is_grpc() || scope.transport == Transport::Grpc {
        grpc
    } else {
        http
    };
    endpoint.http_port = http;
    endpoint.grpc_port = grpc;
}

/// Ensure the pod-metadata mount, replacing the legacy-named one
fn add_podinfo_mount(container: &mut Container) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.retain(|m| m.name != LEGACY_PODINFO_VOLUME);
    if !mounts.iter().any(|m| m.name == PODINFO_VOLUME) {
        mounts.push(podinfo_mount());
    }
}

fn podinfo_mount() -> VolumeMount {
    VolumeMount {
        name: PODINFO_VOLUME.to_string(),
        mount_path: PODINFO_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// Give every prepackaged unit a container, in graph pre-order
///
/// A unit without a container gets a new one appended to the first
/// component spec, which is created when the predictor has none.
fn inject_prepack_containers(
    scope: &Scope<'_>,
    predictor: &mut PredictorSpec,
    separate: bool,
    ports: &mut PortAllocator,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) {
    let prepack: Vec<String> = predictor
        .graph
        .units()
        .into_iter()
        .filter(|u| u.is_prepack())
        .map(|u| u.name.clone())
        .collect();

    for unit_name in prepack {
        let existing = predictor.component_index_for(&unit_name);
        let mut container = existing
            .and_then(|i| predictor.component_specs[i].container(&unit_name).cloned())
            .unwrap_or_else(|| Container {
                name: unit_name.clone(),
                volume_mounts: Some(vec![podinfo_mount()]),
                ..Default::default()
            });

        let host = unit_host(
            scope,
            &predictor.name,
            &unit_name,
            existing.unwrap_or(0),
            separate,
        );
        let Some(unit) = predictor.graph.find_mut(&unit_name) else {
            continue;
        };
        apply_unit_defaults(scope, host, ports, unit, &mut container);

        let has_image = container.image.as_deref().is_some_and(|i| !i.is_empty());
        if !has_image && scope.protocol != Protocol::Tensorflow {
            if let Some(implementation) = unit.implementation.as_ref() {
                container.image =
                    cluster.prepack_image(implementation, &scope.protocol, &config.related_images);
            }
        }

        match existing {
            Some(index) => {
                let containers = &mut predictor.component_specs[index].spec.containers;
                if let Some(slot) = containers.iter_mut().find(|c| c.name == unit_name) {
                    *slot = container;
                }
            }
            None => match predictor.component_specs.first_mut() {
                Some(first) => first.spec.containers.push(container),
                None => predictor.component_specs.push(SeldonPodSpec {
                    spec: PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    },
                    ..Default::default()
                }),
            },
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

fn resolve_plan(
    spec: &SeldonDeploymentSpec,
    predictor: &PredictorSpec,
    config: &OperatorConfig,
) -> Result<PredictorPlan> {
    let placement = if has_no_engine(spec, predictor) {
        OrchestratorPlacement::Disabled
    } else if has_separate_pod(spec, predictor) {
        OrchestratorPlacement::Dedicated
    } else {
        // The orchestrator joins the workload of the first unit addressed
        // as localhost.
        predictor
            .graph
            .units()
            .into_iter()
            .find(|u| {
                u.endpoint
                    .as_ref()
                    .is_some_and(|e| e.service_host == LOCALHOST)
            })
            .and_then(|u| predictor.component_index_for(&u.name))
            .map(|component| OrchestratorPlacement::CoLocated { component })
            .unwrap_or(OrchestratorPlacement::Dedicated)
    };

    let int_annotation = |key: &str, default: i64| -> Result<i64> {
        match spec.annotation(predictor, key) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                Error::config(format!(
                    "annotation {key} on predictor {} is not an integer: {raw}",
                    predictor.name
                ))
            }),
            None => Ok(default),
        }
    };

    Ok(PredictorPlan {
        placement,
        logger_queue_size: int_annotation(
            annotations::LOGGER_QUEUE_SIZE,
            config.executor.logger_queue_size,
        )?,
        logger_write_timeout_ms: int_annotation(
            annotations::LOGGER_WRITE_TIMEOUT_MS,
            config.executor.logger_write_timeout_ms,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use seldon_common::config::{PredictorImageConfig, PredictorServerConfig};
    use seldon_common::crd::EndpointType;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("example/{name}:1.0")),
            ..Default::default()
        }
    }

    fn unit(name: &str, children: Vec<PredictiveUnit>) -> PredictiveUnit {
        PredictiveUnit {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    fn component(containers: Vec<Container>) -> SeldonPodSpec {
        SeldonPodSpec {
            spec: PodSpec {
                containers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn predictor(
        name: &str,
        graph: PredictiveUnit,
        components: Vec<SeldonPodSpec>,
    ) -> PredictorSpec {
        PredictorSpec {
            name: name.to_string(),
            graph,
            component_specs: components,
            traffic: 100,
            ..Default::default()
        }
    }

    fn single_model() -> SeldonDeploymentSpec {
        SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("classifier", vec![]),
                vec![component(vec![container("classifier")])],
            )],
            ..Default::default()
        }
    }

    fn sklearn_cluster() -> ClusterConfig {
        let mut protocols = BTreeMap::new();
        protocols.insert(
            "seldon".to_string(),
            PredictorImageConfig {
                image: "seldonio/sklearnserver".to_string(),
                default_image_version: "1.18.0".to_string(),
            },
        );
        let mut cluster = ClusterConfig::default();
        cluster
            .predictor_servers
            .insert("SKLEARN_SERVER".to_string(), PredictorServerConfig { protocols });
        cluster
    }

    fn run(spec: &SeldonDeploymentSpec) -> NormalizedDeployment {
        normalize(
            "iris",
            "models",
            spec,
            &OperatorConfig::default(),
            &ClusterConfig::default(),
        )
        .unwrap()
    }

    // =========================================================================
    // Defaults and ports
    // =========================================================================

    /// Story: a single REST model with no explicit ports gets the base ports
    /// and is addressed as localhost next to its orchestrator
    #[test]
    fn story_single_model_gets_base_ports_and_localhost() {
        let normalized = run(&single_model());
        let p = &normalized.spec.predictors[0];
        let endpoint = p.graph.endpoint.as_ref().unwrap();

        assert_eq!(endpoint.service_host, LOCALHOST);
        assert_eq!(endpoint.http_port, 9000);
        assert_eq!(endpoint.grpc_port, 9500);
        assert_eq!(endpoint.service_port, 9000);
        assert_eq!(p.graph.type_, Some(PredictiveUnitType::Model));
        assert_eq!(p.graph.implementation, Some(Implementation::Unknown));
        assert_eq!(p.labels.get("version").map(String::as_str), Some("default"));

        let con = &p.component_specs[0].spec.containers[0];
        assert_eq!(named_port(con, METRICS_PORT_NAME), Some(6000));
        assert!(con
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == PODINFO_VOLUME && m.mount_path == PODINFO_MOUNT_PATH));

        assert_eq!(
            normalized.plans[0].placement,
            OrchestratorPlacement::CoLocated { component: 0 }
        );
    }

    /// Story: normalizing twice gives the same declaration
    #[test]
    fn story_normalization_is_idempotent() {
        let mut spec = single_model();
        spec.predictors[0].graph.children = vec![unit("transformer", vec![])];
        spec.predictors[0]
            .component_specs
            .push(component(vec![container("transformer")]));

        let once = run(&spec);
        let twice = run(&once.spec);
        assert_eq!(once, twice);
    }

    /// Story: idempotence holds when prepackaged containers are appended
    /// ahead of user containers in later component specs
    #[test]
    fn story_prepack_injection_is_idempotent() {
        let mut model = unit("model", vec![]);
        model.implementation = Some(Implementation::SklearnServer);
        model.model_uri = Some("gs://models/iris".to_string());
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("router", vec![model, unit("other", vec![])]),
                vec![
                    component(vec![container("router")]),
                    component(vec![container("other")]),
                ],
            )],
            ..Default::default()
        };
        let cluster = sklearn_cluster();
        let config = OperatorConfig::default();

        let once = normalize("iris", "models", &spec, &config, &cluster).unwrap();
        let twice = normalize("iris", "models", &once.spec, &config, &cluster).unwrap();
        assert_eq!(once, twice);
    }

    /// Story: each container name gets its own HTTP port and gRPC port
    #[test]
    fn story_ports_are_unique_per_container() {
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("a", vec![unit("b", vec![]), unit("c", vec![])]),
                vec![
                    component(vec![container("a"), container("b")]),
                    component(vec![container("c")]),
                ],
            )],
            ..Default::default()
        };
        let normalized = run(&spec);
        let graph = &normalized.spec.predictors[0].graph;

        let http: BTreeSet<i32> = graph
            .units()
            .iter()
            .map(|u| u.endpoint.as_ref().unwrap().http_port)
            .collect();
        assert_eq!(http, BTreeSet::from([9000, 9001, 9002]));

        let metrics: BTreeSet<i32> = normalized.spec.predictors[0]
            .component_specs
            .iter()
            .flat_map(|c| &c.spec.containers)
            .filter_map(|c| named_port(c, METRICS_PORT_NAME))
            .collect();
        assert_eq!(metrics.len(), 3);
    }

    #[test]
    fn existing_named_port_wins_and_is_skipped_by_allocator() {
        let mut a = container("a");
        a.ports = Some(vec![ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: 9000,
            ..Default::default()
        }]);
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("b", vec![unit("a", vec![])]),
                vec![component(vec![container("b"), a])],
            )],
            ..Default::default()
        };
        let normalized = run(&spec);
        let graph = &normalized.spec.predictors[0].graph;
        assert_eq!(graph.endpoint.as_ref().unwrap().http_port, 9001);
        assert_eq!(graph.find("a").unwrap().endpoint.as_ref().unwrap().http_port, 9000);
    }

    #[test]
    fn grpc_units_use_grpc_service_port() {
        let mut spec = single_model();
        spec.predictors[0].graph.endpoint = Some(seldon_common::crd::Endpoint {
            type_: Some(EndpointType::Grpc),
            ..Default::default()
        });
        let normalized = run(&spec);
        let endpoint = normalized.spec.predictors[0].graph.endpoint.clone().unwrap();
        assert_eq!(endpoint.service_port, endpoint.grpc_port);

        let mut spec = single_model();
        spec.transport = Some(Transport::Grpc);
        let normalized = run(&spec);
        let endpoint = normalized.spec.predictors[0].graph.endpoint.clone().unwrap();
        assert_eq!(endpoint.service_port, 9500);
    }

    #[test]
    fn legacy_podinfo_mount_is_replaced() {
        let mut spec = single_model();
        spec.predictors[0].component_specs[0].spec.containers[0].volume_mounts =
            Some(vec![VolumeMount {
                name: LEGACY_PODINFO_VOLUME.to_string(),
                mount_path: PODINFO_MOUNT_PATH.to_string(),
                ..Default::default()
            }]);
        let normalized = run(&spec);
        let mounts = normalized.spec.predictors[0].component_specs[0].spec.containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, PODINFO_VOLUME);
    }

    #[test]
    fn non_first_components_get_service_hosts() {
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("a", vec![unit("b", vec![])]),
                vec![component(vec![container("a")]), component(vec![container("b")])],
            )],
            ..Default::default()
        };
        let normalized = run(&spec);
        let b = normalized.spec.predictors[0].graph.find("b").unwrap();
        assert_eq!(
            b.endpoint.as_ref().unwrap().service_host,
            "iris-default-b.models.svc.cluster.local"
        );
    }

    // =========================================================================
    // Prepackaged servers
    // =========================================================================

    /// Story: a prepackaged unit with no container gets one, with the
    /// configured server image, in a newly created component spec
    #[test]
    fn story_prepack_unit_gets_container() {
        let mut model = unit("classifier", vec![]);
        model.implementation = Some(Implementation::SklearnServer);
        model.model_uri = Some("gs://models/iris".to_string());
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor("default", model, vec![])],
            ..Default::default()
        };

        let normalized = normalize(
            "iris",
            "models",
            &spec,
            &OperatorConfig::default(),
            &sklearn_cluster(),
        )
        .unwrap();
        let p = &normalized.spec.predictors[0];
        assert_eq!(p.component_specs.len(), 1);
        let con = &p.component_specs[0].spec.containers[0];
        assert_eq!(con.name, "classifier");
        assert_eq!(con.image.as_deref(), Some("seldonio/sklearnserver:1.18.0"));
        assert_eq!(p.graph.type_, Some(PredictiveUnitType::Model));
        assert_eq!(p.graph.endpoint.as_ref().unwrap().service_host, LOCALHOST);
        assert_eq!(
            normalized.plans[0].placement,
            OrchestratorPlacement::CoLocated { component: 0 }
        );
    }

    #[test]
    fn tensorflow_protocol_leaves_prepack_image_unset() {
        let mut model = unit("classifier", vec![]);
        model.implementation = Some(Implementation::SklearnServer);
        let spec = SeldonDeploymentSpec {
            protocol: Some(Protocol::Tensorflow),
            predictors: vec![predictor("default", model, vec![])],
            ..Default::default()
        };
        let normalized = normalize(
            "iris",
            "models",
            &spec,
            &OperatorConfig::default(),
            &sklearn_cluster(),
        )
        .unwrap();
        let con = &normalized.spec.predictors[0].component_specs[0].spec.containers[0];
        assert!(con.image.is_none());
    }

    #[test]
    fn prepack_containers_append_to_first_component() {
        let mut model = unit("model", vec![]);
        model.implementation = Some(Implementation::XgboostServer);
        let spec = SeldonDeploymentSpec {
            predictors: vec![predictor(
                "default",
                unit("transformer", vec![model]),
                vec![component(vec![container("transformer")])],
            )],
            ..Default::default()
        };
        let normalized = run(&spec);
        let names: Vec<_> = normalized.spec.predictors[0].component_specs[0]
            .spec
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["transformer", "model"]);
    }

    // =========================================================================
    // Placement
    // =========================================================================

    #[test]
    fn separate_pod_annotation_gives_dedicated_orchestrator() {
        let mut spec = single_model();
        spec.annotations
            .insert(annotations::ENGINE_SEPARATE_POD.to_string(), "true".to_string());
        let normalized = run(&spec);
        assert_eq!(normalized.plans[0].placement, OrchestratorPlacement::Dedicated);
        let endpoint = normalized.spec.predictors[0].graph.endpoint.clone().unwrap();
        assert_eq!(
            endpoint.service_host,
            "iris-default-classifier.models.svc.cluster.local"
        );
    }

    #[test]
    fn no_engine_annotation_disables_orchestrator() {
        let mut spec = single_model();
        spec.predictors[0]
            .annotations
            .insert(annotations::NO_ENGINE.to_string(), "true".to_string());
        let normalized = run(&spec);
        assert_eq!(normalized.plans[0].placement, OrchestratorPlacement::Disabled);
        assert!(!normalized.plans[0].placement.has_orchestrator());
    }

    #[test]
    fn false_annotation_values_are_off() {
        assert!(!annotation_enabled(Some("false")));
        assert!(!annotation_enabled(Some("False")));
        assert!(!annotation_enabled(None));
        assert!(annotation_enabled(Some("")));
        assert!(annotation_enabled(Some("true")));
    }

    // =========================================================================
    // Logger knobs
    // =========================================================================

    #[test]
    fn logger_annotations_override_config() {
        let mut spec = single_model();
        spec.predictors[0]
            .annotations
            .insert(annotations::LOGGER_QUEUE_SIZE.to_string(), "20".to_string());
        let normalized = run(&spec);
        assert_eq!(normalized.plans[0].logger_queue_size, 20);
        assert_eq!(
            normalized.plans[0].logger_write_timeout_ms,
            OperatorConfig::default().executor.logger_write_timeout_ms
        );
    }

    #[test]
    fn malformed_logger_annotation_is_a_config_error() {
        let mut spec = single_model();
        spec.annotations.insert(
            annotations::LOGGER_WRITE_TIMEOUT_MS.to_string(),
            "soon".to_string(),
        );
        let err = normalize(
            "iris",
            "models",
            &spec,
            &OperatorConfig::default(),
            &ClusterConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(!err.is_retryable());
    }
}
