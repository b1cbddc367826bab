//! Internal per-container services and external predictor services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use seldon_common::crd::{role_labels, ComponentServiceStatus, PredictiveUnit, Transport};
use seldon_common::{annotations, labels, naming, MODEL_MOUNT_PATH};
use seldon_graph::{annotation_enabled, OrchestratorPlacement, GRPC_PORT_NAME, HTTP_PORT_NAME};
use seldon_graph::{named_port, METRICS_PORT_NAME};

use super::workload::{add_labels, pod_spec_mut};
use super::{env_default, port_default, pre_stop_sleep, tcp_probe, PredictorRoute, Scope};

/// Role labels of a unit plus the predictor's traffic tier
pub(crate) fn unit_labels(scope: &Scope<'_>, unit: &PredictiveUnit) -> BTreeMap<String, String> {
    let mut out = role_labels(unit);
    out.insert(tier_label(scope).to_string(), "true".to_string());
    out
}

fn tier_label(scope: &Scope<'_>) -> &'static str {
    if scope.predictor.shadow {
        labels::TIER_SHADOW
    } else if scope.predictor.traffic >= 50 {
        labels::TIER_DEFAULT
    } else {
        labels::TIER_CANARY
    }
}

/// Internal service for the container hosting `unit`
///
/// Also wires the container itself: its ports, probes, pre-stop hook and
/// the env vars identifying it to the runtime.
pub(crate) fn container_service(
    scope: &Scope<'_>,
    deployment: &mut Deployment,
    unit: &PredictiveUnit,
) -> Option<Service> {
    let endpoint = unit.endpoint.as_ref()?;
    let service_name =
        naming::container_service_name(scope.name, &scope.predictor.name, &unit.name);
    let selector_key = naming::container_service_key(&unit.name);
    let predictor_service = scope.predictor_service();

    let selector = BTreeMap::from([(selector_key.clone(), service_name.clone())]);
    add_labels(deployment, &selector, true);
    add_labels(deployment, &unit_labels(scope, unit), false);

    let grpc = scope.spec.transport() == Transport::Grpc || endpoint.is_grpc();
    let probe_port = if grpc { GRPC_PORT_NAME } else { HTTP_PORT_NAME };
    let predictor_labels =
        serde_json::to_string(&scope.predictor.labels).unwrap_or_else(|_| "{}".to_string());
    let prometheus_path = scope.config.executor.prometheus_path.clone();

    let pod = pod_spec_mut(deployment);
    let container = pod.containers.iter_mut().find(|c| c.name == unit.name)?;
    port_default(container, HTTP_PORT_NAME, endpoint.http_port);
    port_default(container, GRPC_PORT_NAME, endpoint.grpc_port);
    container
        .liveness_probe
        .get_or_insert_with(|| tcp_probe(probe_port, 60, 3));
    container
        .readiness_probe
        .get_or_insert_with(|| tcp_probe(probe_port, 20, 3));
    container.lifecycle.get_or_insert_with(pre_stop_sleep);

    let http = endpoint.http_port.to_string();
    let grpc_port = endpoint.grpc_port.to_string();
    env_default(container, "PREDICTIVE_UNIT_SERVICE_PORT", endpoint.service_port.to_string());
    env_default(container, "PREDICTIVE_UNIT_HTTP_SERVICE_PORT", http.clone());
    env_default(container, "MLSERVER_HTTP_PORT", http);
    env_default(container, "PREDICTIVE_UNIT_GRPC_SERVICE_PORT", grpc_port.clone());
    env_default(container, "MLSERVER_GRPC_PORT", grpc_port);
    if !unit.parameters.is_empty() {
        env_default(
            container,
            "PREDICTIVE_UNIT_PARAMETERS",
            PredictiveUnit::parameters_json(&unit.parameters),
        );
    }
    if unit.model_uri.as_deref().is_some_and(|u| !u.is_empty()) {
        env_default(container, "MLSERVER_MODEL_URI", MODEL_MOUNT_PATH);
    }
    let image = container.image.clone().unwrap_or_default();
    env_default(container, "PREDICTIVE_UNIT_ID", unit.name.clone());
    env_default(container, "MLSERVER_MODEL_NAME", unit.name.clone());
    env_default(container, "PREDICTIVE_UNIT_IMAGE", image);
    env_default(container, "PREDICTOR_ID", scope.predictor.name.clone());
    env_default(container, "PREDICTOR_LABELS", predictor_labels);
    env_default(container, "SELDON_DEPLOYMENT_ID", scope.name.to_string());
    env_default(
        container,
        "SELDON_EXECUTOR_ENABLED",
        scope.plan.placement.has_orchestrator().to_string(),
    );
    if let Some(metrics) = named_port(container, METRICS_PORT_NAME) {
        env_default(container, "PREDICTIVE_UNIT_METRICS_SERVICE_PORT", metrics.to_string());
        env_default(container, "PREDICTIVE_UNIT_METRICS_ENDPOINT", prometheus_path.clone());
        env_default(container, "MLSERVER_METRICS_PORT", metrics.to_string());
        env_default(container, "MLSERVER_METRICS_ENDPOINT", prometheus_path);
    }

    let mut svc_labels = BTreeMap::from([
        (selector_key, service_name.clone()),
        (labels::SELDON_ID.to_string(), scope.name.to_string()),
        (labels::SELDON_APP.to_string(), predictor_service),
    ]);
    svc_labels.extend(unit_labels(scope, unit));

    Some(Service {
        metadata: ObjectMeta {
            name: Some(service_name),
            namespace: Some(scope.namespace.to_string()),
            labels: Some(svc_labels),
            annotations: Some(scope.predictor.annotations.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![
                service_port(HTTP_PORT_NAME, endpoint.http_port),
                service_port(GRPC_PORT_NAME, endpoint.grpc_port),
            ]),
            type_: Some("ClusterIP".to_string()),
            session_affinity: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// External service of a predictor
///
/// With an orchestrator both of its ports are exposed. Without one the
/// service targets the single unit directly and exposes only the port of
/// the unit's transport.
pub(crate) fn predictor_service(
    scope: &Scope<'_>,
) -> (Service, ComponentServiceStatus, PredictorRoute) {
    let name = scope.predictor_service();
    let (http_port, grpc_port) = match scope.plan.placement {
        OrchestratorPlacement::Disabled => {
            let endpoint = scope.predictor.graph.endpoint.clone().unwrap_or_default();
            if scope.spec.transport() == Transport::Grpc || endpoint.is_grpc() {
                (0, endpoint.grpc_port)
            } else {
                (endpoint.http_port, 0)
            }
        }
        _ => (scope.config.executor.http_port, scope.config.executor.grpc_port),
    };

    let mut ports = Vec::new();
    if http_port > 0 {
        ports.push(service_port(HTTP_PORT_NAME, http_port));
    }
    if grpc_port > 0 {
        ports.push(service_port(GRPC_PORT_NAME, grpc_port));
    }

    let svc = external_service(scope, &name, ports);
    let status = service_status(scope, &name, http_port, grpc_port, "");
    let route = PredictorRoute {
        predictor: scope.predictor.name.clone(),
        service: name,
        http_port,
        grpc_port,
        traffic: scope.predictor.traffic,
        shadow: scope.predictor.shadow,
        version: scope.version(),
    };
    (svc, status, route)
}

/// Externally routed service selecting pods labeled `seldon-app=<name>`
pub(crate) fn external_service(scope: &Scope<'_>, name: &str, ports: Vec<ServicePort>) -> Service {
    let headless = annotation_enabled(scope.annotation(annotations::HEADLESS_SVC));
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(scope.namespace.to_string()),
            labels: Some(BTreeMap::from([
                (labels::SELDON_APP.to_string(), name.to_string()),
                (labels::SELDON_ID.to_string(), scope.name.to_string()),
                (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
            ])),
            annotations: Some(scope.predictor.annotations.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                labels::SELDON_APP.to_string(),
                name.to_string(),
            )])),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            session_affinity: Some("None".to_string()),
            cluster_ip: headless.then(|| "None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn service_status(
    scope: &Scope<'_>,
    name: &str,
    http_port: i32,
    grpc_port: i32,
    explainer_for: &str,
) -> ComponentServiceStatus {
    let endpoint = |port: i32| {
        if port > 0 {
            format!("{name}.{}:{port}", scope.namespace)
        } else {
            String::new()
        }
    };
    ComponentServiceStatus {
        svc_name: name.to_string(),
        http_endpoint: endpoint(http_port),
        grpc_endpoint: endpoint(grpc_port),
        explainer_for: explainer_for.to_string(),
    }
}

pub(crate) fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{env_value, SynthesizedComponents};
    use super::*;
    use seldon_common::crd::{Endpoint, EndpointType, Parameter, ParameterType};

    fn model_env<'a>(out: &'a SynthesizedComponents, name: &str) -> Option<&'a str> {
        let dep = deployment(out, "iris-default-0-classifier");
        env_value(pod_container(dep, "classifier"), name)
    }

    // =========================================================================
    // Container services
    // =========================================================================

    /// Story: every graph-unit container gets an internal service selecting
    /// only that container's pods, labeled with its role and traffic tier
    #[test]
    fn story_container_service_is_scoped_and_labeled() {
        let out = run(&single_model());
        let svc = service(&out, "iris-default-classifier");
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(
            spec.selector.as_ref().unwrap().get("seldon-app-svc-classifier").map(String::as_str),
            Some("iris-default-classifier")
        );
        let ports: Vec<_> = spec.ports.as_ref().unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![9000, 9500]);

        let svc_labels = svc.metadata.labels.as_ref().unwrap();
        assert!(svc_labels.contains_key(labels::ROLE_MODEL));
        assert!(svc_labels.contains_key(labels::TIER_DEFAULT));

        let dep = deployment(&out, "iris-default-0-classifier");
        let selector = dep.spec.as_ref().unwrap().selector.match_labels.as_ref().unwrap();
        assert!(selector.contains_key("seldon-app-svc-classifier"));
    }

    #[test]
    fn minority_traffic_is_canary() {
        let mut spec = single_model();
        spec.predictors[0].traffic = 20;
        let out = run(&spec);
        let svc_labels = service(&out, "iris-default-classifier")
            .metadata
            .labels
            .clone()
            .unwrap();
        assert!(svc_labels.contains_key(labels::TIER_CANARY));
    }

    /// Story: the runtime learns its identity and ports from env vars
    #[test]
    fn story_identity_env_vars() {
        let mut spec = single_model();
        spec.predictors[0].graph.parameters = vec![Parameter {
            name: "threshold".to_string(),
            value: "0.5".to_string(),
            type_: ParameterType::Float,
        }];
        let out = run(&spec);

        assert_eq!(model_env(&out, "PREDICTIVE_UNIT_ID"), Some("classifier"));
        assert_eq!(model_env(&out, "PREDICTOR_ID"), Some("default"));
        assert_eq!(model_env(&out, "SELDON_DEPLOYMENT_ID"), Some("iris"));
        assert_eq!(model_env(&out, "PREDICTIVE_UNIT_SERVICE_PORT"), Some("9000"));
        assert_eq!(model_env(&out, "PREDICTIVE_UNIT_IMAGE"), Some("example/classifier:1.0"));
        assert_eq!(model_env(&out, "PREDICTOR_LABELS"), Some(r#"{"version":"default"}"#));
        assert_eq!(model_env(&out, "PREDICTIVE_UNIT_METRICS_SERVICE_PORT"), Some("6000"));
        assert_eq!(model_env(&out, "PREDICTIVE_UNIT_METRICS_ENDPOINT"), Some("/prometheus"));
        assert!(model_env(&out, "PREDICTIVE_UNIT_PARAMETERS")
            .unwrap()
            .contains("threshold"));
    }

    #[test]
    fn probes_follow_transport() {
        let out = run(&single_model());
        let dep = deployment(&out, "iris-default-0-classifier");
        let model = pod_container(dep, "classifier");
        let probe = model.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::String("http".to_string())
        );
        assert!(model.lifecycle.as_ref().unwrap().pre_stop.is_some());

        let mut spec = single_model();
        spec.predictors[0].graph.endpoint = Some(Endpoint {
            type_: Some(EndpointType::Grpc),
            ..Default::default()
        });
        let out = run(&spec);
        let dep = deployment(&out, "iris-default-0-classifier");
        let probe = pod_container(dep, "classifier").liveness_probe.clone().unwrap();
        assert_eq!(probe.tcp_socket.unwrap().port, IntOrString::String("grpc".to_string()));
    }

    #[test]
    fn user_probes_are_kept() {
        let mut spec = single_model();
        spec.predictors[0].component_specs[0].spec.containers[0].readiness_probe =
            Some(tcp_probe("custom", 1, 1));
        let out = run(&spec);
        let dep = deployment(&out, "iris-default-0-classifier");
        let probe = pod_container(dep, "classifier").readiness_probe.clone().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(1));
    }

    // =========================================================================
    // Predictor services
    // =========================================================================

    #[test]
    fn predictor_service_exposes_orchestrator_ports() {
        let out = run(&single_model());
        let svc = service(&out, "iris-default");
        let spec = svc.spec.as_ref().unwrap();
        let ports: Vec<_> = spec.ports.as_ref().unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![8000, 5001]);
        assert_eq!(spec.cluster_ip, None);

        let status = &out.service_status["iris-default"];
        assert_eq!(status.http_endpoint, "iris-default.models:8000");
        assert_eq!(status.grpc_endpoint, "iris-default.models:5001");
    }

    #[test]
    fn headless_annotation_removes_cluster_ip() {
        let mut spec = single_model();
        spec.annotations
            .insert(annotations::HEADLESS_SVC.to_string(), "true".to_string());
        let out = run(&spec);
        let svc = service(&out, "iris-default");
        assert_eq!(svc.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn no_engine_grpc_unit_exposes_grpc_only() {
        let mut spec = single_model();
        spec.transport = Some(Transport::Grpc);
        spec.annotations
            .insert(annotations::NO_ENGINE.to_string(), "true".to_string());
        let out = run(&spec);
        let route = &out.routes[0];
        assert_eq!(route.http_port, 0);
        assert_eq!(route.grpc_port, 9500);
        assert_eq!(out.service_status["iris-default"].http_endpoint, "");
        assert!(out.address.is_none());
    }
}
