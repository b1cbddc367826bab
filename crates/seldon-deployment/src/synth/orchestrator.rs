//! The service orchestrator container and its placement

use std::collections::BTreeMap;

use base64::Engine as _;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HTTPGetAction, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use seldon_common::{annotations, labels, naming, Error, Result};
use seldon_common::{PODINFO_MOUNT_PATH, PODINFO_VOLUME};
use seldon_graph::{GRPC_PORT_NAME, HTTP_PORT_NAME};

use super::workload::{add_labels, apply_pod_defaults, pod_spec_mut, rolling_update};
use super::{autoscale, tcp_port, Scope, ENGINE_CONTAINER_NAME};

/// The orchestrator container of a predictor
pub(crate) fn engine_container(scope: &Scope<'_>) -> Result<Container> {
    let executor = &scope.config.executor;
    let image = executor
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| Error::config("no executor image configured (RELATED_IMAGE_EXECUTOR)"))?;

    let mut env = vec![
        env_var("ENGINE_PREDICTOR", predictor_snapshot(scope)?),
        env_var("REQUEST_LOGGER_DEFAULT_ENDPOINT", executor.logger_endpoint.clone()),
    ];
    env.extend(scope.predictor.svc_orch_spec.env.iter().cloned());

    let args = vec![
        format!("--sdep={}", scope.name),
        format!("--namespace={}", scope.namespace),
        format!("--predictor={}", scope.predictor.name),
        format!("--http_port={}", executor.http_port),
        format!("--grpc_port={}", executor.grpc_port),
        format!("--protocol={}", scope.spec.protocol()),
        format!("--transport={}", scope.spec.transport()),
        format!("--prometheus_path={}", executor.prometheus_path),
        format!("--server_type={}", scope.spec.server_type()),
        format!("--log_work_buffer_size={}", scope.plan.logger_queue_size),
        format!("--log_write_timeout_ms={}", scope.plan.logger_write_timeout_ms),
        format!("--full_health_checks={}", executor.full_health_checks),
    ];

    Ok(Container {
        name: ENGINE_CONTAINER_NAME.to_string(),
        image: Some(image),
        args: Some(args),
        image_pull_policy: Some(executor.pull_policy.clone()),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        volume_mounts: Some(vec![VolumeMount {
            name: PODINFO_VOLUME.to_string(),
            mount_path: PODINFO_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        env: Some(env),
        ports: Some(vec![
            tcp_port(HTTP_PORT_NAME, executor.http_port),
            tcp_port(&executor.metrics_port_name, executor.http_port),
            tcp_port(GRPC_PORT_NAME, executor.grpc_port),
        ]),
        readiness_probe: Some(http_probe("/ready", executor.http_port)),
        liveness_probe: Some(http_probe("/live", executor.http_port)),
        resources: Some(engine_resources(scope)),
        security_context: executor.user.map(|uid| SecurityContext {
            run_as_user: Some(uid),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Base64 JSON of the predictor, with traffic and replicas zeroed so that
/// rescaling or reweighting does not restart the orchestrator
fn predictor_snapshot(scope: &Scope<'_>) -> Result<String> {
    let mut snapshot = scope.predictor.clone();
    snapshot.traffic = 0;
    snapshot.replicas = Some(0);
    let json = serde_json::to_vec(&snapshot)
        .map_err(|e| Error::serialization_for_kind("PredictorSpec", e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

fn engine_resources(scope: &Scope<'_>) -> ResourceRequirements {
    if let Some(resources) = scope
        .predictor
        .svc_orch_spec
        .resources
        .clone()
        .or_else(|| scope.predictor.engine_resources.clone())
    {
        return resources;
    }
    let executor = &scope.config.executor;
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities(&executor.cpu_request, &executor.memory_request)),
        limits: Some(quantities(&executor.cpu_limit, &executor.memory_limit)),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(20),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        success_threshold: Some(1),
        timeout_seconds: Some(60),
        ..Default::default()
    }
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

/// Inject the orchestrator as a sidecar of a component workload
pub(crate) fn co_locate(scope: &Scope<'_>, deployment: &mut Deployment) -> Result<()> {
    let engine = engine_container(scope)?;
    let pod = pod_spec_mut(deployment);
    pod.containers.retain(|c| c.name != ENGINE_CONTAINER_NAME);
    pod.containers.push(engine);

    let extra = BTreeMap::from([
        (labels::CONTAINS_SVC_ORCH.to_string(), "true".to_string()),
        (labels::SELDON_APP.to_string(), scope.predictor_service()),
    ]);
    add_labels(deployment, &extra, true);
    Ok(())
}

/// Single-container workload running only the orchestrator
pub(crate) fn dedicated_workload(scope: &Scope<'_>) -> Result<Deployment> {
    let name = naming::svc_orch_name(scope.name, &scope.predictor.name);
    let service = scope.predictor_service();
    let executor = &scope.config.executor;

    let selector = BTreeMap::from([
        (labels::SELDON_APP.to_string(), service.clone()),
        (labels::SELDON_ID.to_string(), scope.name.to_string()),
    ]);
    let mut template_labels = scope.predictor.labels.clone();
    template_labels.insert(labels::VERSION.to_string(), scope.version());
    template_labels.extend(selector.clone());
    template_labels.insert(labels::APP.to_string(), name.clone());

    let mut meta_labels = template_labels.clone();
    meta_labels.insert("svcorch".to_string(), "true".to_string());
    meta_labels.insert(labels::FLUENTD.to_string(), "true".to_string());

    let template_annotations = BTreeMap::from([
        (
            annotations::PROMETHEUS_PATH.to_string(),
            executor.prometheus_path.clone(),
        ),
        (annotations::PROMETHEUS_SCRAPE.to_string(), "true".to_string()),
    ]);

    let mut pod = PodSpec {
        containers: vec![engine_container(scope)?],
        service_account_name: Some(executor.service_account.clone()),
        security_context: Some(PodSecurityContext::default()),
        ..Default::default()
    };
    apply_pod_defaults(&mut pod);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(scope.namespace.to_string()),
            labels: Some(meta_labels),
            annotations: Some(scope.spec.annotations.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: autoscale::resolve_replicas(&[
                scope.predictor.svc_orch_spec.replicas,
                scope.predictor.replicas,
                scope.spec.replicas,
            ]),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    annotations: Some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            strategy: Some(rolling_update()),
            progress_deadline_seconds: scope.predictor.progress_deadline_seconds,
            ..Default::default()
        }),
        ..Default::default()
    })
}
