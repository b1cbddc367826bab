//! Prepackaged model servers
//!
//! A unit naming a recognized server gets that runtime wired into its
//! workload, and its artifact provisioned next to it.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, HTTPGetAction, PodSpec, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use seldon_common::crd::{Implementation, Parameter, ParameterType, PredictiveUnit, Protocol};
use seldon_common::{Error, Result, MODEL_MOUNT_PATH};
use seldon_graph::{GRPC_PORT_NAME, HTTP_PORT_NAME};

use super::initializer::{self, Provision};
use super::workload::pod_spec_mut;
use super::{
    env_default, port_override, tcp_port, Scope, TFSERVING_CONTAINER_NAME, TFSERVING_GRPC_PORT,
    TFSERVING_REST_PORT,
};

const TRITON_USER: i64 = 1000;

/// Wire the prepackaged server of `unit` into `deployment`
pub(crate) fn inject(
    scope: &Scope<'_>,
    deployment: &mut Deployment,
    unit: &PredictiveUnit,
) -> Result<()> {
    let pod = pod_spec_mut(deployment);
    if let Some(account) = unit.service_account_name.as_ref().filter(|a| !a.is_empty()) {
        pod.service_account_name = Some(account.clone());
    }

    let implementation = unit
        .implementation
        .clone()
        .unwrap_or(Implementation::Unknown);
    let protocol = scope.spec.protocol();

    let target = match implementation {
        Implementation::TensorflowServer => tensorflow(scope, pod, unit, &implementation)?,
        Implementation::TritonServer => {
            triton(scope, pod, unit, &implementation);
            unit.name.clone()
        }
        _ if protocol.is_v2() => {
            mlserver(scope, pod, unit, &implementation);
            unit.name.clone()
        }
        _ => {
            default_server(scope, pod, unit, &implementation);
            unit.name.clone()
        }
    };

    if let Some(uri) = unit.model_uri.as_deref() {
        let provision = Provision {
            uri,
            env_secret_ref: unit.env_secret_ref_name.as_deref(),
            image: unit.storage_initializer_image.as_deref(),
        };
        initializer::inject(scope, pod, &target, &provision)?;
    }
    Ok(())
}

fn unit_container<'a>(pod: &'a mut PodSpec, unit: &PredictiveUnit) -> Option<&'a mut Container> {
    pod.containers.iter_mut().find(|c| c.name == unit.name)
}

fn fill_image(
    scope: &Scope<'_>,
    container: &mut Container,
    implementation: &Implementation,
    protocol: &Protocol,
) {
    if container.image.as_deref().is_some_and(|i| !i.is_empty()) {
        return;
    }
    container.image = scope
        .cluster
        .prepack_image(implementation, protocol, &scope.config.related_images);
}

fn string_param(name: &str, value: impl Into<String>) -> Parameter {
    Parameter {
        name: name.to_string(),
        value: value.into(),
        type_: ParameterType::Text,
    }
}

/// Parameters plus any extras the unit does not already define
fn with_params(unit: &PredictiveUnit, extras: Vec<Parameter>) -> String {
    let mut params = unit.parameters.clone();
    for extra in extras {
        if !params.iter().any(|p| p.name == extra.name) {
            params.push(extra);
        }
    }
    PredictiveUnit::parameters_json(&params)
}

// =============================================================================
// TensorFlow Serving
// =============================================================================

/// Returns the name of the container serving the artifact
fn tensorflow(
    scope: &Scope<'_>,
    pod: &mut PodSpec,
    unit: &PredictiveUnit,
    implementation: &Implementation,
) -> Result<String> {
    let endpoint = unit.endpoint.clone().unwrap_or_default();

    if scope.spec.protocol() == Protocol::Tensorflow {
        if let Some(container) = unit_container(pod, unit) {
            fill_image(scope, container, implementation, &Protocol::Tensorflow);
            container.args.get_or_insert_with(|| {
                tfserving_args(&unit.name, endpoint.grpc_port, endpoint.http_port)
            });
            port_override(container, HTTP_PORT_NAME, endpoint.http_port);
            port_override(container, GRPC_PORT_NAME, endpoint.grpc_port);
        }
        return Ok(unit.name.clone());
    }

    if let Some(container) = unit_container(pod, unit) {
        fill_image(scope, container, implementation, &Protocol::Seldon);
        env_default(
            container,
            "PREDICTIVE_UNIT_PARAMETERS",
            with_params(
                unit,
                vec![
                    string_param("rest_endpoint", format!("http://0.0.0.0:{TFSERVING_REST_PORT}")),
                    string_param("grpc_endpoint", format!("0.0.0.0:{TFSERVING_GRPC_PORT}")),
                    string_param("model_name", unit.name.clone()),
                ],
            ),
        );
    }

    let image = scope
        .cluster
        .prepack_image(implementation, &Protocol::Tensorflow, &scope.config.related_images);
    if !pod.containers.iter().any(|c| c.name == TFSERVING_CONTAINER_NAME) {
        pod.containers.push(Container {
            name: TFSERVING_CONTAINER_NAME.to_string(),
            ..Default::default()
        });
    }
    let Some(tfserving) = pod
        .containers
        .iter_mut()
        .find(|c| c.name == TFSERVING_CONTAINER_NAME)
    else {
        return Ok(unit.name.clone());
    };
    if !tfserving.image.as_deref().is_some_and(|i| !i.is_empty()) {
        tfserving.image = Some(image.ok_or_else(|| {
            Error::synthesis(
                &unit.name,
                "no tensorflow image configured for TENSORFLOW_SERVER",
            )
        })?);
    }
    tfserving.args.get_or_insert_with(|| {
        tfserving_args(&unit.name, TFSERVING_GRPC_PORT, TFSERVING_REST_PORT)
    });
    tfserving
        .image_pull_policy
        .get_or_insert_with(|| "IfNotPresent".to_string());
    if !tfserving.ports.as_ref().is_some_and(|p| !p.is_empty()) {
        tfserving.ports = Some(vec![
            tcp_port(GRPC_PORT_NAME, TFSERVING_GRPC_PORT),
            tcp_port(HTTP_PORT_NAME, TFSERVING_REST_PORT),
        ]);
    }
    Ok(TFSERVING_CONTAINER_NAME.to_string())
}

fn tfserving_args(model: &str, grpc: i32, rest: i32) -> Vec<String> {
    vec![
        "/usr/bin/tensorflow_model_server".to_string(),
        format!("--port={grpc}"),
        format!("--rest_api_port={rest}"),
        format!("--model_name={model}"),
        format!("--model_base_path={MODEL_MOUNT_PATH}"),
    ]
}

// =============================================================================
// Triton and MLServer
// =============================================================================

fn v2_probe(path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(HTTP_PORT_NAME.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(1),
        period_seconds: Some(10),
        ..Default::default()
    }
}

fn triton(
    scope: &Scope<'_>,
    pod: &mut PodSpec,
    unit: &PredictiveUnit,
    implementation: &Implementation,
) {
    let endpoint = unit.endpoint.clone().unwrap_or_default();
    let Some(container) = unit_container(pod, unit) else {
        return;
    };
    fill_image(scope, container, implementation, &scope.spec.protocol());
    container.args.get_or_insert_with(|| {
        vec![
            "/opt/tritonserver/bin/tritonserver".to_string(),
            format!("--grpc-port={}", endpoint.grpc_port),
            format!("--http-port={}", endpoint.http_port),
            format!("--model-repository={MODEL_MOUNT_PATH}"),
            "--strict-model-config=false".to_string(),
        ]
    });
    port_override(container, GRPC_PORT_NAME, endpoint.grpc_port);
    port_override(container, HTTP_PORT_NAME, endpoint.http_port);
    container
        .readiness_probe
        .get_or_insert_with(|| v2_probe("/v2/health/ready", 20));
    container
        .liveness_probe
        .get_or_insert_with(|| v2_probe("/v2/health/live", 60));
    container
        .security_context
        .get_or_insert_with(Default::default)
        .run_as_user
        .get_or_insert(TRITON_USER);
}

/// MLServer runtime class for an implementation
fn mlserver_runtime(implementation: &Implementation) -> &'static str {
    match implementation {
        Implementation::SklearnServer => "mlserver_sklearn.SKLearnModel",
        Implementation::XgboostServer => "mlserver_xgboost.XGBoostModel",
        Implementation::MlflowServer => "mlserver_mlflow.MLflowRuntime",
        Implementation::TempoServer => "tempo.mlserver.InferenceRuntime",
        _ => "",
    }
}

fn mlserver(
    scope: &Scope<'_>,
    pod: &mut PodSpec,
    unit: &PredictiveUnit,
    implementation: &Implementation,
) {
    let endpoint = unit.endpoint.clone().unwrap_or_default();
    let Some(container) = unit_container(pod, unit) else {
        return;
    };
    fill_image(scope, container, implementation, &scope.spec.protocol());

    let tempo_options = serde_json::json!({
        "k8s_options": {
            "defaultRuntime": "tempo.seldon.SeldonKubernetesRuntime",
            "namespace": scope.namespace,
        }
    });
    env_default(container, "MLSERVER_HTTP_PORT", endpoint.http_port.to_string());
    env_default(container, "MLSERVER_GRPC_PORT", endpoint.grpc_port.to_string());
    env_default(container, "MLSERVER_MODEL_IMPLEMENTATION", mlserver_runtime(implementation));
    env_default(container, "MLSERVER_MODEL_NAME", unit.name.clone());
    env_default(container, "MLSERVER_MODEL_VERSION", "v1");
    env_default(container, "MLSERVER_MODEL_URI", MODEL_MOUNT_PATH);
    env_default(container, "TEMPO_RUNTIME_OPTIONS", tempo_options.to_string());

    port_override(container, HTTP_PORT_NAME, endpoint.http_port);
    port_override(container, GRPC_PORT_NAME, endpoint.grpc_port);
    container
        .readiness_probe
        .get_or_insert_with(|| v2_probe("/v2/health/ready", 20));
    container
        .liveness_probe
        .get_or_insert_with(|| v2_probe("/v2/health/live", 60));
}

fn default_server(
    scope: &Scope<'_>,
    pod: &mut PodSpec,
    unit: &PredictiveUnit,
    implementation: &Implementation,
) {
    let Some(container) = unit_container(pod, unit) else {
        return;
    };
    fill_image(scope, container, implementation, &scope.spec.protocol());
    let extras = if unit.model_uri.as_deref().is_some_and(|u| !u.is_empty()) {
        vec![string_param("model_uri", MODEL_MOUNT_PATH)]
    } else {
        Vec::new()
    };
    env_default(container, "PREDICTIVE_UNIT_PARAMETERS", with_params(unit, extras));
}
