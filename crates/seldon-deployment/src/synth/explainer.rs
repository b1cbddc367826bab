//! Explainer workloads and services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PodSpec, Service};
use seldon_common::crd::{ComponentServiceStatus, Explainer, SeldonPodSpec, Transport};
use seldon_common::{labels, naming, Error, Result, MODEL_MOUNT_PATH};
use seldon_graph::{named_port, HTTP_PORT_NAME};

use super::initializer::{self, Provision};
use super::service::{external_service, service_port, service_status};
use super::workload::{add_labels, base_deployment, pod_spec_mut, select_as};
use super::{
    autoscale, env_default, port_default, pre_stop_sleep, tcp_probe, ExplainerRoute,
    PredictorRoute, Scope,
};

const DEFAULT_EXPLAINER_PORT: i32 = 9000;

pub(crate) struct ExplainerResources {
    pub deployment: Deployment,
    pub service: Service,
    pub status: ComponentServiceStatus,
    pub route: ExplainerRoute,
}

/// MLServer alibi-explain tag for an explainer type
pub fn explainer_tag(type_: &str) -> &str {
    match type_ {
        "AnchorTabular" => "anchor_tabular",
        "AnchorImages" => "anchor_image",
        "AnchorText" => "anchor_text",
        "Counterfactuals" => "counterfactuals",
        "Contrastive" => "contrastive",
        "KernelShap" => "kernel_shap",
        "IntegratedGradients" => "integrated_gradients",
        "ALE" => "ALE",
        "TreeShap" => "tree_shap",
        other => other,
    }
}

pub(crate) fn explainer(
    scope: &Scope<'_>,
    explainer: &Explainer,
    predictor: &PredictorRoute,
) -> Result<ExplainerResources> {
    let name = naming::explainer_name(scope.name, &scope.predictor.name);
    let protocol = scope.spec.protocol();
    let model = &scope.predictor.graph.name;

    let mut container = explainer.container_spec.clone();
    if container.name.is_empty() {
        container.name = name.clone();
    }
    container
        .image_pull_policy
        .get_or_insert_with(|| "IfNotPresent".to_string());
    if !container.image.as_deref().is_some_and(|i| !i.is_empty()) {
        let image = scope
            .cluster
            .explainer_image(&protocol, &scope.config.related_images)
            .ok_or_else(|| Error::synthesis(&name, "no explainer image configured"))?;
        container.image = Some(image);
    }

    let port = match named_port(&container, HTTP_PORT_NAME) {
        Some(port) => port,
        None => {
            let port = explainer
                .endpoint
                .as_ref()
                .map(|e| e.service_port)
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_EXPLAINER_PORT);
            port_default(&mut container, HTTP_PORT_NAME, port);
            port
        }
    };

    let grpc = scope.spec.transport() == Transport::Grpc
        || explainer.endpoint.as_ref().is_some_and(|e| e.is_grpc());
    let predictor_port = if grpc {
        predictor.grpc_port
    } else {
        predictor.http_port
    };
    let predictor_host = format!(
        "{}.{}:{}",
        predictor.service, scope.namespace, predictor_port
    );

    container
        .liveness_probe
        .get_or_insert_with(|| tcp_probe(HTTP_PORT_NAME, 60, 5));
    container
        .readiness_probe
        .get_or_insert_with(|| tcp_probe(HTTP_PORT_NAME, 20, 7));
    container.lifecycle.get_or_insert_with(pre_stop_sleep);

    let has_model = explainer.model_uri.as_deref().is_some_and(|u| !u.is_empty());
    if protocol.is_v2() {
        let extra = serde_json::json!({
            "explainer_type": explainer_tag(&explainer.type_),
            "infer_uri": format!("http://{predictor_host}/v2/models/{model}/infer"),
        });
        env_default(&mut container, "MLSERVER_HTTP_PORT", port.to_string());
        env_default(
            &mut container,
            "MLSERVER_MODEL_IMPLEMENTATION",
            "mlserver_alibi_explain.AlibiExplainRuntime",
        );
        env_default(&mut container, "MLSERVER_MODEL_NAME", name.clone());
        env_default(&mut container, "MLSERVER_MODEL_URI", MODEL_MOUNT_PATH);
        env_default(&mut container, "MLSERVER_MODEL_EXTRA", extra.to_string());
    } else if container.args.as_ref().map_or(true, Vec::is_empty) {
        let transport = if grpc { "grpc" } else { "http" };
        let mut args = vec![
            format!("--model_name={model}"),
            format!("--predictor_host={predictor_host}"),
            format!("--protocol={protocol}.{transport}"),
            format!("--http_port={port}"),
        ];
        if has_model {
            args.push(format!("--storage_uri={MODEL_MOUNT_PATH}"));
        }
        args.push(explainer.type_.clone());
        if explainer.type_ == "AnchorImages" {
            args.push("--tf_data_type=float32".to_string());
        }
        for (key, value) in &explainer.config {
            let value = if explainer.model_uri.as_deref() == Some(value.as_str()) {
                MODEL_MOUNT_PATH
            } else {
                value.as_str()
            };
            args.push(format!("--{key}={value}"));
        }
        container.args = Some(args);
    }

    let container_name = container.name.clone();
    let component = SeldonPodSpec {
        spec: PodSpec {
            containers: vec![container],
            service_account_name: explainer
                .service_account_name
                .clone()
                .filter(|a| !a.is_empty()),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut deployment = base_deployment(scope, &name, &component, false);
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = autoscale::resolve_replicas(&[
            explainer.replicas,
            scope.predictor.replicas,
            scope.spec.replicas,
        ]);
    }
    if let Some(uri) = explainer.model_uri.as_deref() {
        let provision = Provision {
            uri,
            env_secret_ref: explainer.env_secret_ref_name.as_deref(),
            image: explainer.storage_initializer_image.as_deref(),
        };
        let pod = pod_spec_mut(&mut deployment);
        initializer::inject(scope, pod, &container_name, &provision)?;
    }
    select_as(&mut deployment, &name);
    let role = BTreeMap::from([(labels::ROLE_EXPLAINER.to_string(), "true".to_string())]);
    add_labels(&mut deployment, &role, false);

    let mut service = external_service(scope, &name, vec![service_port(HTTP_PORT_NAME, port)]);
    let svc_labels = service.metadata.labels.get_or_insert_with(BTreeMap::new);
    svc_labels.insert(labels::SELDON_APP.to_string(), predictor.service.clone());
    svc_labels.extend(role);

    Ok(ExplainerResources {
        deployment,
        service,
        status: service_status(scope, &name, port, 0, &predictor.service),
        route: ExplainerRoute {
            predictor: scope.predictor.name.clone(),
            service: name,
            port,
            grpc,
        },
    })
}
