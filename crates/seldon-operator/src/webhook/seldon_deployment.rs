//! SeldonDeployment mutation and validation
//!
//! Both hooks run the same normalization the reconciler runs, against the
//! cluster configuration read at request time, so a declaration admitted
//! here normalizes identically on the next reconcile.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DynamicObject},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    ResourceExt,
};
use tracing::{debug, error, info, warn};

use seldon_common::config::{ClusterConfig, OperatorConfig, CLUSTER_CONFIG_MAP};
use seldon_common::crd::SeldonDeployment;
use seldon_common::{Error, Result};

use super::WebhookState;

/// Handle mutating admission review for SeldonDeployments
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match cluster_config(&state).await {
        Ok(cluster) => mutate_deployment(&req, &state.config, &cluster),
        Err(e) => {
            warn!(uid = %req.uid, error = %e, "cluster configuration unavailable, denying");
            AdmissionResponse::from(&req).deny(e.to_string())
        }
    };
    Json(response.into_review())
}

/// Handle validating admission review for SeldonDeployments
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match cluster_config(&state).await {
        Ok(cluster) => validate_deployment(&req, &state.config, &cluster),
        Err(e) => {
            warn!(uid = %req.uid, error = %e, "cluster configuration unavailable, denying");
            AdmissionResponse::from(&req).deny(e.to_string())
        }
    };
    Json(response.into_review())
}

async fn cluster_config(state: &WebhookState) -> Result<ClusterConfig> {
    let namespace = &state.config.controller_namespace;
    let api: Api<ConfigMap> = Api::namespaced(state.kube.clone(), namespace);
    let cm = api.get_opt(CLUSTER_CONFIG_MAP).await?.ok_or_else(|| {
        Error::config(format!("ConfigMap {namespace}/{CLUSTER_CONFIG_MAP} not found"))
    })?;
    ClusterConfig::from_data(&cm.data.unwrap_or_default())
}

// =============================================================================
// Admission decisions
// =============================================================================

/// A declaration under admission, with the identity normalization needs
struct Admitted {
    name: String,
    namespace: String,
    declaration: SeldonDeployment,
}

/// Decode the request object
///
/// `Ok(None)` means there is nothing to check: deletes, and objects already
/// being torn down.
fn admitted(request: &AdmissionRequest<DynamicObject>) -> Result<Option<Admitted>> {
    if matches!(request.operation, Operation::Delete) {
        return Ok(None);
    }
    let Some(obj) = &request.object else {
        return Ok(None);
    };

    let declaration: SeldonDeployment = obj
        .clone()
        .try_parse()
        .map_err(|e| {
            Error::validation_for_field("spec", format!("unable to decode SeldonDeployment: {e}"))
        })?;
    if declaration.metadata.deletion_timestamp.is_some() {
        return Ok(None);
    }

    let name = Some(declaration.name_any())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| request.name.clone());
    let namespace = request
        .namespace
        .clone()
        .or_else(|| declaration.namespace())
        .unwrap_or_else(|| "default".to_string());

    Ok(Some(Admitted {
        name,
        namespace,
        declaration,
    }))
}

/// Normalize the declaration and patch the result back over `/spec`
///
/// Admits unchanged when normalization has nothing to add.
pub fn mutate_deployment(
    request: &AdmissionRequest<DynamicObject>,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> AdmissionResponse {
    let uid = &request.uid;
    let admitted = match admitted(request) {
        Ok(Some(admitted)) => admitted,
        Ok(None) => return AdmissionResponse::from(request),
        Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
    };

    let spec = &admitted.declaration.spec;
    let normalized = match seldon_graph::normalize(
        &admitted.name,
        &admitted.namespace,
        spec,
        config,
        cluster,
    ) {
        Ok(normalized) => normalized,
        Err(e) => {
            info!(uid = %uid, deployment = %admitted.name, error = %e, "normalization failed");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    if normalized.spec == *spec {
        debug!(uid = %uid, deployment = %admitted.name, "already normalized");
        return AdmissionResponse::from(request);
    }

    let value = match serde_json::to_value(&normalized.spec) {
        Ok(value) => value,
        Err(e) => {
            error!(uid = %uid, error = %e, "failed to serialize normalized spec");
            return AdmissionResponse::from(request).deny(format!("serialization error: {e}"));
        }
    };
    let ops = vec![PatchOperation::Replace(ReplaceOperation {
        path: PointerBuf::from_tokens(["spec"]),
        value,
    })];

    debug!(uid = %uid, deployment = %admitted.name, "patching normalized spec");
    match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Normalize then validate, denying with every violation found
pub fn validate_deployment(
    request: &AdmissionRequest<DynamicObject>,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> AdmissionResponse {
    let admitted = match admitted(request) {
        Ok(Some(admitted)) => admitted,
        Ok(None) => return AdmissionResponse::from(request),
        Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
    };

    let checked = seldon_graph::normalize(
        &admitted.name,
        &admitted.namespace,
        &admitted.declaration.spec,
        config,
        cluster,
    )
    .and_then(|normalized| {
        seldon_graph::validate(&admitted.name, &normalized.spec, config, cluster)
    });

    match checked {
        Ok(()) => AdmissionResponse::from(request),
        Err(e) => {
            info!(
                uid = %request.uid,
                deployment = %admitted.name,
                causes = e.causes().len(),
                "rejecting SeldonDeployment"
            );
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}
