//! Replica resolution, autoscalers and disruption budgets

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use seldon_common::crd::SeldonPodSpec;
use seldon_common::labels;

use super::Scope;

pub(crate) struct Scaling {
    pub replicas: Option<i32>,
    pub hpa: Option<HorizontalPodAutoscaler>,
    pub pdb: Option<PodDisruptionBudget>,
}

/// First replica count set, most specific level first
pub fn resolve_replicas(levels: &[Option<i32>]) -> Option<i32> {
    levels.iter().flatten().next().copied()
}

/// Scaling of one component workload
///
/// An autoscaler owns the replica count, so the workload leaves it unset.
pub(crate) fn component_scaling(
    scope: &Scope<'_>,
    name: &str,
    component: &SeldonPodSpec,
) -> Scaling {
    let hpa = component.hpa_spec.as_ref().map(|hpa| HorizontalPodAutoscaler {
        metadata: metadata(scope, name),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            min_replicas: hpa.min_replicas,
            max_replicas: hpa.max_replicas,
            metrics: Some(hpa.metrics.clone()).filter(|m| !m.is_empty()),
            ..Default::default()
        }),
        ..Default::default()
    });

    let replicas = if hpa.is_some() {
        None
    } else {
        resolve_replicas(&[
            component.replicas,
            scope.predictor.replicas,
            scope.spec.replicas,
            scope.predictor.svc_orch_spec.replicas,
        ])
    };

    let pdb = component.pdb_spec.as_ref().map(|pdb| PodDisruptionBudget {
        metadata: metadata(scope, name),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: pdb.min_available.clone(),
            max_unavailable: pdb.max_unavailable.clone(),
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([
                    (labels::SELDON_ID.to_string(), scope.name.to_string()),
                    (labels::APP.to_string(), name.to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    Scaling { replicas, hpa, pdb }
}

fn metadata(scope: &Scope<'_>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(scope.namespace.to_string()),
        labels: Some(BTreeMap::from([(
            labels::SELDON_ID.to_string(),
            scope.name.to_string(),
        )])),
        ..Default::default()
    }
}
