//! One Deployment per component spec

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    DownwardAPIVolumeFile, DownwardAPIVolumeSource, ObjectFieldSelector, PodSecurityContext,
    PodSpec, PodTemplateSpec, Service, Volume,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use seldon_common::crd::SeldonPodSpec;
use seldon_common::{annotations, labels, naming, Result, PODINFO_VOLUME};

use super::{autoscale, prepack, service, Scope, ENGINE_CONTAINER_NAME, TFSERVING_CONTAINER_NAME};

/// Resources owned by one component spec
pub(crate) struct ComponentResources {
    pub deployment: Deployment,
    pub services: Vec<Service>,
    pub hpa: Option<HorizontalPodAutoscaler>,
    pub pdb: Option<PodDisruptionBudget>,
}

/// Workload name of the component spec at `index`
pub(crate) fn component_name(scope: &Scope<'_>, index: usize) -> String {
    let Some(component) = scope.predictor.component_specs.get(index) else {
        return naming::deployment_name(scope.name, &scope.predictor.name, None, index, &[]);
    };
    let containers: Vec<&str> = component
        .spec
        .containers
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    naming::deployment_name(
        scope.name,
        &scope.predictor.name,
        component.metadata.name.as_deref(),
        index,
        &containers,
    )
}

pub(crate) fn component_workload(
    scope: &Scope<'_>,
    index: usize,
    component: &SeldonPodSpec,
) -> Result<ComponentResources> {
    let name = component_name(scope, index);
    let mut deployment = base_deployment(scope, &name, component, true);

    let mut services = Vec::new();
    let hosted: Vec<String> = component
        .spec
        .containers
        .iter()
        .map(|c| c.name.clone())
        .filter(|n| n != ENGINE_CONTAINER_NAME && n != TFSERVING_CONTAINER_NAME)
        .collect();
    for container in hosted {
        let Some(unit) = scope.predictor.graph.find(&container) else {
            continue;
        };
        if unit.is_prepack() {
            prepack::inject(scope, &mut deployment, unit)?;
        }
        if let Some(svc) = service::container_service(scope, &mut deployment, unit) {
            services.push(svc);
        }
    }

    let scaling = autoscale::component_scaling(scope, &name, component);
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = scaling.replicas;
    }

    Ok(ComponentResources {
        deployment,
        services,
        hpa: scaling.hpa,
        pdb: scaling.pdb,
    })
}

/// Deployment skeleton shared by component and explainer workloads
///
/// Annotations merge in order deployment, predictor, component; later
/// values win. Labels from the predictor and component land on both the
/// workload and its pod template.
pub(crate) fn base_deployment(
    scope: &Scope<'_>,
    name: &str,
    component: &SeldonPodSpec,
    metrics: bool,
) -> Deployment {
    let selector = BTreeMap::from([
        (labels::SELDON_ID.to_string(), scope.name.to_string()),
        (labels::APP.to_string(), name.to_string()),
    ]);
    let mut meta_labels = selector.clone();
    meta_labels.insert(labels::FLUENTD.to_string(), "true".to_string());

    let mut template_labels = meta_labels.clone();
    if scope.predictor.shadow {
        template_labels.insert(labels::TIER_SHADOW.to_string(), "true".to_string());
    }
    for extra in [&scope.predictor.labels, &component.metadata.labels] {
        meta_labels.extend(extra.clone());
        template_labels.extend(extra.clone());
    }

    let mut meta_annotations = scope.spec.annotations.clone();
    meta_annotations.extend(scope.predictor.annotations.clone());
    meta_annotations.extend(component.metadata.annotations.clone());

    let mut template_annotations = BTreeMap::new();
    if metrics {
        template_annotations.insert(
            annotations::PROMETHEUS_PATH.to_string(),
            scope.config.executor.prometheus_path.clone(),
        );
        template_annotations.insert(annotations::PROMETHEUS_SCRAPE.to_string(), "true".to_string());
    }
    template_annotations.extend(meta_annotations.clone());

    let mut pod = component.spec.clone();
    apply_pod_defaults(&mut pod);
    if pod.security_context.is_none() {
        pod.security_context = scope.config.default_user_id.map(|uid| PodSecurityContext {
            run_as_user: Some(uid),
            ..Default::default()
        });
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(scope.namespace.to_string()),
            labels: Some(meta_labels),
            annotations: Some(meta_annotations).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    annotations: Some(template_annotations).filter(|a| !a.is_empty()),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            strategy: Some(rolling_update()),
            progress_deadline_seconds: scope.predictor.progress_deadline_seconds,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn rolling_update() -> DeploymentStrategy {
    DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_unavailable: Some(IntOrString::String("10%".to_string())),
            ..Default::default()
        }),
    }
}

/// Pod fields the API server would default, set up front so live and
/// desired objects compare equal
pub(crate) fn apply_pod_defaults(pod: &mut PodSpec) {
    pod.restart_policy.get_or_insert_with(|| "Always".to_string());
    pod.dns_policy.get_or_insert_with(|| "ClusterFirst".to_string());
    pod.scheduler_name
        .get_or_insert_with(|| "default-scheduler".to_string());
    pod.termination_grace_period_seconds.get_or_insert(20);

    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == PODINFO_VOLUME) {
        volumes.push(podinfo_volume());
    }
}

fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "annotations".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.annotations".to_string(),
                    api_version: Some("v1".to_string()),
                }),
                ..Default::default()
            }]),
            default_mode: Some(420),
        }),
        ..Default::default()
    }
}

pub(crate) fn pod_spec_mut(deployment: &mut Deployment) -> &mut PodSpec {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

/// Add labels to the workload and its pod template, and optionally to
/// its selector
pub(crate) fn add_labels(
    deployment: &mut Deployment,
    extra: &BTreeMap<String, String>,
    select: bool,
) {
    deployment
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(extra.clone());
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(extra.clone());
    if select {
        spec.selector
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .extend(extra.clone());
    }
}

/// Put the workload's pods behind a predictor or explainer service
pub(crate) fn select_as(deployment: &mut Deployment, service: &str) {
    let label = BTreeMap::from([(labels::SELDON_APP.to_string(), service.to_string())]);
    add_labels(deployment, &label, true);
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use seldon_common::PODINFO_MOUNT_PATH;

    fn template(dep: &Deployment) -> &PodTemplateSpec {
        &dep.spec.as_ref().unwrap().template
    }

    // =========================================================================
    // Metadata propagation
    // =========================================================================

    /// Story: annotations flow from deployment to predictor to component,
    /// with the most specific level winning, onto workload and pods
    #[test]
    fn story_annotations_merge_by_specificity() {
        let mut spec = single_model();
        spec.annotations.insert("team".to_string(), "sdep".to_string());
        spec.annotations.insert("owner".to_string(), "sdep".to_string());
        spec.predictors[0]
            .annotations
            .insert("owner".to_string(), "predictor".to_string());
        spec.predictors[0].component_specs[0]
            .metadata
            .annotations
            .insert("tier".to_string(), "gold".to_string());

        let out = run(&spec);
        let dep = deployment(&out, "iris-default-0-classifier");
        let ann = dep.metadata.annotations.as_ref().unwrap();
        assert_eq!(ann.get("team").map(String::as_str), Some("sdep"));
        assert_eq!(ann.get("owner").map(String::as_str), Some("predictor"));
        assert_eq!(ann.get("tier").map(String::as_str), Some("gold"));

        let pod_ann = template(dep).metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(pod_ann.get("owner").map(String::as_str), Some("predictor"));
        assert_eq!(
            pod_ann.get(annotations::PROMETHEUS_SCRAPE).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn predictor_and_component_labels_reach_pods() {
        let mut spec = single_model();
        spec.predictors[0]
            .component_specs[0]
            .metadata
            .labels
            .insert("team".to_string(), "ml".to_string());
        let out = run(&spec);
        let dep = deployment(&out, "iris-default-0-classifier");
        let pod_labels = template(dep).metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(pod_labels.get("team").map(String::as_str), Some("ml"));
        assert_eq!(pod_labels.get("version").map(String::as_str), Some("default"));
        assert_eq!(pod_labels.get(labels::SELDON_ID).map(String::as_str), Some("iris"));
    }

    #[test]
    fn shadow_pods_are_labeled() {
        let mut spec = single_model();
        spec.predictors[0].shadow = true;
        let out = run(&spec);
        let dep = deployment(&out, "iris-default-0-classifier");
        let pod_labels = template(dep).metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(pod_labels.get(labels::TIER_SHADOW).map(String::as_str), Some("true"));
    }

    // =========================================================================
    // Pod defaults
    // =========================================================================

    #[test]
    fn pods_get_podinfo_volume_and_defaults() {
        let out = run(&single_model());
        let dep = deployment(&out, "iris-default-0-classifier");
        let pod = template(dep).spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Always"));
        assert_eq!(pod.termination_grace_period_seconds, Some(20));
        let volume = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == PODINFO_VOLUME)
            .unwrap();
        assert_eq!(volume.downward_api.as_ref().unwrap().default_mode, Some(420));

        let model = pod_container(dep, "classifier");
        assert!(model
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == PODINFO_MOUNT_PATH));
    }

    #[test]
    fn default_user_id_sets_pod_security_context() {
        let spec = single_model();
        let mut config = config();
        config.default_user_id = Some(8888);
        let cluster = Default::default();
        let normalized = normalize(&spec, &cluster);
        let out = super::super::synthesize(&normalized, &config, &cluster).unwrap();
        let dep = deployment(&out, "iris-default-0-classifier");
        let pod = template(dep).spec.as_ref().unwrap();
        assert_eq!(pod.security_context.as_ref().unwrap().run_as_user, Some(8888));
    }

    #[test]
    fn explicit_component_name_wins() {
        let mut spec = single_model();
        spec.predictors[0].component_specs[0].metadata.name = Some("custom".to_string());
        let out = run(&spec);
        deployment(&out, "custom");
    }

    #[test]
    fn selector_is_scoped_to_workload() {
        let out = run(&single_model());
        let dep = deployment(&out, "iris-default-0-classifier");
        let selector = dep.spec.as_ref().unwrap().selector.match_labels.as_ref().unwrap();
        assert_eq!(
            selector.get(labels::APP).map(String::as_str),
            Some("iris-default-0-classifier")
        );
        assert_eq!(
            dep.spec.as_ref().unwrap().strategy.as_ref().unwrap().type_.as_deref(),
            Some("RollingUpdate")
        );
    }
}
