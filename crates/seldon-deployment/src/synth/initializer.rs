//! Model artifact provisioning
//!
//! An init container downloads the artifact at a URI into an `emptyDir`
//! shared with the serving container, which mounts it read-only at
//! [`MODEL_MOUNT_PATH`]. `pvc://claim/path` URIs are mounted directly from
//! the claim instead of being downloaded from a remote store.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, PersistentVolumeClaimVolumeSource, PodSpec,
    ResourceRequirements, SecretEnvSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use seldon_common::config::DEFAULT_STORAGE_INITIALIZER_IMAGE;
use seldon_common::{naming, Error, Result, MODEL_MOUNT_PATH};

use super::Scope;

const PVC_SOURCE_VOLUME: &str = "kfserving-pvc-source";
const PVC_MOUNT_PATH: &str = "/mnt/pvc";
const PVC_SCHEME: &str = "pvc://";

/// What to provision and with which overrides
pub(crate) struct Provision<'a> {
    pub uri: &'a str,
    pub env_secret_ref: Option<&'a str>,
    pub image: Option<&'a str>,
}

/// Add the init container and volumes provisioning `provision.uri` into
/// the container named `target`
pub(crate) fn inject(
    scope: &Scope<'_>,
    pod: &mut PodSpec,
    target: &str,
    provision: &Provision<'_>,
) -> Result<()> {
    if provision.uri.is_empty() {
        return Ok(());
    }
    if !pod.containers.iter().any(|c| c.name == target) {
        return Err(Error::synthesis(
            target,
            "model initializer target container not found",
        ));
    }

    let volume_name = naming::truncate_name(&format!("{target}-provision-location"));
    let init_name = naming::truncate_name(&format!("{target}-model-initializer"));
    let user_mount = VolumeMount {
        name: volume_name.clone(),
        mount_path: MODEL_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    };

    let init_containers = pod.init_containers.get_or_insert_with(Vec::new);
    if init_containers.iter().any(|c| c.name == init_name) {
        ensure_mount(pod, target, user_mount);
        return Ok(());
    }

    let mut uri = provision.uri.to_string();
    let mut init_mounts = Vec::new();
    if let Some(rest) = provision.uri.strip_prefix(PVC_SCHEME) {
        let (claim, path) = rest.split_once('/').unwrap_or((rest, ""));
        add_volume(
            pod,
            Volume {
                name: PVC_SOURCE_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
        );
        let pvc_mount = VolumeMount {
            name: PVC_SOURCE_VOLUME.to_string(),
            mount_path: PVC_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        };
        init_mounts.push(pvc_mount.clone());
        ensure_mount(pod, target, pvc_mount);
        uri = format!("{PVC_MOUNT_PATH}/{path}");
    }

    add_volume(
        pod,
        Volume {
            name: volume_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    );
    init_mounts.push(VolumeMount {
        name: volume_name,
        mount_path: MODEL_MOUNT_PATH.to_string(),
        ..Default::default()
    });
    ensure_mount(pod, target, user_mount);

    let secret = provision
        .env_secret_ref
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| scope.config.default_env_secret_ref.clone());

    let init = Container {
        name: init_name,
        image: Some(image(scope, provision.image)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![uri, MODEL_MOUNT_PATH.to_string()]),
        volume_mounts: Some(init_mounts),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        resources: Some(resources(scope)),
        env_from: secret.map(|name| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name,
                    optional: None,
                }),
                ..Default::default()
            }]
        }),
        ..Default::default()
    };
    pod.init_containers.get_or_insert_with(Vec::new).push(init);
    Ok(())
}

/// Unit override, then related-image env, then cluster config, then default
fn image(scope: &Scope<'_>, unit_override: Option<&str>) -> String {
    unit_override
        .filter(|i| !i.is_empty())
        .map(str::to_string)
        .or_else(|| scope.config.related_images.storage_initializer.clone())
        .or_else(|| {
            Some(scope.cluster.storage_initializer.image.clone()).filter(|i| !i.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_STORAGE_INITIALIZER_IMAGE.to_string())
}

fn resources(scope: &Scope<'_>) -> ResourceRequirements {
    let init = &scope.cluster.storage_initializer;
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities(&init.cpu_request, &init.memory_request)),
        limits: Some(quantities(&init.cpu_limit, &init.memory_limit)),
        ..Default::default()
    }
}

fn add_volume(pod: &mut PodSpec, volume: Volume) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == volume.name) {
        volumes.push(volume);
    }
}

fn ensure_mount(pod: &mut PodSpec, target: &str, mount: VolumeMount) {
    if let Some(container) = pod.containers.iter_mut().find(|c| c.name == target) {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == mount.name) {
            mounts.push(mount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use seldon_common::config::{ClusterConfig, OperatorConfig};
    use seldon_common::crd::{PredictorSpec, SeldonDeploymentSpec};
    use seldon_graph::{OrchestratorPlacement, PredictorPlan};

    struct Harness {
        spec: SeldonDeploymentSpec,
        predictor: PredictorSpec,
        plan: PredictorPlan,
        config: OperatorConfig,
        cluster: ClusterConfig,
    }

    impl Harness {
        fn new() -> Self {
            let spec = single_model();
            Self {
                predictor: spec.predictors[0].clone(),
                spec,
                plan: PredictorPlan {
                    placement: OrchestratorPlacement::Dedicated,
                    logger_queue_size: 0,
                    logger_write_timeout_ms: 0,
                },
                config: config(),
                cluster: ClusterConfig::default(),
            }
        }

        fn scope(&self) -> Scope<'_> {
            Scope {
                name: "iris",
                namespace: "models",
                spec: &self.spec,
                predictor: &self.predictor,
                plan: &self.plan,
                config: &self.config,
                cluster: &self.cluster,
            }
        }
    }

    fn pod() -> PodSpec {
        PodSpec {
            containers: vec![container("classifier")],
            ..Default::default()
        }
    }

    fn provision(uri: &str) -> Provision<'_> {
        Provision {
            uri,
            env_secret_ref: None,
            image: None,
        }
    }

    /// Story: a remote URI is downloaded by an init container into a
    /// volume the model mounts read-only
    #[test]
    fn story_remote_uri_is_provisioned_into_shared_volume() {
        let h = Harness::new();
        let mut pod = pod();
        inject(&h.scope(), &mut pod, "classifier", &provision("gs://models/iris")).unwrap();

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "classifier-model-initializer");
        assert_eq!(
            init.args.clone().unwrap(),
            vec!["gs://models/iris".to_string(), MODEL_MOUNT_PATH.to_string()]
        );
        assert_eq!(init.image.as_deref(), Some(DEFAULT_STORAGE_INITIALIZER_IMAGE));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.name, "classifier-provision-location");
        assert!(volume.empty_dir.is_some());

        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, MODEL_MOUNT_PATH);
        assert_eq!(mount.read_only, Some(true));
    }

    #[test]
    fn pvc_uri_mounts_claim() {
        let h = Harness::new();
        let mut pod = pod();
        inject(&h.scope(), &mut pod, "classifier", &provision("pvc://models-claim/iris/v1"))
            .unwrap();

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.args.as_ref().unwrap()[0], "/mnt/pvc/iris/v1");
        let claim = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find_map(|v| v.persistent_volume_claim.clone())
            .unwrap();
        assert_eq!(claim.claim_name, "models-claim");
        assert_eq!(init.volume_mounts.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn injection_is_idempotent() {
        let h = Harness::new();
        let mut pod = pod();
        inject(&h.scope(), &mut pod, "classifier", &provision("s3://b/m")).unwrap();
        let once = pod.clone();
        inject(&h.scope(), &mut pod, "classifier", &provision("s3://b/m")).unwrap();
        assert_eq!(once, pod);
    }

    #[test]
    fn image_precedence() {
        let mut h = Harness::new();
        h.cluster.storage_initializer.image = "cluster/init".to_string();
        assert_eq!(image(&h.scope(), None), "cluster/init");

        h.config.related_images.storage_initializer = Some("related/init".to_string());
        assert_eq!(image(&h.scope(), None), "related/init");
        assert_eq!(image(&h.scope(), Some("unit/init")), "unit/init");
    }

    #[test]
    fn secret_ref_falls_back_to_default() {
        let mut h = Harness::new();
        h.config.default_env_secret_ref = Some("seldon-init".to_string());
        let mut pod = pod();
        inject(&h.scope(), &mut pod, "classifier", &provision("s3://b/m")).unwrap();
        let env_from = pod.init_containers.as_ref().unwrap()[0].env_from.clone().unwrap();
        assert_eq!(env_from[0].secret_ref.as_ref().unwrap().name, "seldon-init");
    }

    #[test]
    fn missing_target_is_an_error() {
        let h = Harness::new();
        let mut pod = pod();
        let err = inject(&h.scope(), &mut pod, "absent", &provision("s3://b/m")).unwrap_err();
        assert!(matches!(err, Error::Synthesis { .. }));
    }
}
