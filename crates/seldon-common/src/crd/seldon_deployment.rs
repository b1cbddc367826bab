//! SeldonDeployment CRD types
//!
//! A `SeldonDeployment` declares one or more weighted predictors, each an
//! inference graph of predictive units plus the pod templates that run them.

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::MetricSpec;
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::graph::{Endpoint, PredictiveUnit};
use super::types::{Protocol, ServerType, Transport};

// =============================================================================
// State
// =============================================================================

/// Aggregate state of a SeldonDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentState {
    /// Resources are being created or have not converged yet
    #[default]
    Creating,
    /// Every owned workload is fully available
    Available,
    /// The declaration cannot be realized
    Failed,
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Available => write!(f, "Available"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Pod templates
// =============================================================================

/// Metadata applied to a component's workload and pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ComponentMetadata {
    /// Explicit workload name; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Horizontal autoscaling request for one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeldonHpaSpec {
    /// Lower replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound
    pub max_replicas: i32,

    /// Scaling metrics
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

/// Disruption budget request for one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeldonPdbSpec {
    /// Minimum pods that must stay available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,

    /// Maximum pods that may be unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

/// A raw pod template hosting one or more graph units
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeldonPodSpec {
    /// Workload metadata
    #[serde(default)]
    pub metadata: ComponentMetadata,

    /// Pod specification; containers are matched to units by name
    #[serde(default)]
    pub spec: PodSpec,

    /// Autoscaler for this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa_spec: Option<SeldonHpaSpec>,

    /// Disruption budget for this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb_spec: Option<SeldonPdbSpec>,

    /// Replica count, most specific override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl SeldonPodSpec {
    /// Container with the given name, if present
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == name)
    }
}

// =============================================================================
// Orchestrator and explainer
// =============================================================================

/// Overrides for the service orchestrator of one predictor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SvcOrchSpec {
    /// Resource requirements for the orchestrator container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment for the orchestrator container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Replicas of a dedicated orchestrator workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl SvcOrchSpec {
    /// Value of a literal env var on the orchestrator
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }
}

/// Model explainer attached to a predictor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Explainer {
    /// Explainer algorithm, e.g. AnchorTabular
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,

    /// Location of a saved explainer artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_uri: Option<String>,

    /// Service account for the explainer pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Container template for the explainer
    #[serde(default)]
    pub container_spec: Container,

    /// Extra explainer arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Explainer endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    /// Secret exposed as environment to the artifact provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_ref_name: Option<String>,

    /// Image override for the artifact provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_initializer_image: Option<String>,

    /// Replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl Explainer {
    /// An explainer with neither a type nor an image declares nothing
    pub fn is_empty(&self) -> bool {
        self.type_.is_empty() && self.container_spec.image.as_deref().unwrap_or("").is_empty()
    }
}

// =============================================================================
// Predictor
// =============================================================================

/// A named, weighted inference graph
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictorSpec {
    /// Predictor name, unique within the deployment
    pub name: String,

    /// Root of the inference graph
    pub graph: PredictiveUnit,

    /// Pod templates hosting the graph's containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_specs: Vec<SeldonPodSpec>,

    /// Replica count for every component of this predictor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Predictor-level annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Legacy orchestrator resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_resources: Option<ResourceRequirements>,

    /// Labels propagated onto workloads and pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Orchestrator overrides
    #[serde(default)]
    pub svc_orch_spec: SvcOrchSpec,

    /// Traffic percentage routed to this predictor
    #[serde(default)]
    pub traffic: i32,

    /// Optional explainer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explainer: Option<Explainer>,

    /// Receive mirrored traffic only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shadow: bool,

    /// Rollout progress deadline for the predictor's workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,
}

impl PredictorSpec {
    /// Index of the component spec holding the named container
    pub fn component_index_for(&self, container: &str) -> Option<usize> {
        self.component_specs
            .iter()
            .position(|c| c.container(container).is_some())
    }

    /// Container hosting the named unit, if any
    pub fn container_for_unit(&self, unit: &str) -> Option<&Container> {
        self.component_specs.iter().find_map(|c| c.container(unit))
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of a SeldonDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machinelearning.seldon.io",
    version = "v1",
    kind = "SeldonDeployment",
    plural = "seldondeployments",
    shortname = "sdep",
    namespaced,
    status = "SeldonDeploymentStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SeldonDeploymentSpec {
    /// Legacy display name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Weighted predictors
    #[serde(default)]
    pub predictors: Vec<PredictorSpec>,

    /// Legacy OAuth key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_key: Option<String>,

    /// Legacy OAuth secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_secret: Option<String>,

    /// Extension knobs, see [`crate::annotations`]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Deployment-wide protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// Deployment-wide transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,

    /// Deployment-wide replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Orchestrator server type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<ServerType>,
}

impl SeldonDeploymentSpec {
    /// Effective protocol
    pub fn protocol(&self) -> Protocol {
        self.protocol.clone().unwrap_or_default()
    }

    /// Effective transport
    pub fn transport(&self) -> Transport {
        self.transport.clone().unwrap_or_default()
    }

    /// Effective server type
    pub fn server_type(&self) -> ServerType {
        self.server_type.clone().unwrap_or_default()
    }

    /// Annotation looked up on the deployment, then on the predictor
    pub fn annotation<'a>(&'a self, predictor: &'a PredictorSpec, key: &str) -> Option<&'a str> {
        self.annotations
            .get(key)
            .or_else(|| predictor.annotations.get(key))
            .map(String::as_str)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of one owned workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDeploymentStatus {
    /// Workload name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Short status word
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Observed replicas
    #[serde(default)]
    pub replicas: i32,

    /// Observed available replicas
    #[serde(default)]
    pub available_replicas: i32,

    /// Predictor this workload explains, for explainer workloads
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub explainer_for: String,
}

/// Observed state of one owned service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentServiceStatus {
    /// Service name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub svc_name: String,

    /// `host:port` for HTTP traffic
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_endpoint: String,

    /// `host:port` for gRPC traffic
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub grpc_endpoint: String,

    /// Predictor this service explains, for explainer services
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub explainer_for: String,
}

/// Externally reachable address
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Addressable {
    /// Prediction URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Observed state of a SeldonDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeldonDeploymentStatus {
    /// Aggregate state
    #[serde(default)]
    pub state: DeploymentState,

    /// Reason for the current state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Owned workloads by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployment_status: BTreeMap<String, ComponentDeploymentStatus>,

    /// Owned services by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_status: BTreeMap<String, ComponentServiceStatus>,

    /// Replicas of the default workload
    #[serde(default)]
    pub replicas: i32,

    /// Prediction address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn declaration() -> SeldonDeployment {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "machinelearning.seldon.io/v1",
            "kind": "SeldonDeployment",
            "metadata": {"name": "iris", "namespace": "models"},
            "spec": {
                "protocol": "seldon",
                "annotations": {"seldon.io/engine-separate-pod": "true"},
                "predictors": [{
                    "name": "default",
                    "traffic": 100,
                    "annotations": {"seldon.io/no-engine": "true"},
                    "graph": {
                        "name": "classifier",
                        "implementation": "SKLEARN_SERVER",
                        "modelUri": "gs://models/iris"
                    },
                    "componentSpecs": [{
                        "spec": {"containers": [{"name": "classifier", "image": "iris:1"}]}
                    }]
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_camel_case_declaration() {
        let sdep = declaration();
        let p = &sdep.spec.predictors[0];
        assert_eq!(p.traffic, 100);
        assert!(p.graph.is_prepack());
        assert_eq!(p.graph.model_uri.as_deref(), Some("gs://models/iris"));
        assert_eq!(p.component_index_for("classifier"), Some(0));
        assert!(p.container_for_unit("other").is_none());
    }

    #[test]
    fn annotation_lookup_prefers_deployment_level() {
        let sdep = declaration();
        let p = &sdep.spec.predictors[0];
        assert_eq!(
            sdep.spec.annotation(p, "seldon.io/engine-separate-pod"),
            Some("true")
        );
        assert_eq!(sdep.spec.annotation(p, "seldon.io/no-engine"), Some("true"));
        assert_eq!(sdep.spec.annotation(p, "seldon.io/missing"), None);
    }

    #[test]
    fn effective_enums_default() {
        let spec = SeldonDeploymentSpec::default();
        assert_eq!(spec.protocol(), Protocol::Seldon);
        assert_eq!(spec.transport(), Transport::Rest);
        assert_eq!(spec.server_type(), ServerType::Rpc);
    }

    #[test]
    fn empty_explainer_declares_nothing() {
        assert!(Explainer::default().is_empty());
        let explainer = Explainer {
            type_: "AnchorTabular".to_string(),
            ..Default::default()
        };
        assert!(!explainer.is_empty());
    }

    #[test]
    fn crd_has_status_subresource() {
        let crd = SeldonDeployment::crd();
        assert_eq!(crd.spec.group, "machinelearning.seldon.io");
        assert_eq!(crd.spec.names.kind, "SeldonDeployment");
        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }

    #[test]
    fn state_display() {
        assert_eq!(DeploymentState::Creating.to_string(), "Creating");
        assert_eq!(DeploymentState::Available.to_string(), "Available");
        assert_eq!(DeploymentState::Failed.to_string(), "Failed");
    }
}
