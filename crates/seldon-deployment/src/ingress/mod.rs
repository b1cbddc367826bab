//! Ingress generators
//!
//! Each enabled backend translates the routing facts produced by synthesis
//! into its own resources:
//! - **Istio**: `VirtualService` and `DestinationRule`
//! - **Contour**: `HTTPProxy`
//! - **Ambassador**: `getambassador.io/config` annotations on the predictor
//!   and explainer services
//!
//! Several backends may be enabled at once; their output is merged. All
//! resource types implement `HasApiResource` so the reconciler can apply
//! them as dynamic objects and garbage-collect stale ones by label.

pub mod ambassador;
pub mod contour;
pub mod istio;

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use seldon_common::config::{AmbassadorConfig, ContourConfig, IngressConfig, IstioConfig};
use seldon_common::kube_utils::HasApiResource;
use seldon_common::{labels, Error, Result};
use seldon_graph::NormalizedDeployment;

use crate::synth::SynthesizedComponents;

pub use ambassador::AmbassadorMapping;
pub use contour::{root_proxy, HttpProxy};
pub use istio::{DestinationRule, VirtualService};

/// Path suffix under which explainers are exposed
pub const EXPLAINER_PATH_SUFFIX: &str = "-explainer";

/// gRPC method prefix of the Seldon protocol
pub const GRPC_PREFIX_SELDON: &str = "/seldon.protos.Seldon/";

/// gRPC method prefix of the TensorFlow Serving protocol
pub const GRPC_PREFIX_TENSORFLOW: &str = "/tensorflow.serving.PredictionService/";

// =============================================================================
// Macro for default serde functions
// =============================================================================

/// Implement `default_api_version()` and `default_kind()` for a type
/// implementing `HasApiResource`, for use as serde defaults.
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as HasApiResource>::KIND.to_string()
            }
        }
    };
}

pub(crate) use impl_api_defaults;

// =============================================================================
// Shared metadata
// =============================================================================

/// Metadata for generated routing resources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngressMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl IngressMetadata {
    /// Metadata labeled as owned by the named SeldonDeployment
    pub fn owned(name: impl Into<String>, namespace: impl Into<String>, owner: &str) -> Self {
        let labels = BTreeMap::from([
            (labels::SELDON_ID.to_string(), owner.to_string()),
            (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
        ]);
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Backend dispatch
// =============================================================================

/// One enabled ingress backend
#[derive(Clone, Debug, PartialEq)]
pub enum IngressBackend {
    /// Istio virtual services and destination rules
    Istio(IstioConfig),
    /// Contour HTTP proxies
    Contour(ContourConfig),
    /// Ambassador mappings carried as service annotations
    Ambassador(AmbassadorConfig),
}

impl IngressBackend {
    /// Backends enabled by configuration, in a fixed order
    pub fn enabled(config: &IngressConfig) -> Vec<Self> {
        let mut backends = Vec::new();
        if let Some(istio) = &config.istio {
            backends.push(Self::Istio(istio.clone()));
        }
        if let Some(contour) = &config.contour {
            backends.push(Self::Contour(contour.clone()));
        }
        if let Some(ambassador) = &config.ambassador {
            backends.push(Self::Ambassador(ambassador.clone()));
        }
        backends
    }

    /// Resource kinds this backend creates and therefore watches and
    /// garbage-collects
    pub fn owned_kinds(&self) -> Vec<ApiResource> {
        match self {
            Self::Istio(_) => vec![
                VirtualService::api_resource(),
                DestinationRule::api_resource(),
            ],
            Self::Contour(_) => vec![HttpProxy::api_resource()],
            Self::Ambassador(_) => Vec::new(),
        }
    }

    /// Routing resources for one deployment
    pub fn generate(
        &self,
        deployment: &NormalizedDeployment,
        components: &SynthesizedComponents,
    ) -> Result<GeneratedIngress> {
        match self {
            Self::Istio(config) => istio::generate(config, deployment, components),
            Self::Contour(config) => contour::generate(config, deployment, components),
            Self::Ambassador(config) => ambassador::generate(config, deployment, components),
        }
    }
}

/// Every routing resource kind any enabled backend owns
pub fn owned_kinds(config: &IngressConfig) -> Vec<ApiResource> {
    IngressBackend::enabled(config)
        .iter()
        .flat_map(IngressBackend::owned_kinds)
        .collect()
}

/// Run every enabled backend and merge their output
pub fn generate(
    config: &IngressConfig,
    deployment: &NormalizedDeployment,
    components: &SynthesizedComponents,
) -> Result<GeneratedIngress> {
    let mut out = GeneratedIngress::default();
    for backend in IngressBackend::enabled(config) {
        out.merge(backend.generate(deployment, components)?);
    }
    Ok(out)
}

// =============================================================================
// Output
// =============================================================================

/// Routing resources generated for one deployment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneratedIngress {
    /// Istio VirtualServices
    pub virtual_services: Vec<VirtualService>,
    /// Istio DestinationRules
    pub destination_rules: Vec<DestinationRule>,
    /// Contour HTTPProxies
    pub http_proxies: Vec<HttpProxy>,
    /// Annotations to merge onto named services
    pub service_annotations: BTreeMap<String, BTreeMap<String, String>>,
}

impl GeneratedIngress {
    /// Whether nothing was generated
    pub fn is_empty(&self) -> bool {
        self.virtual_services.is_empty()
            && self.destination_rules.is_empty()
            && self.http_proxies.is_empty()
            && self.service_annotations.is_empty()
    }

    /// Append another backend's output
    pub fn merge(&mut self, other: GeneratedIngress) {
        self.virtual_services.extend(other.virtual_services);
        self.destination_rules.extend(other.destination_rules);
        self.http_proxies.extend(other.http_proxies);
        for (service, annotations) in other.service_annotations {
            self.service_annotations
                .entry(service)
                .or_default()
                .extend(annotations);
        }
    }

    /// Separately applied resources as dynamic objects, in apply order
    pub fn to_dynamic(&self) -> Result<Vec<(ApiResource, DynamicObject)>> {
        let mut out = Vec::new();
        for vs in &self.virtual_services {
            out.push((VirtualService::api_resource(), to_dynamic(vs)?));
        }
        for rule in &self.destination_rules {
            out.push((DestinationRule::api_resource(), to_dynamic(rule)?));
        }
        for proxy in &self.http_proxies {
            out.push((HttpProxy::api_resource(), to_dynamic(proxy)?));
        }
        Ok(out)
    }
}

/// Convert a typed routing resource into a `DynamicObject`
pub fn to_dynamic<T: Serialize + HasApiResource>(resource: &T) -> Result<DynamicObject> {
    serde_json::to_value(resource)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Deployment-level annotation
pub(crate) fn annotation<'a>(deployment: &'a NormalizedDeployment, key: &str) -> Option<&'a str> {
    deployment.spec.annotations.get(key).map(String::as_str)
}

/// Integer annotation; a malformed value is a configuration error
pub(crate) fn int_annotation(
    deployment: &NormalizedDeployment,
    key: &str,
    default: i32,
) -> Result<i32> {
    match annotation(deployment, key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("annotation {key} is not an integer: {v}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use seldon_common::config::{ClusterConfig, IngressConfig};
    use seldon_common::crd::SeldonDeploymentSpec;
    use seldon_graph::NormalizedDeployment;

    use crate::synth::fixtures::{config, normalize, predictor, single_model, unit};
    use crate::synth::{synthesize, SynthesizedComponents};

    /// Canary split: `main` 60, `canary` 40
    pub fn canary() -> SeldonDeploymentSpec {
        let mut spec = single_model();
        spec.predictors[0].name = "main".to_string();
        spec.predictors[0].traffic = 60;
        let mut canary = spec.predictors[0].clone();
        canary.name = "canary".to_string();
        canary.traffic = 40;
        canary.graph = unit("classifier", vec![]);
        spec.predictors.push(canary);
        spec
    }

    pub fn shadowed() -> SeldonDeploymentSpec {
        let mut spec = single_model();
        let mut shadow = predictor(
            "shadow",
            unit("classifier", vec![]),
            spec.predictors[0].component_specs.clone(),
        );
        shadow.shadow = true;
        shadow.traffic = 0;
        spec.predictors.push(shadow);
        spec
    }

    pub fn build(spec: &SeldonDeploymentSpec) -> (NormalizedDeployment, SynthesizedComponents) {
        let normalized = normalize(spec, &ClusterConfig::default());
        let components =
            synthesize(&normalized, &config(), &ClusterConfig::default()).expect("synthesis");
        (normalized, components)
    }

    pub fn all_backends() -> IngressConfig {
        let env = |k: &str| {
            matches!(k, "ISTIO_ENABLED" | "CONTOUR_ENABLED" | "AMBASSADOR_ENABLED")
                .then(|| "true".to_string())
        };
        seldon_common::config::OperatorConfig::from_lookup(env)
            .expect("config")
            .ingress
    }
}
