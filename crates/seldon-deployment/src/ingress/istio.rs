//! Istio routing
//!
//! One HTTP and one gRPC `VirtualService` per deployment split traffic
//! between predictor services by weight; a shadow predictor is a mirror
//! target rather than a weighted destination. Every predictor and explainer
//! service gets a `DestinationRule` defining its version subset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use seldon_common::annotations;
use seldon_common::config::IstioConfig;
use seldon_common::kube_utils::HasApiResource;
use seldon_common::{naming, Result};
use seldon_graph::NormalizedDeployment;

use super::{
    annotation, impl_api_defaults, int_annotation, GeneratedIngress, IngressMetadata,
    EXPLAINER_PATH_SUFFIX,
};
use crate::synth::{ExplainerRoute, PredictorRoute, SynthesizedComponents};

/// URI regex matching every supported gRPC prediction service
pub const GRPC_REGEX: &str = ".*tensorflow.*|.*seldon.protos.*|.*inference.GRPCInferenceService.*";

const RETRY_ON: &str = "gateway-error,connect-failure,refused-stream";

// =============================================================================
// VirtualService
// =============================================================================

/// Istio VirtualService
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualService {
    /// API version
    #[serde(default = "VirtualService::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "VirtualService::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: IngressMetadata,
    /// Routing specification
    pub spec: VirtualServiceSpec,
}

impl HasApiResource for VirtualService {
    const API_VERSION: &'static str = "networking.istio.io/v1alpha3";
    const KIND: &'static str = "VirtualService";
}

impl_api_defaults!(VirtualService);

impl VirtualService {
    /// Create a new VirtualService
    pub fn new(metadata: IngressMetadata, spec: VirtualServiceSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// VirtualService spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VirtualServiceSpec {
    /// Hosts matched
    pub hosts: Vec<String>,
    /// Gateways the routes bind to
    pub gateways: Vec<String>,
    /// HTTP routes
    pub http: Vec<HttpRoute>,
}

/// One HTTP route
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpRoute {
    /// Match conditions
    #[serde(rename = "match")]
    pub matches: Vec<HttpMatchRequest>,
    /// URI rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<HttpRewrite>,
    /// Weighted destinations
    pub route: Vec<HttpRouteDestination>,
    /// Destination receiving a copy of every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Destination>,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<HttpRetry>,
}

/// Request match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpMatchRequest {
    /// URI match
    pub uri: StringMatch,
    /// Header matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,
}

/// String match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StringMatch {
    /// Exact value
    Exact(String),
    /// Prefix
    Prefix(String),
    /// RE2 regular expression
    Regex(String),
}

/// URI rewrite
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRewrite {
    /// Replacement for the matched prefix
    pub uri: String,
}

/// Weighted destination
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteDestination {
    /// Destination
    pub destination: Destination,
    /// Traffic percentage
    pub weight: i32,
}

/// Service subset and port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    /// Service name
    pub host: String,
    /// Subset defined by the service's DestinationRule
    pub subset: String,
    /// Port
    pub port: PortSelector,
}

/// Port selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PortSelector {
    /// Port number
    pub number: i32,
}

/// Retry policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetry {
    /// Number of attempts
    pub attempts: i32,
    /// Timeout per attempt, e.g. `1s`
    pub per_try_timeout: String,
    /// Conditions retried
    pub retry_on: String,
}

// =============================================================================
// DestinationRule
// =============================================================================

/// Istio DestinationRule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRule {
    /// API version
    #[serde(default = "DestinationRule::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "DestinationRule::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: IngressMetadata,
    /// Rule specification
    pub spec: DestinationRuleSpec,
}

impl HasApiResource for DestinationRule {
    const API_VERSION: &'static str = "networking.istio.io/v1alpha3";
    const KIND: &'static str = "DestinationRule";
}

impl_api_defaults!(DestinationRule);

impl DestinationRule {
    /// Create a new DestinationRule
    pub fn new(metadata: IngressMetadata, spec: DestinationRuleSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// DestinationRule spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRuleSpec {
    /// Service the rule applies to
    pub host: String,
    /// Named subsets
    pub subsets: Vec<Subset>,
    /// Traffic policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,
}

/// Label-selected subset of a service's endpoints
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subset {
    /// Subset name
    pub name: String,
    /// Labels endpoints must carry
    pub labels: BTreeMap<String, String>,
}

/// Traffic policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrafficPolicy {
    /// Upstream TLS
    pub tls: TlsSettings,
}

/// Upstream TLS settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TlsSettings {
    /// TLS mode, e.g. ISTIO_MUTUAL
    pub mode: String,
}

// =============================================================================
// Generation
// =============================================================================

struct Shared<'a> {
    deployment: &'a NormalizedDeployment,
    gateway: String,
    retries: Option<HttpRetry>,
}

impl Shared<'_> {
    fn metadata(&self, name: &str) -> IngressMetadata {
        IngressMetadata::owned(name, &self.deployment.namespace, &self.deployment.name)
    }

    fn virtual_service(&self, name: &str, route: HttpRoute) -> VirtualService {
        VirtualService::new(
            self.metadata(&naming::truncate_name(name)),
            VirtualServiceSpec {
                hosts: vec!["*".to_string()],
                gateways: vec![self.gateway.clone()],
                http: vec![route],
            },
        )
    }

    fn grpc_match(&self, uri: StringMatch) -> HttpMatchRequest {
        HttpMatchRequest {
            uri,
            headers: BTreeMap::from([
                (
                    "seldon".to_string(),
                    StringMatch::Exact(self.deployment.name.clone()),
                ),
                (
                    "namespace".to_string(),
                    StringMatch::Exact(self.deployment.namespace.clone()),
                ),
            ]),
        }
    }

    fn prefix_match(&self, prefix: String) -> HttpMatchRequest {
        HttpMatchRequest {
            uri: StringMatch::Prefix(prefix),
            headers: BTreeMap::new(),
        }
    }
}

/// VirtualServices and DestinationRules for a deployment and its explainers
pub fn generate(
    config: &IstioConfig,
    deployment: &NormalizedDeployment,
    components: &SynthesizedComponents,
) -> Result<GeneratedIngress> {
    let shared = Shared {
        deployment,
        gateway: annotation(deployment, annotations::ISTIO_GATEWAY)
            .unwrap_or(&config.gateway)
            .to_string(),
        retries: retries(deployment)?,
    };
    let mut out = GeneratedIngress::default();
    let name = &deployment.name;
    let namespace = &deployment.namespace;

    let mut http = HttpRoute {
        matches: vec![shared.prefix_match(format!("/seldon/{namespace}/{name}/"))],
        rewrite: Some(HttpRewrite {
            uri: "/".to_string(),
        }),
        retries: shared.retries.clone(),
        ..Default::default()
    };
    let mut grpc = HttpRoute {
        matches: vec![shared.grpc_match(StringMatch::Regex(GRPC_REGEX.to_string()))],
        retries: shared.retries.clone(),
        ..Default::default()
    };

    for route in &components.routes {
        out.destination_rules
            .push(destination_rule(&shared, &route.service, route, config));
        let http_dest = destination(route, route.http_port);
        let grpc_dest = destination(route, route.grpc_port);
        if route.shadow {
            http.mirror = Some(http_dest);
            grpc.mirror = Some(grpc_dest);
        } else {
            http.route.push(HttpRouteDestination {
                destination: http_dest,
                weight: route.traffic,
            });
            grpc.route.push(HttpRouteDestination {
                destination: grpc_dest,
                weight: route.traffic,
            });
        }
    }

    let http_allowed = components.routes.iter().all(|r| r.http_port > 0);
    let grpc_allowed = components.routes.iter().all(|r| r.grpc_port > 0);
    if http_allowed {
        out.virtual_services
            .push(shared.virtual_service(&format!("{name}-http"), http));
    }
    if grpc_allowed {
        out.virtual_services
            .push(shared.virtual_service(&format!("{name}-grpc"), grpc));
    }

    for explainer in &components.explainer_routes {
        explainer_resources(&shared, config, components, explainer, &mut out);
    }
    Ok(out)
}

fn explainer_resources(
    shared: &Shared<'_>,
    config: &IstioConfig,
    components: &SynthesizedComponents,
    explainer: &ExplainerRoute,
    out: &mut GeneratedIngress,
) {
    let Some(predictor) = components
        .routes
        .iter()
        .find(|r| r.predictor == explainer.predictor)
    else {
        return;
    };
    let deployment = shared.deployment;
    let explainer_target = PredictorRoute {
        service: explainer.service.clone(),
        http_port: explainer.port,
        grpc_port: 0,
        traffic: 100,
        shadow: false,
        ..predictor.clone()
    };
    out.destination_rules.push(destination_rule(
        shared,
        &explainer.service,
        &explainer_target,
        config,
    ));
    let prefix = format!(
        "/seldon/{}/{}{EXPLAINER_PATH_SUFFIX}/{}/",
        deployment.namespace, deployment.name, explainer.predictor
    );
    let route = HttpRoute {
        matches: vec![shared.prefix_match(prefix)],
        rewrite: Some(HttpRewrite {
            uri: "/".to_string(),
        }),
        route: vec![HttpRouteDestination {
            destination: destination(&explainer_target, explainer.port),
            weight: 100,
        }],
        ..Default::default()
    };
    out.virtual_services.push(
        shared.virtual_service(&format!("{}-http", explainer.service), route),
    );
}

fn destination(route: &PredictorRoute, port: i32) -> Destination {
    Destination {
        host: route.service.clone(),
        subset: route.predictor.clone(),
        port: PortSelector { number: port },
    }
}

fn destination_rule(
    shared: &Shared<'_>,
    host: &str,
    route: &PredictorRoute,
    config: &IstioConfig,
) -> DestinationRule {
    DestinationRule::new(
        shared.metadata(host),
        DestinationRuleSpec {
            host: host.to_string(),
            subsets: vec![Subset {
                name: route.predictor.clone(),
                labels: BTreeMap::from([("version".to_string(), route.version.clone())]),
            }],
            traffic_policy: config
                .tls_mode
                .as_ref()
                .filter(|m| !m.is_empty())
                .map(|mode| TrafficPolicy {
                    tls: TlsSettings { mode: mode.clone() },
                }),
        },
    )
}

/// Retries apply only when `seldon.io/istio-retries` is set
fn retries(deployment: &NormalizedDeployment) -> Result<Option<HttpRetry>> {
    if annotation(deployment, annotations::ISTIO_RETRIES).is_none() {
        return Ok(None);
    }
    let attempts = int_annotation(deployment, annotations::ISTIO_RETRIES, 0)?;
    let timeout = int_annotation(deployment, annotations::ISTIO_RETRIES_TIMEOUT, 1)?;
    Ok((attempts > 0).then(|| HttpRetry {
        attempts,
        per_try_timeout: format!("{timeout}s"),
        retry_on: RETRY_ON.to_string(),
    }))
}
