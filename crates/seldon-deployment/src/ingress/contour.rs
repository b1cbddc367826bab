//! Contour routing
//!
//! Each deployment gets one `HTTPProxy` routing to its predictor services
//! and one per explainer. Without per-model virtual hosts the proxies are
//! children of a shared root proxy that includes every proxy carrying the
//! controller label.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use seldon_common::config::ContourConfig;
use seldon_common::kube_utils::HasApiResource;
use seldon_common::{annotations, labels, Error, Result};
use seldon_graph::NormalizedDeployment;

use super::{
    impl_api_defaults, GeneratedIngress, IngressMetadata, EXPLAINER_PATH_SUFFIX,
    GRPC_PREFIX_SELDON, GRPC_PREFIX_TENSORFLOW,
};
use crate::synth::{ExplainerRoute, SynthesizedComponents};

/// Upstream protocol of gRPC services
const GRPC_PROTOCOL: &str = "h2c";

// =============================================================================
// HTTPProxy
// =============================================================================

/// Contour HTTPProxy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxy {
    /// API version
    #[serde(default = "HttpProxy::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "HttpProxy::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: IngressMetadata,
    /// Proxy specification
    pub spec: HttpProxySpec,
}

impl HasApiResource for HttpProxy {
    const API_VERSION: &'static str = "projectcontour.io/v1";
    const KIND: &'static str = "HTTPProxy";
}

impl_api_defaults!(HttpProxy);

impl HttpProxy {
    /// Create a new HTTPProxy
    pub fn new(metadata: IngressMetadata, spec: HttpProxySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// HTTPProxy spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpProxySpec {
    /// Virtual host, only on root proxies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<VirtualHost>,
    /// Routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ProxyRoute>,
    /// Child proxies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Include>,
}

/// Virtual host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VirtualHost {
    /// Fully qualified domain name
    pub fqdn: String,
}

/// Route
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRoute {
    /// Match conditions
    pub conditions: Vec<MatchCondition>,
    /// Upstream services
    pub services: Vec<ProxyService>,
    /// Prefix rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite_policy: Option<PathRewritePolicy>,
}

/// Route condition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatchCondition {
    /// Path prefix
    pub prefix: String,
}

/// Upstream service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProxyService {
    /// Service name
    pub name: String,
    /// Service port
    pub port: i32,
    /// Traffic percentage
    #[serde(default)]
    pub weight: i64,
    /// Receives mirrored traffic only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mirror: bool,
    /// Upstream protocol, `h2c` for gRPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Prefix rewrite
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathRewritePolicy {
    /// Replacements
    pub replace_prefix: Vec<ReplacePrefix>,
}

/// One prefix replacement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplacePrefix {
    /// Matched prefix
    pub prefix: String,
    /// Replacement
    pub replacement: String,
}

/// Child proxy reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Include {
    /// Child name
    pub name: String,
    /// Child namespace
    pub namespace: String,
}

// =============================================================================
// Generation
// =============================================================================

/// HTTPProxies for a deployment and its explainers
pub fn generate(
    config: &ContourConfig,
    deployment: &NormalizedDeployment,
    components: &SynthesizedComponents,
) -> Result<GeneratedIngress> {
    let name = &deployment.name;
    let namespace = &deployment.namespace;

    let services = |grpc: bool| -> Vec<ProxyService> {
        components
            .routes
            .iter()
            .map(|r| ProxyService {
                name: r.service.clone(),
                port: if grpc { r.grpc_port } else { r.http_port },
                weight: i64::from(r.traffic),
                mirror: r.shadow,
                protocol: grpc.then(|| GRPC_PROTOCOL.to_string()),
            })
            .collect()
    };

    let mut routes = Vec::new();
    if components.routes.iter().all(|r| r.http_port > 0) {
        routes.push(http_route(
            config,
            format!("/seldon/{namespace}/{name}/"),
            services(false),
        ));
    }
    if components.routes.iter().all(|r| r.grpc_port > 0) {
        for prefix in [GRPC_PREFIX_SELDON, GRPC_PREFIX_TENSORFLOW] {
            routes.push(ProxyRoute {
                conditions: vec![MatchCondition {
                    prefix: prefix.to_string(),
                }],
                services: services(true),
                path_rewrite_policy: None,
            });
        }
    }

    let mut out = GeneratedIngress::default();
    out.http_proxies.push(HttpProxy::new(
        metadata(config, name, deployment),
        HttpProxySpec {
            virtualhost: virtual_host(config, &config.predictor_fqdn_template, deployment)?,
            routes,
            includes: Vec::new(),
        },
    ));
    for explainer in &components.explainer_routes {
        out.http_proxies
            .push(explainer_proxy(config, deployment, explainer)?);
    }
    Ok(out)
}

fn explainer_proxy(
    config: &ContourConfig,
    deployment: &NormalizedDeployment,
    explainer: &ExplainerRoute,
) -> Result<HttpProxy> {
    let prefix = format!(
        "/seldon/{}/{}{EXPLAINER_PATH_SUFFIX}/{}/",
        deployment.namespace, deployment.name, explainer.predictor
    );
    let route = http_route(
        config,
        prefix,
        vec![ProxyService {
            name: explainer.service.clone(),
            port: explainer.port,
            weight: 100,
            mirror: false,
            protocol: None,
        }],
    );
    Ok(HttpProxy::new(
        metadata(config, &explainer.service, deployment),
        HttpProxySpec {
            virtualhost: virtual_host(config, &config.explainer_fqdn_template, deployment)?,
            routes: vec![route],
            includes: Vec::new(),
        },
    ))
}

/// Route on `/`, or on `prefix` rewritten to `/` when path rewriting is on
fn http_route(config: &ContourConfig, prefix: String, services: Vec<ProxyService>) -> ProxyRoute {
    if !config.path_rewrite {
        return ProxyRoute {
            conditions: vec![MatchCondition {
                prefix: "/".to_string(),
            }],
            services,
            path_rewrite_policy: None,
        };
    }
    ProxyRoute {
        conditions: vec![MatchCondition {
            prefix: prefix.clone(),
        }],
        services,
        path_rewrite_policy: Some(PathRewritePolicy {
            replace_prefix: vec![ReplacePrefix {
                prefix,
                replacement: "/".to_string(),
            }],
        }),
    }
}

fn metadata(config: &ContourConfig, name: &str, deployment: &NormalizedDeployment) -> IngressMetadata {
    let mut metadata = IngressMetadata::owned(name, &deployment.namespace, &deployment.name);
    metadata.labels.insert(
        labels::CONTOUR_CONTROLLER.to_string(),
        config.controller_label.clone(),
    );
    if let Some(class) = config.ingress_class.as_ref().filter(|c| !c.is_empty()) {
        metadata
            .annotations
            .insert(annotations::CONTOUR_INGRESS_CLASS.to_string(), class.clone());
    }
    metadata
}

fn virtual_host(
    config: &ContourConfig,
    template: &str,
    deployment: &NormalizedDeployment,
) -> Result<Option<VirtualHost>> {
    if !config.per_model_vhost {
        return Ok(None);
    }
    let fqdn = render_fqdn(template, &deployment.name, &deployment.namespace)?;
    Ok(Some(VirtualHost { fqdn }))
}

/// Expand `{{.Name}}` and `{{.Namespace}}` placeholders, optionally
/// qualified with `.ObjectMeta`
pub fn render_fqdn(template: &str, name: &str, namespace: &str) -> Result<String> {
    let mut out = template.to_string();
    for (placeholders, value) in [
        (["{{.Name}}", "{{.ObjectMeta.Name}}"], name),
        (["{{.Namespace}}", "{{.ObjectMeta.Namespace}}"], namespace),
    ] {
        for placeholder in placeholders {
            out = out.replace(placeholder, value);
        }
    }
    if out.contains("{{") {
        return Err(Error::config(format!(
            "unsupported placeholder in Contour FQDN template: {template}"
        )));
    }
    Ok(out)
}

/// Shared root proxy including every labeled child proxy
///
/// The root itself is never included, even when it carries the label.
pub fn root_proxy(config: &ContourConfig, children: impl IntoIterator<Item = Include>) -> HttpProxy {
    let mut includes: Vec<Include> = children
        .into_iter()
        .filter(|c| !(c.name == config.vhost_name && c.namespace == config.vhost_namespace))
        .collect();
    includes.sort();
    includes.dedup();

    let metadata = IngressMetadata {
        name: config.vhost_name.clone(),
        namespace: config.vhost_namespace.clone(),
        labels: BTreeMap::from([
            (
                labels::CONTOUR_CONTROLLER.to_string(),
                config.controller_label.clone(),
            ),
            (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
        ]),
        annotations: BTreeMap::new(),
    };
    HttpProxy::new(
        metadata,
        HttpProxySpec {
            virtualhost: Some(VirtualHost {
                fqdn: config.vhost_fqdn.clone(),
            }),
            routes: Vec::new(),
            includes,
        },
    )
}
