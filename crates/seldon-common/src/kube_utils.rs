//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::DeploymentCondition;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// Trait for routing resources whose API version and kind are known at
/// compile time but which have no generated k8s-openapi type.
///
/// ```ignore
/// impl HasApiResource for VirtualService {
///     const API_VERSION: &'static str = "networking.istio.io/v1beta1";
///     const KIND: &'static str = "VirtualService";
/// }
///
/// let ar = VirtualService::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "networking.istio.io/v1beta1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VirtualService")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an `ApiResource` from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version)
///
/// ```ignore
/// let (group, version) = parse_api_version("getambassador.io/v2");
/// assert_eq!(group, "getambassador.io");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Routing kinds whose plural is not derivable by suffix rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("virtualservice", "virtualservices"),
    ("destinationrule", "destinationrules"),
    ("httpproxy", "httpproxies"),
    ("mapping", "mappings"),
    ("seldondeployment", "seldondeployments"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if ["s", "x", "ch", "sh"].iter().any(|suffix| lower.ends_with(suffix)) {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256; stable across toolchains, so safe for generated names.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout; bounds every call the reconciler makes
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let client_err = |what: &str, e: &dyn std::fmt::Display| {
        Error::internal_with_context("create_client", format!("{what}: {e}"))
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| client_err("failed to read kubeconfig", &e))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| client_err("failed to load kubeconfig", &e))?
        }
        None => Config::infer()
            .await
            .map_err(|e| client_err("failed to infer config", &e))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| client_err("failed to create client", &e))
}

// =============================================================================
// Status helpers
// =============================================================================

/// Condition type reported by a Deployment once minimum availability is met
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type reported while a Deployment rollout makes progress
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition status value meaning false
pub const STATUS_FALSE: &str = "False";

/// Whether a Deployment condition of the given type is explicitly false
pub fn condition_is_false(conditions: &[DeploymentCondition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == STATUS_FALSE)
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grouped_and_core_api_versions() {
        assert_eq!(
            parse_api_version("networking.istio.io/v1beta1"),
            ("networking.istio.io".to_string(), "v1beta1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn pluralizes_routing_kinds() {
        assert_eq!(pluralize_kind("HTTPProxy"), "httpproxies");
        assert_eq!(pluralize_kind("VirtualService"), "virtualservices");
        assert_eq!(pluralize_kind("Mapping"), "mappings");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn builds_api_resource() {
        let ar = build_api_resource("projectcontour.io/v1", "HTTPProxy");
        assert_eq!(ar.group, "projectcontour.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "httpproxies");
    }

    #[test]
    fn hash_is_stable_and_compact() {
        let a = deterministic_hash("iris-default-0-classifier");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("iris-default-0-classifier"));
        assert_ne!(a, deterministic_hash("iris-default-1-classifier"));
    }

    #[test]
    fn detects_false_conditions() {
        let conditions = vec![
            DeploymentCondition {
                type_: CONDITION_PROGRESSING.to_string(),
                status: STATUS_FALSE.to_string(),
                ..Default::default()
            },
            DeploymentCondition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: "True".to_string(),
                ..Default::default()
            },
        ];
        assert!(condition_is_false(&conditions, CONDITION_PROGRESSING));
        assert!(!condition_is_false(&conditions, CONDITION_AVAILABLE));
    }
}
