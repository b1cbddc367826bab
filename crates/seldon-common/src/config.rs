//! Operator configuration
//!
//! [`OperatorConfig`] is built once at process start from the environment and
//! passed by reference into normalization, validation and synthesis, which
//! never read the environment themselves. [`ClusterConfig`] is read from the
//! `seldon-config` ConfigMap on every reconcile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::{Implementation, Protocol};
use crate::{Error, Result};

/// Name of the ConfigMap holding cluster configuration
pub const CLUSTER_CONFIG_MAP: &str = "seldon-config";

/// ConfigMap key for prepackaged server images
pub const PREDICTOR_SERVERS_KEY: &str = "predictor_servers";
/// ConfigMap key for the artifact provisioner
pub const STORAGE_INITIALIZER_KEY: &str = "storageInitializer";
/// ConfigMap key for explainer images
pub const EXPLAINER_KEY: &str = "explainer";

/// Image used for the artifact provisioner when nothing else is configured
pub const DEFAULT_STORAGE_INITIALIZER_IMAGE: &str = "gcr.io/kfserving/model-initializer:latest";

// =============================================================================
// Environment lookup helpers
// =============================================================================

struct Env<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn int<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{key} is not an integer: {v}"))),
            None => Ok(default),
        }
    }

    fn optional_int(&self, key: &str) -> Result<Option<i64>> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| Error::config(format!("{key} is not an integer: {v}")))
            })
            .transpose()
    }
}

// =============================================================================
// Operator configuration
// =============================================================================

/// Base numbers for per-container port allocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortBases {
    /// First HTTP port handed out
    pub http: i32,
    /// First gRPC port handed out
    pub grpc: i32,
    /// First metrics port handed out
    pub metrics: i32,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            http: 9000,
            grpc: 9500,
            metrics: 6000,
        }
    }
}

/// Settings of the orchestrator (executor) container
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorConfig {
    /// Container image; required whenever an orchestrator is placed
    pub image: Option<String>,
    /// Image pull policy
    pub pull_policy: String,
    /// HTTP port
    pub http_port: i32,
    /// gRPC port
    pub grpc_port: i32,
    /// Prometheus scrape path
    pub prometheus_path: String,
    /// Name of the metrics port
    pub metrics_port_name: String,
    /// `runAsUser` for the container
    pub user: Option<i64>,
    /// Service account of a dedicated orchestrator pod
    pub service_account: String,
    /// Default request-logger sink
    pub logger_endpoint: String,
    /// Default request-logger queue size
    pub logger_queue_size: i64,
    /// Default request-logger write timeout
    pub logger_write_timeout_ms: i64,
    /// Whether health checks probe the whole graph
    pub full_health_checks: bool,
    /// Default CPU request
    pub cpu_request: String,
    /// Default CPU limit
    pub cpu_limit: String,
    /// Default memory request
    pub memory_request: String,
    /// Default memory limit
    pub memory_limit: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            image: None,
            pull_policy: "IfNotPresent".to_string(),
            http_port: 8000,
            grpc_port: 5001,
            prometheus_path: "/prometheus".to_string(),
            metrics_port_name: "metrics".to_string(),
            user: None,
            service_account: "default".to_string(),
            logger_endpoint: "http://default-broker".to_string(),
            logger_queue_size: 10000,
            logger_write_timeout_ms: 2000,
            full_health_checks: false,
            cpu_request: "500m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "512Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

/// Image overrides injected by the packaging (RELATED_IMAGE_*)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelatedImages {
    /// Implementation -> protocol -> full image reference
    pub servers: BTreeMap<String, BTreeMap<String, String>>,
    /// Explainer image for the seldon/tensorflow protocols
    pub explainer: Option<String>,
    /// Explainer image for the V2 protocol
    pub explainer_v2: Option<String>,
    /// Artifact provisioner image
    pub storage_initializer: Option<String>,
}

impl RelatedImages {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Self {
        let table: &[(&str, &str, &str)] = &[
            ("SKLEARN_SERVER", "seldon", "RELATED_IMAGE_SKLEARNSERVER"),
            ("SKLEARN_SERVER", "v2", "RELATED_IMAGE_SKLEARNSERVER_V2"),
            ("XGBOOST_SERVER", "seldon", "RELATED_IMAGE_XGBOOSTSERVER"),
            ("XGBOOST_SERVER", "v2", "RELATED_IMAGE_XGBOOSTSERVER_V2"),
            ("MLFLOW_SERVER", "seldon", "RELATED_IMAGE_MLFLOWSERVER"),
            ("MLFLOW_SERVER", "v2", "RELATED_IMAGE_MLFLOWSERVER_V2"),
            ("TENSORFLOW_SERVER", "tensorflow", "RELATED_IMAGE_TENSORFLOW"),
            ("TENSORFLOW_SERVER", "seldon", "RELATED_IMAGE_TFPROXY"),
        ];
        let mut servers: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (server, protocol, key) in table {
            if let Some(image) = env.get(key) {
                servers
                    .entry(server.to_string())
                    .or_default()
                    .insert(protocol.to_string(), image);
            }
        }
        Self {
            servers,
            explainer: env.get("RELATED_IMAGE_EXPLAINER"),
            explainer_v2: env.get("RELATED_IMAGE_EXPLAINER_V2"),
            storage_initializer: env.get("RELATED_IMAGE_STORAGE_INITIALIZER"),
        }
    }
}

/// Istio backend settings
#[derive(Clone, Debug, PartialEq)]
pub struct IstioConfig {
    /// Default gateway
    pub gateway: String,
    /// TLS mode written onto DestinationRules
    pub tls_mode: Option<String>,
}

/// Contour backend settings
#[derive(Clone, Debug, PartialEq)]
pub struct ContourConfig {
    /// `projectcontour.io/ingress.class` value
    pub ingress_class: Option<String>,
    /// Value of the controller label joining children to the root proxy
    pub controller_label: String,
    /// Namespace of the root proxy
    pub vhost_namespace: String,
    /// Name of the root proxy
    pub vhost_name: String,
    /// FQDN of the root proxy
    pub vhost_fqdn: String,
    /// One virtual host per deployment instead of a shared root
    pub per_model_vhost: bool,
    /// Route under `/seldon/<ns>/<name>/` and rewrite to `/`
    pub path_rewrite: bool,
    /// FQDN template for predictor proxies
    pub predictor_fqdn_template: String,
    /// FQDN template for explainer proxies
    pub explainer_fqdn_template: String,
}

/// Ambassador backend settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AmbassadorConfig {
    /// Emit only namespace-qualified mappings
    pub single_namespace: bool,
}

/// Which ingress backends are enabled
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressConfig {
    /// Istio, when enabled
    pub istio: Option<IstioConfig>,
    /// Contour, when enabled
    pub contour: Option<ContourConfig>,
    /// Ambassador, when enabled
    pub ambassador: Option<AmbassadorConfig>,
}

/// Immutable process-wide configuration
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Port allocation bases
    pub ports: PortBases,
    /// Orchestrator settings
    pub executor: ExecutorConfig,
    /// Default `runAsUser` for unit pods
    pub default_user_id: Option<i64>,
    /// Default secret for artifact provisioning
    pub default_env_secret_ref: Option<String>,
    /// Image overrides
    pub related_images: RelatedImages,
    /// Enabled ingress backends
    pub ingress: IngressConfig,
    /// Only declarations labeled with this id are reconciled
    pub controller_id: Option<String>,
    /// Namespace holding the cluster ConfigMap
    pub controller_namespace: String,
    /// Restrict watches to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            ports: PortBases::default(),
            executor: ExecutorConfig::default(),
            default_user_id: None,
            default_env_secret_ref: None,
            related_images: RelatedImages::default(),
            ingress: IngressConfig::default(),
            controller_id: None,
            controller_namespace: "seldon-system".to_string(),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read configuration through an arbitrary lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let defaults = ExecutorConfig::default();

        let ports = PortBases {
            http: env.int("PREDICTIVE_UNIT_HTTP_SERVICE_PORT", 9000)?,
            grpc: env.int("PREDICTIVE_UNIT_GRPC_SERVICE_PORT", 9500)?,
            metrics: env.int("PREDICTIVE_UNIT_METRICS_SERVICE_PORT", 6000)?,
        };

        let executor = ExecutorConfig {
            image: env
                .get("RELATED_IMAGE_EXECUTOR")
                .or_else(|| env.get("EXECUTOR_CONTAINER_IMAGE_AND_VERSION")),
            pull_policy: env.string("EXECUTOR_CONTAINER_IMAGE_PULL_POLICY", &defaults.pull_policy),
            http_port: env.int("EXECUTOR_SERVER_PORT", defaults.http_port)?,
            grpc_port: env.int("EXECUTOR_SERVER_GRPC_PORT", defaults.grpc_port)?,
            prometheus_path: env.string("EXECUTOR_PROMETHEUS_PATH", &defaults.prometheus_path),
            metrics_port_name: env
                .string("EXECUTOR_SERVER_METRICS_PORT_NAME", &defaults.metrics_port_name),
            user: env.optional_int("EXECUTOR_CONTAINER_USER")?,
            service_account: env
                .string("EXECUTOR_CONTAINER_SERVICE_ACCOUNT_NAME", &defaults.service_account),
            logger_endpoint: env
                .string("EXECUTOR_REQUEST_LOGGER_DEFAULT_ENDPOINT", &defaults.logger_endpoint),
            logger_queue_size: env
                .int("EXECUTOR_REQUEST_LOGGER_WORK_QUEUE_SIZE", defaults.logger_queue_size)?,
            logger_write_timeout_ms: env.int(
                "EXECUTOR_REQUEST_LOGGER_WRITE_TIMEOUT_MS",
                defaults.logger_write_timeout_ms,
            )?,
            full_health_checks: env.flag("EXECUTOR_FULL_HEALTH_CHECKS"),
            cpu_request: env.string("EXECUTOR_DEFAULT_CPU_REQUEST", &defaults.cpu_request),
            cpu_limit: env.string("EXECUTOR_DEFAULT_CPU_LIMIT", &defaults.cpu_limit),
            memory_request: env.string("EXECUTOR_DEFAULT_MEMORY_REQUEST", &defaults.memory_request),
            memory_limit: env.string("EXECUTOR_DEFAULT_MEMORY_LIMIT", &defaults.memory_limit),
        };

        let ingress = IngressConfig {
            istio: env.flag("ISTIO_ENABLED").then(|| IstioConfig {
                gateway: env.string("ISTIO_GATEWAY", "seldon-gateway"),
                tls_mode: env.get("ISTIO_TLS_MODE"),
            }),
            contour: env.flag("CONTOUR_ENABLED").then(|| ContourConfig {
                ingress_class: env.get("CONTOUR_INGRESS_CLASS"),
                controller_label: env.string("CONTOUR_CONTROLLER_LABEL", "seldon"),
                vhost_namespace: env.string("CONTOUR_VIRTUALHOST_NAMESPACE", "projectcontour"),
                vhost_name: env.string("CONTOUR_VIRTUALHOST_NAME", "seldon"),
                vhost_fqdn: env.string("CONTOUR_VIRTUALHOST_FQDN", "seldon.io"),
                per_model_vhost: env.flag("CONTOUR_PER_MODEL_VHOST_ENABLED"),
                path_rewrite: env.flag("CONTOUR_DISABLE_PATH_REWRITE"),
                predictor_fqdn_template: env.string(
                    "CONTOUR_PREDICTOR_FQDN_TEMPLATE",
                    "{{.Name}}.{{.ObjectMeta.Namespace}}",
                ),
                explainer_fqdn_template: env.string(
                    "CONTOUR_EXPLAINER_FQDN_TEMPLATE",
                    "{{.Name}}-explainer.{{.ObjectMeta.Namespace}}",
                ),
            }),
            ambassador: env.flag("AMBASSADOR_ENABLED").then(|| AmbassadorConfig {
                single_namespace: env.flag("AMBASSADOR_SINGLE_NAMESPACE"),
            }),
        };

        Ok(Self {
            ports,
            executor,
            default_user_id: env.optional_int("DEFAULT_USER_ID")?,
            default_env_secret_ref: env.get("PREDICTIVE_UNIT_DEFAULT_ENV_SECRET_REF_NAME"),
            related_images: RelatedImages::from_env(&env),
            ingress,
            controller_id: env.get("CONTROLLER_ID"),
            controller_namespace: env.string("POD_NAMESPACE", "seldon-system"),
            watch_namespace: env.get("WATCH_NAMESPACE"),
        })
    }
}

// =============================================================================
// Cluster configuration
// =============================================================================

/// Image for one protocol of a prepackaged server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictorImageConfig {
    /// Image repository
    #[serde(default)]
    pub image: String,
    /// Tag appended when set
    #[serde(default)]
    pub default_image_version: String,
}

impl PredictorImageConfig {
    fn reference(&self) -> String {
        if self.default_image_version.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.default_image_version)
        }
    }
}

/// Images of one prepackaged server keyed by protocol
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PredictorServerConfig {
    /// Protocol -> image
    #[serde(default)]
    pub protocols: BTreeMap<String, PredictorImageConfig>,
}

impl PredictorServerConfig {
    fn image_for(&self, protocol: &Protocol) -> Option<&PredictorImageConfig> {
        let lookup = |p: &str| self.protocols.get(p);
        lookup(protocol.as_str()).or_else(|| match protocol {
            Protocol::V2 => lookup(Protocol::Kfserving.as_str()),
            Protocol::Kfserving => lookup(Protocol::V2.as_str()),
            _ => None,
        })
    }
}

/// Artifact provisioner settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInitializerConfig {
    /// Image override
    #[serde(default)]
    pub image: String,
    /// CPU request
    #[serde(default = "default_init_cpu_request")]
    pub cpu_request: String,
    /// CPU limit
    #[serde(default = "default_init_cpu_limit")]
    pub cpu_limit: String,
    /// Memory request
    #[serde(default = "default_init_memory_request")]
    pub memory_request: String,
    /// Memory limit
    #[serde(default = "default_init_memory_limit")]
    pub memory_limit: String,
}

fn default_init_cpu_request() -> String {
    "100m".to_string()
}
fn default_init_cpu_limit() -> String {
    "1".to_string()
}
fn default_init_memory_request() -> String {
    "100Mi".to_string()
}
fn default_init_memory_limit() -> String {
    "1Gi".to_string()
}

impl Default for StorageInitializerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            cpu_request: default_init_cpu_request(),
            cpu_limit: default_init_cpu_limit(),
            memory_request: default_init_memory_request(),
            memory_limit: default_init_memory_limit(),
        }
    }
}

/// Explainer images
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ExplainerConfig {
    /// Image for the seldon/tensorflow protocols
    #[serde(default)]
    pub image: String,
    /// Image for the V2 protocol
    #[serde(default)]
    pub image_v2: String,
}

/// Cluster configuration read from the `seldon-config` ConfigMap
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterConfig {
    /// Prepackaged servers by implementation name
    pub predictor_servers: BTreeMap<String, PredictorServerConfig>,
    /// Artifact provisioner
    pub storage_initializer: StorageInitializerConfig,
    /// Explainer images
    pub explainer: ExplainerConfig,
}

impl ClusterConfig {
    /// Parse the ConfigMap data; absent keys give empty sections
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        fn section<T: serde::de::DeserializeOwned + Default>(
            data: &BTreeMap<String, String>,
            key: &str,
        ) -> Result<T> {
            match data.get(key) {
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    Error::config(format!("unable to parse {key} from {CLUSTER_CONFIG_MAP}: {e}"))
                }),
                None => Ok(T::default()),
            }
        }

        let config = Self {
            predictor_servers: section(data, PREDICTOR_SERVERS_KEY)?,
            storage_initializer: section(data, STORAGE_INITIALIZER_KEY)?,
            explainer: section(data, EXPLAINER_KEY)?,
        };

        let init = &config.storage_initializer;
        for (name, value) in [
            ("cpuRequest", &init.cpu_request),
            ("cpuLimit", &init.cpu_limit),
            ("memoryRequest", &init.memory_request),
            ("memoryLimit", &init.memory_limit),
        ] {
            if !is_quantity(value) {
                return Err(Error::config(format!(
                    "{STORAGE_INITIALIZER_KEY}.{name} is not a valid quantity: {value:?}"
                )));
            }
        }
        Ok(config)
    }

    /// Whether the implementation has a server entry
    pub fn has_server(&self, implementation: &Implementation) -> bool {
        self.predictor_servers.contains_key(implementation.as_str())
    }

    /// Resolve the image of a prepackaged server for a protocol
    ///
    /// Related-image overrides replace the configured image for a protocol,
    /// but only for servers that have a ConfigMap entry. Returns `None` when
    /// no image can be resolved.
    pub fn prepack_image(
        &self,
        implementation: &Implementation,
        protocol: &Protocol,
        related: &RelatedImages,
    ) -> Option<String> {
        let mut server = self.predictor_servers.get(implementation.as_str())?.clone();
        if let Some(overrides) = related.servers.get(implementation.as_str()) {
            for (proto, image) in overrides {
                server.protocols.insert(
                    proto.clone(),
                    PredictorImageConfig {
                        image: image.clone(),
                        default_image_version: String::new(),
                    },
                );
            }
        }
        server
            .image_for(protocol)
            .map(PredictorImageConfig::reference)
            .filter(|image| !image.is_empty())
    }

    /// Resolve the explainer image for a protocol
    pub fn explainer_image(&self, protocol: &Protocol, related: &RelatedImages) -> Option<String> {
        let (related_image, configured) = if protocol.is_v2() {
            (&related.explainer_v2, &self.explainer.image_v2)
        } else {
            (&related.explainer, &self.explainer.image)
        };
        related_image
            .clone()
            .or_else(|| Some(configured.clone()).filter(|i| !i.is_empty()))
    }
}

/// Whether `value` parses as a Kubernetes resource quantity
pub fn is_quantity(value: &str) -> bool {
    parse_quantity(value).is_some()
}

/// Parse a Kubernetes resource quantity into billionths of a unit
///
/// Equal amounts parse equal whatever their spelling: "0.5", "500m" and
/// "5e-1" all give 500_000_000, "1Gi" and "1024Mi" give the same value.
/// Precision below a nano-unit is rounded up, as the API server does.
pub fn parse_quantity(value: &str) -> Option<i128> {
    // (suffix, binary multiplier, decimal exponent); "" must stay last
    const SUFFIXES: &[(&str, i128, i32)] = &[
        ("Ki", 1 << 10, 0),
        ("Mi", 1 << 20, 0),
        ("Gi", 1 << 30, 0),
        ("Ti", 1 << 40, 0),
        ("Pi", 1 << 50, 0),
        ("Ei", 1 << 60, 0),
        ("n", 1, -9),
        ("u", 1, -6),
        ("m", 1, -3),
        ("k", 1, 3),
        ("M", 1, 6),
        ("G", 1, 9),
        ("T", 1, 12),
        ("P", 1, 15),
        ("E", 1, 18),
        ("", 1, 0),
    ];
    let value = value.trim();
    let (number, multiplier, suffix_exp) = SUFFIXES.iter().find_map(|(s, m, e)| {
        value
            .strip_suffix(s)
            .filter(|n| !n.is_empty())
            .map(|n| (n, *m, *e))
    })?;

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (mantissa, exponent) = match number.split_once(['e', 'E']) {
        Some((m, e)) => {
            let digits = e.strip_prefix(['+', '-']).unwrap_or(e);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (m, e.parse::<i32>().ok()?)
        }
        None => (number, 0),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if whole.len() + fraction.len() == 0 || !all_digits(whole) || !all_digits(fraction) {
        return None;
    }

    let mut amount: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let digit = i128::from(c.to_digit(10)?);
        amount = amount.checked_mul(10)?.checked_add(digit)?;
    }
    amount = amount.checked_mul(multiplier)?;

    let fraction_len = i32::try_from(fraction.len()).ok()?;
    let scale = suffix_exp
        .checked_add(exponent)?
        .checked_add(9)?
        .checked_sub(fraction_len)?;
    let amount = if scale >= 0 {
        amount.checked_mul(10_i128.checked_pow(u32::try_from(scale).ok()?)?)?
    } else {
        let divisor = 10_i128.checked_pow(u32::try_from(-scale).ok()?)?;
        (amount + divisor - 1) / divisor
    };
    Some(if negative { -amount } else { amount })
}
