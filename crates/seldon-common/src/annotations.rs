//! Annotation keys read from declarations or written onto owned resources

/// Run the orchestrator in its own workload
pub const ENGINE_SEPARATE_POD: &str = "seldon.io/engine-separate-pod";
/// Run without an orchestrator (single-unit graphs only)
pub const NO_ENGINE: &str = "seldon.io/no-engine";
/// Predictor services are headless unless set to "false"
pub const HEADLESS_SVC: &str = "seldon.io/headless-svc";
/// Orchestrator request-logger queue size
pub const LOGGER_QUEUE_SIZE: &str = "seldon.io/executor-logger-queue-size";
/// Orchestrator request-logger write timeout
pub const LOGGER_WRITE_TIMEOUT_MS: &str = "seldon.io/executor-logger-write-timeout-ms";

/// Istio gateway for generated VirtualServices
pub const ISTIO_GATEWAY: &str = "seldon.io/istio-gateway";
/// Istio retry attempts
pub const ISTIO_RETRIES: &str = "seldon.io/istio-retries";
/// Istio per-try timeout
pub const ISTIO_RETRIES_TIMEOUT: &str = "seldon.io/istio-retries-timeout";

/// Complete user-provided Ambassador config
pub const AMBASSADOR_CONFIG: &str = "seldon.io/ambassador-config";
/// External name used in Ambassador prefixes
pub const AMBASSADOR_SERVICE: &str = "seldon.io/ambassador-service-name";
/// Header matches, `k:v` pairs separated by commas
pub const AMBASSADOR_HEADER: &str = "seldon.io/ambassador-header";
/// Regex header matches
pub const AMBASSADOR_REGEX_HEADER: &str = "seldon.io/ambassador-regex-header";
/// Ambassador instance id
pub const AMBASSADOR_ID: &str = "seldon.io/ambassador-id";
/// Ambassador retry attempts
pub const AMBASSADOR_RETRIES: &str = "seldon.io/ambassador-retries";
/// REST request timeout in milliseconds
pub const REST_TIMEOUT: &str = "seldon.io/rest-timeout";
/// gRPC request timeout in milliseconds
pub const GRPC_TIMEOUT: &str = "seldon.io/grpc-timeout";
/// Annotation holding generated Ambassador mappings on a Service
pub const AMBASSADOR_SERVICE_CONFIG: &str = "getambassador.io/config";

/// Contour ingress class
pub const CONTOUR_INGRESS_CLASS: &str = "projectcontour.io/ingress.class";

/// Prometheus scrape path on pod templates
pub const PROMETHEUS_PATH: &str = "prometheus.io/path";
/// Prometheus scrape opt-in on pod templates
pub const PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";
