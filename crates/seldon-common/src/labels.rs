//! Label keys and values stamped onto owned resources

/// Deployment id shared by every owned resource
pub const SELDON_ID: &str = "seldon-deployment-id";

/// Groups pods behind a predictor or explainer service
pub const SELDON_APP: &str = "seldon-app";

/// Prefix of the per-container service selector key
pub const SELDON_APP_SVC: &str = "seldon-app-svc";

/// Marks a workload that hosts the orchestrator
pub const CONTAINS_SVC_ORCH: &str = "seldon-deployment-contains-svcorch";

/// Generic app label
pub const APP: &str = "app";

/// Version label used for traffic subsets
pub const VERSION: &str = "version";

/// Log shipping opt-in
pub const FLUENTD: &str = "fluentd";

/// Managed-by label on predictor services
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY`]
pub const MANAGED_BY_VALUE: &str = "seldon-core";

/// Selects which operator instance owns a declaration
pub const CONTROLLER_ID: &str = "seldon.io/controller-id";

/// Root HTTPProxy selector for Contour children
pub const CONTOUR_CONTROLLER: &str = "seldon.io/contour-controller";

// Role labels
/// Unit routes between children
pub const ROLE_ROUTER: &str = "seldon.io/router";
/// Unit combines children
pub const ROLE_COMBINER: &str = "seldon.io/combiner";
/// Unit is a model
pub const ROLE_MODEL: &str = "seldon.io/model";
/// Unit transforms input
pub const ROLE_TRANSFORMER: &str = "seldon.io/transformer";
/// Unit transforms output
pub const ROLE_OUTPUT_TRANSFORMER: &str = "seldon.io/output-transformer";
/// Resource belongs to an explainer
pub const ROLE_EXPLAINER: &str = "seldon.io/explainer";

// Traffic tier labels
/// Predictor receives the majority of traffic
pub const TIER_DEFAULT: &str = "seldon.io/default";
/// Predictor receives a minority of traffic
pub const TIER_CANARY: &str = "seldon.io/canary";
/// Predictor receives mirrored traffic
pub const TIER_SHADOW: &str = "seldon.io/shadow";
