//! Deterministic names for owned resources
//!
//! Every generated name is a valid DNS-1123 label. Names that would exceed 63
//! characters are replaced by `seldon-<hash>` of the full name so two long
//! inputs never collide by truncation.

use crate::kube_utils::deterministic_hash;
use crate::labels;

/// Maximum length of a DNS-1123 label
pub const MAX_NAME_LEN: usize = 63;

/// Lowercase and replace characters invalid in DNS names with `-`
pub fn cleanup_dns_name(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect()
}

fn bounded(name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        format!("seldon-{}", deterministic_hash(&name))
    } else {
        cleanup_dns_name(&name)
    }
}

/// Truncate to 63 characters and trim a trailing `-`
pub fn truncate_name(name: &str) -> String {
    let truncated: String = name.chars().take(MAX_NAME_LEN).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Key of a predictor; names its external service and traffic subset
pub fn predictor_key(sdep: &str, predictor: &str) -> String {
    bounded(format!("{sdep}-{predictor}"))
}

/// Workload name for the `index`th component spec of a predictor
///
/// An explicit metadata name wins; otherwise the name lists every container
/// the component hosts.
pub fn deployment_name(
    sdep: &str,
    predictor: &str,
    explicit: Option<&str>,
    index: usize,
    containers: &[&str],
) -> String {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let mut name = format!("{sdep}-{predictor}-{index}");
    for c in containers {
        name.push('-');
        name.push_str(c);
    }
    bounded(name)
}

/// Workload name of a dedicated orchestrator
pub fn svc_orch_name(sdep: &str, predictor: &str) -> String {
    bounded(format!("{sdep}-{predictor}-svc-orch"))
}

/// Internal service name for one graph-unit container
pub fn container_service_name(sdep: &str, predictor: &str, container: &str) -> String {
    bounded(format!("{sdep}-{predictor}-{container}"))
}

/// Selector label key scoping a service to one container
pub fn container_service_key(container: &str) -> String {
    format!("{}-{}", labels::SELDON_APP_SVC, container)
}

/// Workload and service name of a predictor's explainer
pub fn explainer_name(sdep: &str, predictor: &str) -> String {
    bounded(format!("{sdep}-{predictor}-explainer"))
}

/// Cluster-local DNS name of a service
pub fn service_host(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}.svc.cluster.local")
}
