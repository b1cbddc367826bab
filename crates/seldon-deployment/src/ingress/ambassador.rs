//! Ambassador routing
//!
//! Ambassador discovers `Mapping`s from a YAML annotation on services, so
//! this backend creates no resources of its own: it annotates each predictor
//! and explainer service with its REST and gRPC mappings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use seldon_common::config::AmbassadorConfig;
use seldon_common::{annotations, Error, Result};
use seldon_graph::NormalizedDeployment;

use super::{annotation, int_annotation, GeneratedIngress, EXPLAINER_PATH_SUFFIX};
use crate::synth::SynthesizedComponents;

/// Separator between YAML documents in the annotation
pub const YAML_SEPARATOR: &str = "---\n";

/// URI regex matching gRPC prediction methods
pub const GRPC_REGEX: &str = "/(seldon.protos.*|tensorflow.serving.*)/.*";

/// Timeouts above this also raise the idle timeout
const IDLE_TIMEOUT_MS: i32 = 300_000;

const DEFAULT_TIMEOUT_MS: i32 = 3000;

/// One Ambassador `Mapping` document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AmbassadorMapping {
    /// Always `ambassador/v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Mapping`
    pub kind: String,
    /// Unique mapping name
    pub name: String,
    /// Whether the upstream speaks gRPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<bool>,
    /// Path prefix
    pub prefix: String,
    /// Whether `prefix` is a regular expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_regex: Option<bool>,
    /// Prefix replacement
    pub rewrite: String,
    /// Upstream `host:port`
    pub service: String,
    /// Request timeout
    pub timeout_ms: i32,
    /// Idle timeout, only for long request timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<i32>,
    /// Required headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Required headers, as regular expressions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regex_headers: BTreeMap<String, String>,
    /// Traffic percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    /// Receives mirrored traffic only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<bool>,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Ambassador instance the mapping belongs to
    #[serde(
        default,
        rename = "ambassador_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub instance_id: Option<String>,
}

/// Mapping retry policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Condition retried
    pub retry_on: String,
    /// Number of retries
    pub num_retries: i32,
}

/// Settings read once per deployment
struct Knobs<'a> {
    deployment: &'a NormalizedDeployment,
    external_name: String,
    rest_timeout: i32,
    grpc_timeout: i32,
    retries: i32,
    headers: BTreeMap<String, String>,
    regex_headers: BTreeMap<String, String>,
    instance_id: Option<String>,
    namespaced: bool,
}

/// What a set of mappings routes to
struct Target<'a> {
    /// Predictor name, suffixed for explainers
    name: String,
    /// External path segment
    external: String,
    service: &'a str,
    http_port: i32,
    grpc_port: i32,
    weight: Option<i32>,
    shadow: bool,
}

/// Mapping annotations for every predictor and explainer service
pub fn generate(
    config: &AmbassadorConfig,
    deployment: &NormalizedDeployment,
    components: &SynthesizedComponents,
) -> Result<GeneratedIngress> {
    let mut out = GeneratedIngress::default();
    let custom = annotation(deployment, annotations::AMBASSADOR_CONFIG);
    let knobs = Knobs::read(config, deployment)?;
    let first = components.routes.first().map(|r| r.predictor.as_str());

    for route in &components.routes {
        let target = Target {
            name: route.predictor.clone(),
            external: knobs.external_name.clone(),
            service: &route.service,
            http_port: route.http_port,
            grpc_port: route.grpc_port,
            weight: (first != Some(route.predictor.as_str())).then_some(route.traffic),
            shadow: route.shadow,
        };
        let value = match custom {
            Some(custom) => custom.to_string(),
            None => knobs.documents(&target)?,
        };
        insert(&mut out, &route.service, value);
    }

    for explainer in &components.explainer_routes {
        let target = Target {
            name: format!("{}{EXPLAINER_PATH_SUFFIX}", explainer.predictor),
            external: format!(
                "{}{EXPLAINER_PATH_SUFFIX}/{}",
                knobs.external_name, explainer.predictor
            ),
            service: &explainer.service,
            http_port: explainer.port,
            grpc_port: 0,
            weight: None,
            shadow: false,
        };
        let value = match custom {
            Some(custom) => custom.to_string(),
            None => knobs.documents(&target)?,
        };
        insert(&mut out, &explainer.service, value);
    }
    Ok(out)
}

fn insert(out: &mut GeneratedIngress, service: &str, value: String) {
    if value.is_empty() {
        return;
    }
    out.service_annotations
        .entry(service.to_string())
        .or_default()
        .insert(annotations::AMBASSADOR_SERVICE_CONFIG.to_string(), value);
}

impl<'a> Knobs<'a> {
    fn read(config: &AmbassadorConfig, deployment: &'a NormalizedDeployment) -> Result<Self> {
        Ok(Self {
            deployment,
            external_name: annotation(deployment, annotations::AMBASSADOR_SERVICE)
                .unwrap_or(&deployment.name)
                .to_string(),
            rest_timeout: int_annotation(deployment, annotations::REST_TIMEOUT, DEFAULT_TIMEOUT_MS)?,
            grpc_timeout: int_annotation(deployment, annotations::GRPC_TIMEOUT, DEFAULT_TIMEOUT_MS)?,
            retries: int_annotation(deployment, annotations::AMBASSADOR_RETRIES, 0)?,
            headers: header_pairs(annotation(deployment, annotations::AMBASSADOR_HEADER))?,
            regex_headers: header_pairs(annotation(
                deployment,
                annotations::AMBASSADOR_REGEX_HEADER,
            ))?,
            instance_id: annotation(deployment, annotations::AMBASSADOR_ID)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            namespaced: config.single_namespace,
        })
    }

    /// Cluster-wide mappings, plus namespace-local ones in single-namespace
    /// mode, for whichever protocols the target exposes
    fn documents(&self, target: &Target<'_>) -> Result<String> {
        let mut docs = Vec::new();
        let scopes: &[bool] = if self.namespaced { &[true, false] } else { &[true] };
        for &with_namespace in scopes {
            if target.http_port > 0 {
                docs.push(self.rest(target, with_namespace));
            }
            if target.grpc_port > 0 {
                docs.push(self.grpc(target, with_namespace));
            }
        }
        let mut out = String::new();
        for doc in docs {
            let yaml = serde_yaml::to_string(&doc)
                .map_err(|e| Error::serialization_for_kind("Mapping", e.to_string()))?;
            out.push_str(YAML_SEPARATOR);
            out.push_str(&yaml);
        }
        Ok(out)
    }

    fn rest(&self, target: &Target<'_>, with_namespace: bool) -> AmbassadorMapping {
        let namespace = &self.deployment.namespace;
        let (name, prefix) = if with_namespace {
            (
                self.mapping_name(Some(namespace), &target.name, "rest"),
                format!("/seldon/{namespace}/{}/", target.external),
            )
        } else {
            (
                self.mapping_name(None, &target.name, "rest"),
                format!("/seldon/{}/", target.external),
            )
        };
        AmbassadorMapping {
            name,
            prefix,
            rewrite: "/".to_string(),
            service: format!("{}.{namespace}:{}", target.service, target.http_port),
            headers: self.headers.clone(),
            ..self.common(target, self.rest_timeout)
        }
    }

    fn grpc(&self, target: &Target<'_>, with_namespace: bool) -> AmbassadorMapping {
        let namespace = &self.deployment.namespace;
        let mut headers = BTreeMap::from([("seldon".to_string(), target.external.clone())]);
        let name = if with_namespace {
            headers.insert("namespace".to_string(), namespace.clone());
            self.mapping_name(Some(namespace), &target.name, "grpc")
        } else {
            self.mapping_name(None, &target.name, "grpc")
        };
        headers.extend(self.headers.clone());
        AmbassadorMapping {
            name,
            grpc: Some(true),
            prefix: GRPC_REGEX.to_string(),
            prefix_regex: Some(true),
            rewrite: String::new(),
            service: format!("{}.{namespace}:{}", target.service, target.grpc_port),
            headers,
            ..self.common(target, self.grpc_timeout)
        }
    }

    fn common(&self, target: &Target<'_>, timeout: i32) -> AmbassadorMapping {
        AmbassadorMapping {
            api_version: "ambassador/v1".to_string(),
            kind: "Mapping".to_string(),
            timeout_ms: timeout,
            idle_timeout_ms: (timeout > IDLE_TIMEOUT_MS).then_some(timeout),
            regex_headers: self.regex_headers.clone(),
            weight: target.weight,
            shadow: target.shadow.then_some(true),
            retry_policy: (self.retries != 0).then(|| RetryPolicy {
                retry_on: "gateway-error".to_string(),
                num_retries: self.retries,
            }),
            instance_id: self.instance_id.clone(),
            ..Default::default()
        }
    }

    fn mapping_name(&self, namespace: Option<&str>, name: &str, kind: &str) -> String {
        match namespace {
            Some(ns) => format!("seldon_{ns}_{}_{name}_{kind}_mapping", self.deployment.name),
            None => format!("seldon_{}_{name}_{kind}_mapping", self.deployment.name),
        }
    }
}

/// Parse `key:value[:key:value...]`
fn header_pairs(raw: Option<&str>) -> Result<BTreeMap<String, String>> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(BTreeMap::new());
    };
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    if parts.len() % 2 != 0 {
        return Err(Error::config(format!(
            "header annotation must be key:value pairs: {raw}"
        )));
    }
    Ok(parts
        .chunks(2)
        .map(|kv| (kv[0].to_string(), kv[1].to_string()))
        .collect())
}
