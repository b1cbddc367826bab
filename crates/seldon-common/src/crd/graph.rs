//! Predictive-unit graph types
//!
//! The inference graph is an owned tree: every [`PredictiveUnit`] holds its
//! children by value. Traversal helpers visit units in pre-order, which is the
//! order port allocation and prepackaged-server injection rely on.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    EndpointType, Implementation, ParameterType, PredictiveUnitMethod, PredictiveUnitType,
};

/// Network endpoint of a predictive unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Endpoint {
    /// Host the orchestrator uses to reach the unit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_host: String,

    /// Port on the unit's chosen transport
    #[serde(default, skip_serializing_if = "is_zero")]
    pub service_port: i32,

    /// Transport kind of the unit
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<EndpointType>,

    /// Allocated HTTP port
    #[serde(default, rename = "httpPort", skip_serializing_if = "is_zero")]
    pub http_port: i32,

    /// Allocated gRPC port
    #[serde(default, rename = "grpcPort", skip_serializing_if = "is_zero")]
    pub grpc_port: i32,
}

impl Endpoint {
    /// Whether the unit speaks gRPC
    pub fn is_grpc(&self) -> bool {
        self.type_ == Some(EndpointType::Grpc)
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Named, typed initialization parameter passed to a unit
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Value, always carried as text
    pub value: String,
    /// Declared type of the value
    #[serde(rename = "type")]
    pub type_: ParameterType,
}

/// Request logging configuration for a unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Logger {
    /// Sink URL; the orchestrator default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// What to log: request, response or all
    #[serde(default)]
    pub mode: String,
}

/// One node of an inference graph
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictiveUnit {
    /// Unit name, unique within the predictor; matches a container name
    pub name: String,

    /// Child units, visited in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PredictiveUnit>,

    /// Role of the unit
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<PredictiveUnitType>,

    /// Implementation backing the unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Implementation>,

    /// Explicit capabilities for units without a well-known type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<PredictiveUnitMethod>>,

    /// Network endpoint, filled in by normalization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    /// Initialization parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    /// Location of the model artifact to provision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_uri: Option<String>,

    /// Service account used by the pod and the artifact provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Secret exposed as environment to the artifact provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_ref_name: Option<String>,

    /// Image override for the artifact provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_initializer_image: Option<String>,

    /// Request logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<Logger>,
}

impl PredictiveUnit {
    /// Visit this unit and all descendants in pre-order
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a PredictiveUnit)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Mutable pre-order visit
    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut PredictiveUnit)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    /// All units of the graph in pre-order
    pub fn units(&self) -> Vec<&PredictiveUnit> {
        let mut out = Vec::new();
        self.walk(&mut |u| out.push(u));
        out
    }

    /// Number of units in the graph rooted here
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(PredictiveUnit::size).sum::<usize>()
    }

    /// Find a unit by name anywhere in the graph
    pub fn find(&self, name: &str) -> Option<&PredictiveUnit> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Mutable lookup by name
    pub fn find_mut(&mut self, name: &str) -> Option<&mut PredictiveUnit> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(name))
    }

    /// Whether the unit is served by a prepackaged model server
    pub fn is_prepack(&self) -> bool {
        self.implementation
            .as_ref()
            .is_some_and(Implementation::is_prepack)
    }

    /// Parameters plus extras as the JSON text the runtimes read from
    /// `PREDICTIVE_UNIT_PARAMETERS`
    pub fn parameters_json(params: &[Parameter]) -> String {
        serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Labels that describe a unit's role, keyed by label name
pub fn role_labels(unit: &PredictiveUnit) -> BTreeMap<String, String> {
    use crate::labels;

    let key = match unit.type_.as_ref() {
        Some(PredictiveUnitType::Router) => Some(labels::ROLE_ROUTER),
        Some(PredictiveUnitType::Combiner) => Some(labels::ROLE_COMBINER),
        Some(PredictiveUnitType::Model) => Some(labels::ROLE_MODEL),
        Some(PredictiveUnitType::Transformer) => Some(labels::ROLE_TRANSFORMER),
        Some(PredictiveUnitType::OutputTransformer) => Some(labels::ROLE_OUTPUT_TRANSFORMER),
        _ => None,
    };
    key.into_iter()
        .map(|k| (k.to_string(), "true".to_string()))
        .collect()
}
