//! Custom Resource Definitions for the Seldon operator

mod graph;
mod seldon_deployment;
mod types;

pub use graph::{role_labels, Endpoint, Logger, Parameter, PredictiveUnit};
pub use seldon_deployment::{
    Addressable, ComponentDeploymentStatus, ComponentMetadata, ComponentServiceStatus,
    DeploymentState, Explainer, PredictorSpec, SeldonDeployment, SeldonDeploymentSpec,
    SeldonDeploymentStatus, SeldonHpaSpec, SeldonPdbSpec, SeldonPodSpec, SvcOrchSpec,
};
pub use types::{
    EndpointType, Implementation, ParameterType, PredictiveUnitMethod, PredictiveUnitType,
    Protocol, ServerType, Transport,
};
