//! Structural validation of normalized declarations
//!
//! Every check runs; violations are collected into one multi-cause
//! [`Error::Invalid`] instead of stopping at the first.

use std::collections::BTreeSet;

use seldon_common::config::{ClusterConfig, OperatorConfig};
use seldon_common::crd::{
    EndpointType, Implementation, PredictiveUnit, PredictiveUnitType, PredictorSpec, Protocol,
    SeldonDeploymentSpec, ServerType, Transport,
};
use seldon_common::{Error, FieldError, Result};
use tracing::debug;

use crate::normalize::has_no_engine;

/// Orchestrator env vars a Kafka server type cannot run without
pub const KAFKA_REQUIRED_ENV: [&str; 3] =
    ["KAFKA_BROKER", "KAFKA_INPUT_TOPIC", "KAFKA_OUTPUT_TOPIC"];

/// Validate a normalized declaration
///
/// Returns `Ok(())` or a single [`Error::Invalid`] listing every violation.
pub fn validate(
    name: &str,
    spec: &SeldonDeploymentSpec,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> Result<()> {
    let causes = violations(name, spec, config, cluster);
    if causes.is_empty() {
        Ok(())
    } else {
        debug!(deployment = name, causes = causes.len(), "declaration is invalid");
        Err(Error::invalid(name, causes))
    }
}

/// Every violation in declaration order
pub fn violations(
    name: &str,
    spec: &SeldonDeploymentSpec,
    config: &OperatorConfig,
    cluster: &ClusterConfig,
) -> Vec<FieldError> {
    let mut v = Validator {
        spec,
        config,
        cluster,
        errors: Vec::new(),
    };
    v.check_enums();
    v.check_predictors();
    v.check_transports();
    v.check_traffic(name);
    v.errors
}

struct Validator<'a> {
    spec: &'a SeldonDeploymentSpec,
    config: &'a OperatorConfig,
    cluster: &'a ClusterConfig,
    errors: Vec<FieldError>,
}

impl Validator<'_> {
    fn fail(
        &mut self,
        path: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.errors.push(FieldError::new(path, value, reason));
    }

    // =========================================================================
    // Deployment-wide checks
    // =========================================================================

    fn check_enums(&mut self) {
        let spec = self.spec;
        if let Some(protocol) = spec.protocol.as_ref().filter(|p| !p.is_recognized()) {
            self.fail("spec.protocol", protocol.as_str(), "Invalid protocol");
        }
        if let Some(transport) = spec.transport.as_ref().filter(|t| !t.is_recognized()) {
            self.fail("spec.transport", transport.as_str(), "Invalid transport");
        }
        if let Some(server_type) = spec.server_type.as_ref().filter(|s| !s.is_recognized()) {
            self.fail("spec.serverType", server_type.as_str(), "Invalid server type");
        }
    }

    fn check_predictors(&mut self) {
        let spec = self.spec;
        if spec.predictors.is_empty() {
            self.fail("spec.predictors", "", "At least one predictor is required");
            return;
        }

        let mut names = BTreeSet::new();
        for (i, predictor) in spec.predictors.iter().enumerate() {
            let path = format!("spec.predictors[{i}]");

            if !names.insert(predictor.name.as_str()) {
                self.fail(&path, &predictor.name, "Duplicate predictor name");
            }

            if has_no_engine(spec, predictor) && predictor.graph.size() > 1 {
                self.fail(
                    &path,
                    &predictor.name,
                    "Running without engine only valid for single element graphs",
                );
            }

            if spec.server_type() == ServerType::Kafka {
                for key in KAFKA_REQUIRED_ENV {
                    if predictor.svc_orch_spec.env_value(key).is_none() {
                        self.fail(
                            format!("{path}.svcOrchSpec.env"),
                            key,
                            format!("{key} must be set for the kafka server type"),
                        );
                    }
                }
            }

            let mut unit_names = BTreeSet::new();
            for unit in predictor.graph.units() {
                if !unit_names.insert(unit.name.as_str()) {
                    self.fail(format!("{path}.graph"), &unit.name, "Duplicate predictive unit name");
                }
            }

            self.check_unit(&predictor.graph, predictor, format!("{path}.graph"));
        }
    }

    fn check_transports(&mut self) {
        let spec = self.spec;
        let found: BTreeSet<&EndpointType> = spec
            .predictors
            .iter()
            .flat_map(|p| p.graph.units())
            .filter_map(|u| u.endpoint.as_ref()?.type_.as_ref())
            .collect();

        if found.len() > 1 {
            self.fail(
                "spec",
                "",
                "Multiple endpoint.types found - can only have 1 type in graph. Please use spec.transport",
            );
            return;
        }

        let Some(transport) = spec.transport.as_ref() else {
            return;
        };
        let conflicting = found.iter().any(|t| match t {
            EndpointType::Rest => *transport != Transport::Rest,
            EndpointType::Grpc => *transport != Transport::Grpc,
            EndpointType::Other(_) => false,
        });
        if conflicting {
            self.fail(
                "spec",
                "",
                "Mixed transport types found. Remove graph endpoint.types if transport set at deployment level",
            );
        }
    }

    /// Traffic is summed over non-shadow predictors; shadows only mirror
    fn check_traffic(&mut self, name: &str) {
        let spec = self.spec;
        let (shadows, live): (Vec<&PredictorSpec>, Vec<&PredictorSpec>) =
            spec.predictors.iter().partition(|p| p.shadow);

        if shadows.len() > 1 {
            self.fail("spec.predictors", name, "Only one shadow predictor is allowed");
        }
        for shadow in &shadows {
            if !(0..=100).contains(&shadow.traffic) {
                self.fail(
                    "spec.predictors",
                    &shadow.name,
                    "Shadow traffic must be between 0 and 100",
                );
            }
        }

        let sum: i32 = live.iter().map(|p| p.traffic).sum();
        if live.len() > 1 && sum != 100 {
            self.fail("spec", name, "Traffic must sum to 100 for multiple predictors");
        }
        if live.len() == 1 && sum != 0 && sum != 100 {
            self.fail("spec", name, "Traffic must sum be 100 for a single predictor when set");
        }
    }

    // =========================================================================
    // Per-unit checks
    // =========================================================================

    fn check_unit(&mut self, unit: &PredictiveUnit, predictor: &PredictorSpec, path: String) {
        let implementation = unit.implementation.clone().unwrap_or(Implementation::Unknown);

        if implementation == Implementation::Unknown {
            if predictor.container_for_unit(&unit.name).is_none() {
                self.fail(&path, &unit.name, "Can't find container for Predictive Unit");
            }
            let unknown_type = matches!(unit.type_, None | Some(PredictiveUnitType::Unknown));
            let no_methods = unit.methods.as_ref().map_or(true, Vec::is_empty);
            if unknown_type && no_methods {
                self.fail(
                    &path,
                    &unit.name,
                    "Predictive Unit has no implementation methods defined. Change to a known type or add what methods it defines",
                );
            }
        } else if implementation.is_prepack() {
            self.check_prepack(unit, &implementation, predictor, &path);
        } else if self.spec.protocol() != Protocol::Seldon {
            self.fail(
                &path,
                &unit.name,
                format!(
                    "Implementation {implementation} only supports the {} protocol",
                    Protocol::Seldon
                ),
            );
        }

        if let Some(logger) = unit.logger.as_ref() {
            if logger.mode.is_empty() {
                self.fail(&path, &logger.mode, "No logger mode specified");
            }
        }

        for (j, child) in unit.children.iter().enumerate() {
            self.check_unit(child, predictor, format!("{path}.children[{j}]"));
        }
    }

    fn check_prepack(
        &mut self,
        unit: &PredictiveUnit,
        implementation: &Implementation,
        predictor: &PredictorSpec,
        path: &str,
    ) {
        let has_uri = unit.model_uri.as_deref().is_some_and(|u| !u.is_empty());
        if !has_uri && !implementation.is_self_fetching() {
            self.fail(
                path,
                &unit.name,
                "Predictive unit modelUri required when using standalone servers",
            );
        }

        let has_image = predictor
            .container_for_unit(&unit.name)
            .and_then(|c| c.image.as_deref())
            .is_some_and(|i| !i.is_empty());
        if has_image {
            return;
        }
        if !self.cluster.has_server(implementation) {
            self.fail(
                path,
                &unit.name,
                format!("No entry in predictors map for {implementation}"),
            );
            return;
        }

        let protocol = self.spec.protocol();
        if protocol.is_recognized()
            && protocol != Protocol::Tensorflow
            && self
                .cluster
                .prepack_image(implementation, &protocol, &self.config.related_images)
                .is_none()
        {
            self.fail(
                path,
                &unit.name,
                format!("Implementation {implementation} does not support protocol {protocol}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
    use seldon_common::annotations;
    use seldon_common::config::{PredictorImageConfig, PredictorServerConfig};
    use seldon_common::crd::{Endpoint, Logger, PredictiveUnitMethod, SeldonPodSpec};

    use super::*;
    use crate::normalize::normalize;

    fn unit(name: &str, children: Vec<PredictiveUnit>) -> PredictiveUnit {
        PredictiveUnit {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    fn hosted(name: &str, traffic: i32, graph: PredictiveUnit) -> PredictorSpec {
        let containers = graph
            .units()
            .iter()
            .map(|u| Container {
                name: u.name.clone(),
                image: Some("example/model:1.0".to_string()),
                ..Default::default()
            })
            .collect();
        PredictorSpec {
            name: name.to_string(),
            graph,
            component_specs: vec![SeldonPodSpec {
                spec: PodSpec {
                    containers,
                    ..Default::default()
                },
                ..Default::default()
            }],
            traffic,
            ..Default::default()
        }
    }

    fn deployment(predictors: Vec<PredictorSpec>) -> SeldonDeploymentSpec {
        SeldonDeploymentSpec {
            predictors,
            ..Default::default()
        }
    }

    fn check(spec: &SeldonDeploymentSpec) -> Vec<FieldError> {
        let config = OperatorConfig::default();
        let cluster = ClusterConfig::default();
        let normalized = normalize("iris", "models", spec, &config, &cluster).unwrap();
        violations("iris", &normalized.spec, &config, &cluster)
    }

    fn reasons(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.reason.as_str()).collect()
    }

    // =========================================================================
    // Traffic
    // =========================================================================

    /// Story: a 60/40 canary split is accepted
    #[test]
    fn story_weighted_predictors_summing_to_100_pass() {
        let spec = deployment(vec![
            hosted("main", 60, unit("classifier", vec![])),
            hosted("canary", 40, unit("classifier", vec![])),
        ]);
        assert!(check(&spec).is_empty());
    }

    /// Story: a 50/60 split is rejected with exactly one traffic cause
    #[test]
    fn story_traffic_not_summing_to_100_fails_once() {
        let spec = deployment(vec![
            hosted("main", 50, unit("classifier", vec![])),
            hosted("canary", 60, unit("classifier", vec![])),
        ]);
        let errors = check(&spec);
        assert_eq!(
            reasons(&errors),
            vec!["Traffic must sum to 100 for multiple predictors"]
        );

        let err = validate(
            "iris",
            &spec,
            &OperatorConfig::default(),
            &ClusterConfig::default(),
        );
        assert!(matches!(err, Err(Error::Invalid { ref causes, .. }) if causes.len() == 1));
    }

    #[test]
    fn single_predictor_accepts_zero_or_full_traffic() {
        for traffic in [0, 100] {
            let spec = deployment(vec![hosted("main", traffic, unit("classifier", vec![]))]);
            assert!(check(&spec).is_empty(), "traffic {traffic}");
        }
        let spec = deployment(vec![hosted("main", 30, unit("classifier", vec![]))]);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Traffic must sum be 100 for a single predictor when set"]
        );
    }

    #[test]
    fn shadow_traffic_is_excluded_from_the_sum() {
        let mut shadow = hosted("shadow", 100, unit("classifier", vec![]));
        shadow.shadow = true;
        let spec = deployment(vec![hosted("main", 100, unit("classifier", vec![])), shadow]);
        assert!(check(&spec).is_empty());
    }

    /// Story: two shadow predictors are rejected
    #[test]
    fn story_second_shadow_predictor_fails() {
        let mut a = hosted("shadow-a", 0, unit("classifier", vec![]));
        a.shadow = true;
        let mut b = hosted("shadow-b", 0, unit("classifier", vec![]));
        b.shadow = true;
        let spec = deployment(vec![hosted("main", 100, unit("classifier", vec![])), a, b]);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Only one shadow predictor is allowed"]
        );
    }

    #[test]
    fn shadow_traffic_is_bounded() {
        let mut shadow = hosted("shadow", 150, unit("classifier", vec![]));
        shadow.shadow = true;
        let spec = deployment(vec![hosted("main", 100, unit("classifier", vec![])), shadow]);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Shadow traffic must be between 0 and 100"]
        );
    }

    // =========================================================================
    // Predictors
    // =========================================================================

    /// Story: no-engine mode with a two-unit graph is rejected
    #[test]
    fn story_no_engine_requires_single_unit_graph() {
        let mut p = hosted(
            "main",
            100,
            unit("transformer", vec![unit("classifier", vec![])]),
        );
        p.annotations
            .insert(annotations::NO_ENGINE.to_string(), "true".to_string());
        let errors = check(&deployment(vec![p]));
        assert_eq!(
            reasons(&errors),
            vec!["Running without engine only valid for single element graphs"]
        );
        assert_eq!(errors[0].path, "spec.predictors[0]");
    }

    #[test]
    fn duplicate_and_missing_predictors_fail() {
        let spec = deployment(vec![
            hosted("main", 50, unit("classifier", vec![])),
            hosted("main", 50, unit("classifier", vec![])),
        ]);
        assert_eq!(reasons(&check(&spec)), vec!["Duplicate predictor name"]);

        let empty = deployment(vec![]);
        assert_eq!(
            reasons(&check(&empty)),
            vec!["At least one predictor is required"]
        );
    }

    #[test]
    fn kafka_server_type_requires_broker_and_topics() {
        let mut p = hosted("main", 100, unit("classifier", vec![]));
        p.svc_orch_spec.env = vec![EnvVar {
            name: "KAFKA_BROKER".to_string(),
            value: Some("kafka:9092".to_string()),
            ..Default::default()
        }];
        let mut spec = deployment(vec![p]);
        spec.server_type = Some(ServerType::Kafka);

        let errors = check(&spec);
        let missing: Vec<_> = errors.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(missing, vec!["KAFKA_INPUT_TOPIC", "KAFKA_OUTPUT_TOPIC"]);
    }

    #[test]
    fn unrecognized_enum_values_are_reported() {
        let mut spec = deployment(vec![hosted("main", 100, unit("classifier", vec![]))]);
        spec.protocol = Some(Protocol::from("graphql"));
        spec.transport = Some(Transport::from("carrier-pigeon"));
        spec.server_type = Some(ServerType::from("nats"));
        let errors = check(&spec);
        let r = reasons(&errors);
        assert!(r.contains(&"Invalid protocol"));
        assert!(r.contains(&"Invalid transport"));
        assert!(r.contains(&"Invalid server type"));
    }

    // =========================================================================
    // Units
    // =========================================================================

    /// Story: every violation is reported, not just the first
    #[test]
    fn story_violations_are_aggregated() {
        let mut orphan = unit("orphan", vec![]);
        orphan.type_ = Some(PredictiveUnitType::Unknown);
        let mut logged = unit("classifier", vec![]);
        logged.logger = Some(Logger::default());

        let mut p = hosted("main", 100, logged);
        p.graph.children.push(orphan);
        let errors = check(&deployment(vec![p]));

        assert_eq!(
            reasons(&errors),
            vec![
                "No logger mode specified",
                "Can't find container for Predictive Unit",
                "Predictive Unit has no implementation methods defined. Change to a known type or add what methods it defines",
            ]
        );
        assert_eq!(errors[1].path, "spec.predictors[0].graph.children[0]");
    }

    #[test]
    fn unknown_type_with_methods_passes() {
        let mut classifier = unit("classifier", vec![]);
        classifier.type_ = Some(PredictiveUnitType::Unknown);
        classifier.methods = Some(vec![PredictiveUnitMethod::TransformInput]);
        let spec = deployment(vec![hosted("main", 100, classifier)]);
        assert!(check(&spec).is_empty());
    }

    #[test]
    fn duplicate_unit_names_fail() {
        let spec = deployment(vec![hosted(
            "main",
            100,
            unit("classifier", vec![unit("classifier", vec![])]),
        )]);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Duplicate predictive unit name"]
        );
    }

    #[test]
    fn prepack_requires_model_uri_and_server_entry() {
        let mut model = unit("classifier", vec![]);
        model.implementation = Some(Implementation::SklearnServer);
        let spec = deployment(vec![PredictorSpec {
            name: "main".to_string(),
            graph: model,
            traffic: 100,
            ..Default::default()
        }]);
        assert_eq!(
            reasons(&check(&spec)),
            vec![
                "Predictive unit modelUri required when using standalone servers",
                "No entry in predictors map for SKLEARN_SERVER",
            ]
        );
    }

    #[test]
    fn self_fetching_servers_need_no_model_uri() {
        let mut model = unit("classifier", vec![]);
        model.implementation = Some(Implementation::HuggingfaceServer);
        let mut p = hosted("main", 100, model);
        p.component_specs.clear();

        let mut cluster = ClusterConfig::default();
        let mut protocols = BTreeMap::new();
        protocols.insert(
            "seldon".to_string(),
            PredictorImageConfig {
                image: "seldonio/huggingface".to_string(),
                default_image_version: "1.0".to_string(),
            },
        );
        cluster.predictor_servers.insert(
            "HUGGINGFACE_SERVER".to_string(),
            PredictorServerConfig { protocols },
        );

        let spec = deployment(vec![p]);
        assert!(violations("iris", &spec, &OperatorConfig::default(), &cluster).is_empty());

        let mut v2 = spec.clone();
        v2.protocol = Some(Protocol::V2);
        assert_eq!(
            violations("iris", &v2, &OperatorConfig::default(), &cluster)
                .iter()
                .map(|e| e.reason.clone())
                .collect::<Vec<_>>(),
            vec!["Implementation HUGGINGFACE_SERVER does not support protocol v2".to_string()]
        );
    }

    #[test]
    fn builtin_stubs_require_seldon_protocol() {
        let mut stub = unit("classifier", vec![]);
        stub.implementation = Some(Implementation::SimpleModel);
        let mut spec = deployment(vec![hosted("main", 100, stub)]);
        assert!(check(&spec).is_empty());

        spec.protocol = Some(Protocol::V2);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Implementation SIMPLE_MODEL only supports the seldon protocol"]
        );
    }

    // =========================================================================
    // Transports
    // =========================================================================

    #[test]
    fn mixed_endpoint_types_fail() {
        let mut a = unit("a", vec![]);
        a.endpoint = Some(Endpoint {
            type_: Some(EndpointType::Rest),
            ..Default::default()
        });
        let mut b = unit("b", vec![]);
        b.endpoint = Some(Endpoint {
            type_: Some(EndpointType::Grpc),
            ..Default::default()
        });
        a.children.push(b);
        let spec = deployment(vec![hosted("main", 100, a)]);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Multiple endpoint.types found - can only have 1 type in graph. Please use spec.transport"]
        );
    }

    #[test]
    fn endpoint_type_conflicting_with_transport_fails() {
        let mut a = unit("a", vec![]);
        a.endpoint = Some(Endpoint {
            type_: Some(EndpointType::Rest),
            ..Default::default()
        });
        let mut spec = deployment(vec![hosted("main", 100, a)]);
        spec.transport = Some(Transport::Grpc);
        assert_eq!(
            reasons(&check(&spec)),
            vec!["Mixed transport types found. Remove graph endpoint.types if transport set at deployment level"]
        );
    }
}
