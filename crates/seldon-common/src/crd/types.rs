//! String-backed enums shared across the SeldonDeployment schema.
//!
//! Every enum here round-trips unknown values through an `Other` variant so a
//! declaration with a typo still deserializes and the validator can report the
//! bad value with its field path instead of the API server rejecting the
//! whole object with a parse error.

use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_rules! open_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A value outside the recognized set
            Other(String),
        }

        impl $name {
            /// Wire representation of this value
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $value, )+
                    Self::Other(v) => v.as_str(),
                }
            }

            /// Whether this value is one of the recognized variants
            pub fn is_recognized(&self) -> bool {
                !matches!(self, Self::Other(_))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $( $value => Self::$variant, )+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl JsonSchema for $name {
            fn schema_name() -> String {
                stringify!($name).to_string()
            }

            fn json_schema(gen: &mut SchemaGenerator) -> Schema {
                String::json_schema(gen)
            }
        }
    };
}

open_enum! {
    /// Wire protocol spoken by the predictive units and the orchestrator
    Protocol {
        /// Seldon REST/gRPC protocol
        Seldon => "seldon",
        /// TensorFlow Serving protocol
        Tensorflow => "tensorflow",
        /// KFServing V2 protocol (legacy name)
        Kfserving => "kfserving",
        /// Open inference V2 protocol
        V2 => "v2",
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Seldon
    }
}

impl Protocol {
    /// Whether this protocol is one of the V2 dialects
    pub fn is_v2(&self) -> bool {
        matches!(self, Self::V2 | Self::Kfserving)
    }
}

open_enum! {
    /// Deployment-wide transport
    Transport {
        /// HTTP/REST
        Rest => "rest",
        /// gRPC
        Grpc => "grpc",
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::Rest
    }
}

open_enum! {
    /// How the orchestrator receives requests
    ServerType {
        /// Synchronous request/response
        Rpc => "rpc",
        /// Streaming through a Kafka topic pair
        Kafka => "kafka",
    }
}

impl Default for ServerType {
    fn default() -> Self {
        Self::Rpc
    }
}

open_enum! {
    /// Transport kind of a single predictive unit's endpoint
    EndpointType {
        /// HTTP/REST endpoint
        Rest => "REST",
        /// gRPC endpoint
        Grpc => "GRPC",
    }
}

open_enum! {
    /// Role of a predictive unit within its graph
    PredictiveUnitType {
        /// Chooses one child per request
        Router => "ROUTER",
        /// Aggregates the outputs of all children
        Combiner => "COMBINER",
        /// Produces predictions
        Model => "MODEL",
        /// Transforms the request before the children see it
        Transformer => "TRANSFORMER",
        /// Transforms the response on the way back
        OutputTransformer => "OUTPUT_TRANSFORMER",
        /// Role declared through explicit methods
        Unknown => "UNKNOWN_TYPE",
    }
}

open_enum! {
    /// Implementation backing a predictive unit
    ///
    /// Anything unrecognized is a user-supplied container implementation.
    Implementation {
        /// Implementation supplied by a user container
        Unknown => "UNKNOWN_IMPLEMENTATION",
        /// Built-in stub model
        SimpleModel => "SIMPLE_MODEL",
        /// Built-in stub router
        SimpleRouter => "SIMPLE_ROUTER",
        /// Built-in A/B test router
        RandomAbTest => "RANDOM_ABTEST",
        /// Built-in averaging combiner
        AverageCombiner => "AVERAGE_COMBINER",
        /// Prepackaged scikit-learn server
        SklearnServer => "SKLEARN_SERVER",
        /// Prepackaged XGBoost server
        XgboostServer => "XGBOOST_SERVER",
        /// Prepackaged MLflow server
        MlflowServer => "MLFLOW_SERVER",
        /// Prepackaged TensorFlow Serving
        TensorflowServer => "TENSORFLOW_SERVER",
        /// Prepackaged HuggingFace server
        HuggingfaceServer => "HUGGINGFACE_SERVER",
        /// Prepackaged Triton inference server
        TritonServer => "TRITON_SERVER",
        /// Prepackaged Tempo runtime
        TempoServer => "TEMPO_SERVER",
    }
}

impl Implementation {
    /// Whether this implementation is a prepackaged model server
    ///
    /// Any name outside the built-in stubs counts, so servers registered only
    /// in the cluster ConfigMap are served the same way as the known ones.
    pub fn is_prepack(&self) -> bool {
        match self {
            Self::Unknown
            | Self::SimpleModel
            | Self::SimpleRouter
            | Self::RandomAbTest
            | Self::AverageCombiner => false,
            Self::Other(name) => !name.is_empty(),
            _ => true,
        }
    }

    /// Prepackaged servers that fetch their own artifacts and need no model URI
    pub fn is_self_fetching(&self) -> bool {
        matches!(self, Self::HuggingfaceServer | Self::TempoServer)
    }
}

open_enum! {
    /// Explicitly declared unit capability
    PredictiveUnitMethod {
        /// Input transformation
        TransformInput => "TRANSFORM_INPUT",
        /// Output transformation
        TransformOutput => "TRANSFORM_OUTPUT",
        /// Routing
        Route => "ROUTE",
        /// Aggregation
        Aggregate => "AGGREGATE",
        /// Feedback handling
        SendFeedback => "SEND_FEEDBACK",
    }
}

open_enum! {
    /// Declared type of a unit parameter
    ParameterType {
        /// 32-bit integer
        Int => "INT",
        /// 32-bit float
        Float => "FLOAT",
        /// 64-bit float
        Double => "DOUBLE",
        /// Free-form string
        Text => "STRING",
        /// Boolean
        Bool => "BOOL",
    }
}
