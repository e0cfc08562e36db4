//! Pipeline step capabilities and the built-in scikit-learn steps.
//!
//! A decoded step is a [`Record`]; what it can do comes from the
//! [`ObjectFactory`](crate::pickle::ObjectFactory) that constructed it. Factories
//! for estimators implement [`Estimator`], factories for transformers implement
//! [`Transformer`], and the pipeline compiler reaches both through
//! [`Record::as_estimator`] / [`Record::as_transformer`].
//!
//! Capability methods receive the record they describe. Defaults report
//! "unknown" (`None`) so that steps only implement what they can answer.

pub mod linear_model;
pub mod preprocessing;

use std::fmt;

use crate::pickle::registry::{Factory, FactoryCatalog, Registry};
use crate::pickle::value::{ClassName, FieldError, Record, Value};
use crate::pipeline::EncodeError;
use crate::pmml::{DataType, Encoder, Model, OpType};
use crate::schema::{Feature, Schema};

/// Kind of learning task an estimator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Regression,
    Classification,
    Clustering,
    AnomalyDetection,
}

impl TaskKind {
    /// Regression and classification learn from a target.
    pub fn is_supervised(self) -> bool {
        matches!(self, Self::Regression | Self::Classification)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Regression => "regression",
            Self::Classification => "classification",
            Self::Clustering => "clustering",
            Self::AnomalyDetection => "anomaly detection",
        })
    }
}

/// `n_features_in_` as a count.
fn n_features_in(this: &Record) -> Option<usize> {
    this.get_optional("n_features_in_")
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok())
}

// =============================================================================
// Capabilities
// =============================================================================

/// Final pipeline step.
pub trait Estimator: Send + Sync {
    fn task_kind(&self, this: &Record) -> TaskKind;

    fn is_supervised(&self, this: &Record) -> bool {
        self.task_kind(this).is_supervised()
    }

    /// Required input width, when the estimator knows it.
    fn number_of_features(&self, this: &Record) -> Option<usize> {
        n_features_in(this)
    }

    /// Operational type of raw inputs; `None` when unsupported.
    fn op_type(&self, _this: &Record) -> Option<OpType> {
        None
    }

    /// Data type of raw inputs; `None` when unsupported.
    fn data_type(&self, _this: &Record) -> Option<DataType> {
        None
    }

    /// Class labels of a classifier.
    fn classes(&self, this: &Record) -> Result<Vec<Value>, FieldError> {
        this.get_values("classes_")
    }

    fn has_probability_distribution(&self, _this: &Record) -> bool {
        false
    }

    /// Build the model for `schema`, declaring any extra fields on `encoder`.
    fn encode_model(
        &self,
        this: &Record,
        schema: &Schema,
        encoder: &mut Encoder,
    ) -> Result<Model, EncodeError>;
}

/// Non-final pipeline step mapping features to features.
pub trait Transformer: Send + Sync {
    fn op_type(&self, _this: &Record) -> Option<OpType> {
        None
    }

    fn data_type(&self, _this: &Record) -> Option<DataType> {
        None
    }

    fn number_of_features(&self, this: &Record) -> Option<usize> {
        n_features_in(this)
    }

    /// Whether this step declares its own input fields (e.g. a column mapper),
    /// so no placeholder features should be synthesized for it.
    fn is_initializer(&self) -> bool {
        false
    }

    fn encode_features(
        &self,
        this: &Record,
        features: Vec<Feature>,
        encoder: &mut Encoder,
    ) -> Result<Vec<Feature>, EncodeError>;
}

// =============================================================================
// Record views
// =============================================================================

/// A record together with its estimator capability.
#[derive(Clone, Copy)]
pub struct EstimatorRef<'a> {
    record: &'a Record,
    estimator: &'a dyn Estimator,
}

impl<'a> EstimatorRef<'a> {
    pub fn new(record: &'a Record, estimator: &'a dyn Estimator) -> Self {
        Self { record, estimator }
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    pub fn class(&self) -> &'a ClassName {
        self.record.class()
    }

    pub fn task_kind(&self) -> TaskKind {
        self.estimator.task_kind(self.record)
    }

    pub fn is_supervised(&self) -> bool {
        self.estimator.is_supervised(self.record)
    }

    pub fn number_of_features(&self) -> Option<usize> {
        self.estimator.number_of_features(self.record)
    }

    pub fn op_type(&self) -> Option<OpType> {
        self.estimator.op_type(self.record)
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.estimator.data_type(self.record)
    }

    pub fn classes(&self) -> Result<Vec<Value>, FieldError> {
        self.estimator.classes(self.record)
    }

    pub fn has_probability_distribution(&self) -> bool {
        self.estimator.has_probability_distribution(self.record)
    }

    pub fn encode_model(&self, schema: &Schema, encoder: &mut Encoder) -> Result<Model, EncodeError> {
        self.estimator.encode_model(self.record, schema, encoder)
    }
}

impl fmt::Debug for EstimatorRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EstimatorRef").field(&self.class().to_string()).finish()
    }
}

/// A record together with its transformer capability.
#[derive(Clone, Copy)]
pub struct TransformerRef<'a> {
    record: &'a Record,
    transformer: &'a dyn Transformer,
}

impl<'a> TransformerRef<'a> {
    pub fn new(record: &'a Record, transformer: &'a dyn Transformer) -> Self {
        Self {
            record,
            transformer,
        }
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    pub fn class(&self) -> &'a ClassName {
        self.record.class()
    }

    pub fn op_type(&self) -> Option<OpType> {
        self.transformer.op_type(self.record)
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.transformer.data_type(self.record)
    }

    pub fn number_of_features(&self) -> Option<usize> {
        self.transformer.number_of_features(self.record)
    }

    pub fn is_initializer(&self) -> bool {
        self.transformer.is_initializer()
    }

    pub fn encode_features(
        &self,
        features: Vec<Feature>,
        encoder: &mut Encoder,
    ) -> Result<Vec<Feature>, EncodeError> {
        self.transformer.encode_features(self.record, features, encoder)
    }
}

impl fmt::Debug for TransformerRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransformerRef").field(&self.class().to_string()).finish()
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Module paths a class has been pickled under across scikit-learn releases.
const LINEAR_REGRESSION_MODULES: [&str; 3] = [
    "sklearn.linear_model",
    "sklearn.linear_model._base",
    "sklearn.linear_model.base",
];
const LOGISTIC_REGRESSION_MODULES: [&str; 3] = [
    "sklearn.linear_model",
    "sklearn.linear_model._logistic",
    "sklearn.linear_model.logistic",
];
const STANDARD_SCALER_MODULES: [&str; 3] = [
    "sklearn.preprocessing",
    "sklearn.preprocessing._data",
    "sklearn.preprocessing.data",
];

pub(crate) fn register(registry: &mut Registry) {
    registry.register("sklearn2pmml.pipeline", "PMMLPipeline", Factory::Generic);
    registry.register("sklearn2pmml", "Verification", Factory::Generic);
    for module in LINEAR_REGRESSION_MODULES {
        registry.register(
            module,
            "LinearRegression",
            Factory::specialized(linear_model::LinearRegression),
        );
    }
    for module in LOGISTIC_REGRESSION_MODULES {
        registry.register(
            module,
            "LogisticRegression",
            Factory::specialized(linear_model::LogisticRegression),
        );
    }
    for module in STANDARD_SCALER_MODULES {
        registry.register(
            module,
            "StandardScaler",
            Factory::specialized(preprocessing::StandardScaler),
        );
    }
}

pub(crate) fn register_catalog(catalog: &mut FactoryCatalog) {
    catalog.insert(
        "linear_regression",
        Factory::specialized(linear_model::LinearRegression),
    );
    catalog.insert(
        "logistic_regression",
        Factory::specialized(linear_model::LogisticRegression),
    );
    catalog.insert(
        "standard_scaler",
        Factory::specialized(preprocessing::StandardScaler),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_under_private_and_public_paths() {
        let registry = Registry::with_defaults();
        for (module, name) in [
            ("sklearn.linear_model._base", "LinearRegression"),
            ("sklearn.linear_model", "LogisticRegression"),
            ("sklearn.preprocessing._data", "StandardScaler"),
        ] {
            assert!(
                matches!(registry.resolve(module, name), Factory::Specialized(_)),
                "{module}.{name}"
            );
        }
        assert!(registry.contains("sklearn2pmml.pipeline", "PMMLPipeline"));
    }

    #[test]
    fn task_kind_supervision() {
        assert!(TaskKind::Regression.is_supervised());
        assert!(TaskKind::Classification.is_supervised());
        assert!(!TaskKind::Clustering.is_supervised());
        assert_eq!(TaskKind::AnomalyDetection.to_string(), "anomaly detection");
    }
}
