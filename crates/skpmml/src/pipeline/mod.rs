//! Compilation of `sklearn2pmml.pipeline.PMMLPipeline` records into PMML.
//!
//! [`PmmlPipeline`] is a typed view over the decoded pipeline record. Its
//! [`encode_pmml`](PmmlPipeline::encode_pmml) resolves the label and the
//! input features, lets the final estimator build the model, wires the
//! optional post-processors into the model's outputs and attaches the
//! verification data.
//!
//! # Example
//!
//! ```no_run
//! use skpmml::pickle::{self, Registry, Storage};
//! use skpmml::pipeline::{PipelineConfig, PmmlPipeline};
//!
//! let registry = Registry::with_defaults();
//! let value = pickle::load(&Storage::open("pipeline.pkl")?, &registry)?;
//! let pmml = PmmlPipeline::from_value(&value)?.encode_pmml(&PipelineConfig::default())?;
//! println!("{}", pmml.to_json_pretty()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
pub mod output;
pub mod verification;

pub use error::EncodeError;
pub use output::{encode_output, find_output};
pub use verification::encode_verification;

use bon::Builder;

use crate::pickle::value::{ClassName, Dict, Record, Value};
use crate::pmml::{
    DataType, Encoder, Extension, FieldValue, MiningBuildTask, OpType, OutputField, Pmml,
};
use crate::schema::{Feature, Label, Schema};
use crate::sklearn::{EstimatorRef, TaskKind, TransformerRef};

/// Defaults applied when a pipeline leaves names unset.
#[derive(Debug, Clone, Builder)]
#[builder(derive(Clone, Debug))]
pub struct PipelineConfig {
    /// Target name used when neither `target_fields` nor `target_field` is set.
    #[builder(default = "y".to_string(), into)]
    pub default_target_field: String,

    /// Prefix of synthesized active field names (`x1`, `x2`, ...).
    #[builder(default = "x".to_string(), into)]
    pub active_field_prefix: String,

    /// Emit the verification block when the pipeline carries verification data.
    #[builder(default = true)]
    pub verification: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Whatever supplies the first batch of features.
struct Initializer<'a> {
    class: &'a ClassName,
    op_type: Option<OpType>,
    data_type: Option<DataType>,
    number_of_features: Option<usize>,
}

impl<'a> Initializer<'a> {
    fn transformer(transformer: &TransformerRef<'a>) -> Self {
        Self {
            class: transformer.class(),
            op_type: transformer.op_type(),
            data_type: transformer.data_type(),
            number_of_features: transformer.number_of_features(),
        }
    }

    fn estimator(estimator: &EstimatorRef<'a>) -> Self {
        Self {
            class: estimator.class(),
            op_type: estimator.op_type(),
            data_type: estimator.data_type(),
            number_of_features: estimator.number_of_features(),
        }
    }

    /// `prefix1..prefixN` sized by the declared input width.
    fn default_active_fields(&self, prefix: &str) -> Result<Vec<String>, EncodeError> {
        let count = self.number_of_features.ok_or_else(|| {
            EncodeError::configuration(format!(
                "The first transformer or estimator object ({}) does not specify the number of input features",
                self.class
            ))
        })?;
        let names: Vec<String> = (1..=count).map(|i| format!("{prefix}{i}")).collect();
        tracing::warn!(
            ?names,
            "attribute 'active_fields' is not set, assuming default active field names"
        );
        Ok(names)
    }

    /// One data field per active field, typed as the initializer declares.
    fn features(&self, names: &[String], encoder: &mut Encoder) -> Result<Vec<Feature>, EncodeError> {
        let (Some(op_type), Some(data_type)) = (self.op_type, self.data_type) else {
            return Err(EncodeError::configuration(format!(
                "The first transformer or estimator object ({}) does not specify feature type information",
                self.class
            )));
        };
        Ok(names
            .iter()
            .map(|name| Feature::data(encoder.create_data_field(name.as_str(), op_type, data_type)))
            .collect())
    }
}

/// Typed view over a decoded `PMMLPipeline` record.
#[derive(Debug, Clone, Copy)]
pub struct PmmlPipeline<'a> {
    record: &'a Record,
}

impl<'a> PmmlPipeline<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    /// View a decoded root value as a pipeline.
    pub fn from_value(value: &'a Value) -> Result<Self, EncodeError> {
        value.as_record().map(Self::new).ok_or_else(|| {
            EncodeError::configuration(format!(
                "Expected a pipeline object, got {}",
                value.type_name()
            ))
        })
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    /// `(name, step)` pairs in order.
    pub fn steps(&self) -> Result<Vec<(&'a str, &'a Record)>, EncodeError> {
        let steps = self.record.get_required("steps")?;
        let steps = steps.as_slice().ok_or_else(|| {
            EncodeError::configuration(format!("steps must be a list, got {}", steps.type_name()))
        })?;
        steps
            .iter()
            .enumerate()
            .map(|(index, step)| match step.as_slice() {
                Some([Value::String(name), Value::Record(object)]) => Ok((name.as_str(), object)),
                _ => Err(EncodeError::configuration(format!(
                    "step {index} is not a (name, estimator) pair, got {}",
                    step.type_name()
                ))),
            })
            .collect()
    }

    /// All steps but the last.
    pub fn transformers(&self) -> Result<Vec<TransformerRef<'a>>, EncodeError> {
        let steps = self.steps()?;
        let count = steps.len().saturating_sub(1);
        steps[..count]
            .iter()
            .map(|(name, object)| {
                object.as_transformer().ok_or_else(|| {
                    EncodeError::configuration(format!(
                        "Expected a transformer object as step '{name}', got {}",
                        object.class()
                    ))
                })
            })
            .collect()
    }

    /// The last step.
    pub fn estimator(&self) -> Result<EstimatorRef<'a>, EncodeError> {
        let steps = self.steps()?;
        let Some((_, last)) = steps.last() else {
            return Err(EncodeError::configuration(
                "Expected one or more steps, got zero steps",
            ));
        };
        if let Some(estimator) = last.as_estimator() {
            return Ok(estimator);
        }
        let message = if last.as_transformer().is_some() {
            format!(
                "Expected an estimator object as the last step, got a transformer object ({})",
                last.class()
            )
        } else {
            format!(
                "Expected an estimator object as the last step, got {}",
                last.class()
            )
        };
        Err(EncodeError::Configuration(message))
    }

    fn optional_transformer(&self, name: &str) -> Result<Option<TransformerRef<'a>>, EncodeError> {
        let Some(object) = self.record.get_optional_record(name)? else {
            return Ok(None);
        };
        object.as_transformer().map(Some).ok_or_else(|| {
            EncodeError::configuration(format!(
                "Expected a transformer object as '{name}', got {}",
                object.class()
            ))
        })
    }

    pub fn predict_transformer(&self) -> Result<Option<TransformerRef<'a>>, EncodeError> {
        self.optional_transformer("predict_transformer")
    }

    pub fn predict_proba_transformer(&self) -> Result<Option<TransformerRef<'a>>, EncodeError> {
        self.optional_transformer("predict_proba_transformer")
    }

    pub fn apply_transformer(&self) -> Result<Option<TransformerRef<'a>>, EncodeError> {
        self.optional_transformer("apply_transformer")
    }

    pub fn active_fields(&self) -> Result<Option<Vec<String>>, EncodeError> {
        Ok(self.record.get_optional_strings("active_fields")?)
    }

    /// Target names; the legacy single `target_field` wins over `target_fields`.
    pub fn target_fields(&self) -> Result<Option<Vec<String>>, EncodeError> {
        if let Some(name) = self.record.get_optional_string("target_field")? {
            return Ok(Some(vec![name.to_string()]));
        }
        Ok(self.record.get_optional_strings("target_fields")?)
    }

    pub fn repr(&self) -> Result<Option<&'a str>, EncodeError> {
        Ok(self.record.get_optional_string("repr_")?)
    }

    pub fn verification(&self) -> Result<Option<&'a Record>, EncodeError> {
        Ok(self.record.get_optional_record("verification")?)
    }

    /// Per-class annotations: `{extension name: {class value: annotation}}`.
    ///
    /// Read from the pipeline, falling back to the estimator's
    /// `pmml_options_["class_extensions"]`.
    pub fn class_extensions(
        &self,
        estimator: &EstimatorRef<'a>,
    ) -> Result<Vec<(String, &'a Dict)>, EncodeError> {
        let value = match self.record.get_optional("class_extensions") {
            Some(value) => Some(value),
            None => estimator
                .record()
                .get_optional("pmml_options_")
                .and_then(Value::as_dict)
                .and_then(|options| options.get_str("class_extensions"))
                .filter(|value| !value.is_none()),
        };
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        let extensions = value.as_dict().ok_or_else(|| {
            EncodeError::configuration(format!(
                "class_extensions must be a dict, got {}",
                value.type_name()
            ))
        })?;
        extensions
            .iter()
            .map(|(name, annotations)| match annotations {
                Value::Dict(annotations) => Ok((name.to_pmml_string(), annotations)),
                other => Err(EncodeError::configuration(format!(
                    "class_extensions['{}'] must be a dict, got {}",
                    name.to_pmml_string(),
                    other.type_name()
                ))),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Encoding
    // -------------------------------------------------------------------------

    fn encode_label(
        &self,
        estimator: &EstimatorRef<'a>,
        target: &str,
        encoder: &mut Encoder,
    ) -> Result<Label, EncodeError> {
        match estimator.task_kind() {
            TaskKind::Classification => {
                let classes = estimator.classes()?;
                let data_type = common_data_type(&classes);
                let extensions = self.class_extensions(estimator)?;
                let values = classes
                    .iter()
                    .map(|class| {
                        let mut value = FieldValue::new(class.to_pmml_string());
                        for (name, annotations) in &extensions {
                            if let Some(annotation) =
                                annotations.get(class).filter(|annotation| !annotation.is_none())
                            {
                                value
                                    .extensions
                                    .push(Extension::named(name.as_str(), annotation.to_pmml_string()));
                            }
                        }
                        value
                    })
                    .collect();
                let field = encoder.create_categorical_field(target, data_type, values);
                Ok(Label::categorical(field))
            }
            TaskKind::Regression => {
                let field = encoder.create_data_field(target, OpType::Continuous, DataType::Double);
                Ok(Label::continuous(field))
            }
            task => Err(EncodeError::UnsupportedTask {
                class: estimator.class().clone(),
                task,
            }),
        }
    }

    /// Compile the pipeline into a PMML document.
    pub fn encode_pmml(&self, config: &PipelineConfig) -> Result<Pmml, EncodeError> {
        let transformers = self.transformers()?;
        let estimator = self.estimator()?;
        let predict_transformer = self.predict_transformer()?;
        let predict_proba_transformer = self.predict_proba_transformer()?;
        let apply_transformer = self.apply_transformer()?;
        let mut active_fields = self.active_fields()?;

        let mut encoder = Encoder::new();

        // Label
        let mut target_fields = Vec::new();
        let label = if estimator.is_supervised() {
            target_fields = match self.target_fields()? {
                Some(fields) => fields,
                None => {
                    let name = config.default_target_field.clone();
                    tracing::warn!(
                        target_field = %name,
                        "attribute 'target_fields' is not set, assuming default target field name"
                    );
                    vec![name]
                }
            };
            if target_fields.len() != 1 {
                return Err(EncodeError::configuration(format!(
                    "Expected 1 target field, got {}",
                    target_fields.len()
                )));
            }
            Some(self.encode_label(&estimator, &target_fields[0], &mut encoder)?)
        } else {
            None
        };

        // Features
        let mut features = Vec::new();
        match transformers.first() {
            Some(head) => {
                if !head.is_initializer() {
                    let initializer = Initializer::transformer(head);
                    let names = match active_fields.take() {
                        Some(names) => names,
                        None => initializer.default_active_fields(&config.active_field_prefix)?,
                    };
                    features = initializer.features(&names, &mut encoder)?;
                    active_fields = Some(names);
                }
                for transformer in &transformers {
                    features = transformer.encode_features(features, &mut encoder)?;
                }
            }
            None => {
                let initializer = Initializer::estimator(&estimator);
                let names = match active_fields.take() {
                    Some(names) => names,
                    None => initializer.default_active_fields(&config.active_field_prefix)?,
                };
                features = initializer.features(&names, &mut encoder)?;
                active_fields = Some(names);
            }
        }

        if let Some(expected) = estimator.number_of_features() {
            if expected != features.len() {
                return Err(EncodeError::configuration(format!(
                    "Expected {expected} feature(s) for {}, got {}",
                    estimator.class(),
                    features.len()
                )));
            }
        }

        let schema = Schema::new(label, features);
        let mut model = estimator.encode_model(&schema, &mut encoder)?;
        let label = schema.label;

        // Post-processors
        if let Some(transformer) = predict_transformer {
            let label = label.as_ref().ok_or_else(|| {
                EncodeError::configuration("predict_transformer requires a supervised estimator")
            })?;
            let field = OutputField::predicted_value(
                format!("predict({})", label.name()),
                label.op_type(),
                label.data_type(),
            )
            .with_final_result(false);
            model
                .final_model_mut()
                .ensure_output()
                .fields
                .push(field.clone());
            encode_output(&mut model, &[field], &transformer)?;
        }

        if let Some(transformer) = predict_proba_transformer {
            let fields: Vec<OutputField> = match &label {
                Some(label @ Label::Categorical { .. }) => {
                    label.values().into_iter().map(OutputField::probability).collect()
                }
                _ => {
                    return Err(EncodeError::configuration(
                        "predict_proba_transformer requires a categorical label",
                    ))
                }
            };
            encode_output(&mut model, &fields, &transformer)?;
        }

        if let Some(transformer) = apply_transformer {
            let field = OutputField::entity_id("nodeId", DataType::Integer);
            encode_output(&mut model, &[field], &transformer)?;
        }

        // Verification
        if let Some(label) = &label {
            match self.verification()? {
                Some(_) if !config.verification => {}
                Some(verification) => {
                    let active_fields = match active_fields {
                        Some(names) => names,
                        None => encoder
                            .data_fields()
                            .filter(|field| field.name != label.name())
                            .map(|field| field.name.clone())
                            .collect(),
                    };
                    model.verification = Some(encode_verification(
                        verification,
                        &active_fields,
                        &target_fields,
                        label,
                        &estimator,
                    )?);
                }
                None => tracing::warn!(
                    "model verification data is not set, use method 'verify(X)' to correct this deficiency"
                ),
            }
        }

        let mut pmml = encoder.encode_pmml(model);
        if let Some(repr) = self.repr()? {
            pmml.mining_build_task = Some(MiningBuildTask {
                extensions: vec![Extension::with_content(repr)],
            });
        }
        Ok(pmml)
    }
}

/// Narrowest PMML type covering every class value; `string` when they disagree.
fn common_data_type(values: &[Value]) -> DataType {
    let mut common = None;
    for value in values {
        let data_type = match value {
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Integer,
            Value::Float(_) => DataType::Double,
            Value::String(_) => DataType::String,
            _ => return DataType::String,
        };
        common = Some(match (common, data_type) {
            (None, data_type) => data_type,
            (Some(current), data_type) if current == data_type => current,
            (
                Some(DataType::Integer | DataType::Double),
                DataType::Integer | DataType::Double,
            ) => DataType::Double,
            _ => return DataType::String,
        });
    }
    common.unwrap_or(DataType::String)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![Value::Int(0), Value::Int(1)], DataType::Integer)]
    #[case(vec![Value::Int(0), Value::Float(1.5)], DataType::Double)]
    #[case(vec![Value::Bool(false), Value::Bool(true)], DataType::Boolean)]
    #[case(vec![Value::from("a"), Value::Int(1)], DataType::String)]
    #[case(vec![Value::Bool(true), Value::Int(1)], DataType::String)]
    #[case(vec![], DataType::String)]
    fn class_data_types(#[case] values: Vec<Value>, #[case] expected: DataType) {
        assert_eq!(common_data_type(&values), expected);
    }

    #[test]
    fn config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_target_field, "y");
        assert_eq!(config.active_field_prefix, "x");
        assert!(config.verification);

        let config = PipelineConfig::builder()
            .default_target_field("label")
            .verification(false)
            .build();
        assert_eq!(config.default_target_field, "label");
        assert!(!config.verification);
    }
}
