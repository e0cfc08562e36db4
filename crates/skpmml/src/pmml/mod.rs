//! PMML document model.
//!
//! A minimal, serializable subset of PMML 4.4: the data and transformation
//! dictionaries, one top-level model (regression or mining), its output block
//! and its verification data. Documents serialize to JSON through `serde`.

mod encoder;

pub use encoder::Encoder;

use serde::{Deserialize, Serialize};

/// PMML schema version emitted in [`Pmml::version`].
pub const PMML_VERSION: &str = "4.4";

/// Application name recorded in the document header.
pub const APPLICATION_NAME: &str = "skpmml";

// =============================================================================
// Enumerations
// =============================================================================

/// Operational type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Categorical,
    Ordinal,
    Continuous,
}

/// Primitive data type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Float,
    Double,
    Boolean,
}

impl DataType {
    /// `float` or `double`.
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

/// Kind of prediction a model makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningFunction {
    Regression,
    Classification,
    Clustering,
}

/// What an output field reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultFeature {
    PredictedValue,
    Probability,
    EntityId,
    TransformedValue,
}

/// Role of a field in the mining schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
    Active,
    Target,
}

// =============================================================================
// Dictionaries
// =============================================================================

/// Free-form annotation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Extension {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<String>,
}

impl Extension {
    /// `name`/`value` pair.
    pub fn named(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
            content: Vec::new(),
        }
    }

    /// Extension carrying a text body.
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: vec![content.into()],
            ..Self::default()
        }
    }
}

/// One valid value of a categorical field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
}

impl FieldValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            extensions: Vec::new(),
        }
    }
}

/// Input field declared in the data dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataField {
    pub name: String,
    pub op_type: OpType,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<FieldValue>,
}

/// Computation over other fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expression {
    FieldRef {
        field: String,
    },
    Constant {
        value: String,
        #[serde(rename = "dataType")]
        data_type: DataType,
    },
    Apply {
        function: String,
        arguments: Vec<Expression>,
    },
}

impl Expression {
    pub fn field_ref(field: impl Into<String>) -> Self {
        Self::FieldRef {
            field: field.into(),
        }
    }

    pub fn constant(value: f64) -> Self {
        Self::Constant {
            value: crate::pickle::value::format_float(value),
            data_type: DataType::Double,
        }
    }

    pub fn apply(function: impl Into<String>, arguments: Vec<Expression>) -> Self {
        Self::Apply {
            function: function.into(),
            arguments,
        }
    }
}

/// Field computed by an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedField {
    pub name: String,
    pub op_type: OpType,
    pub data_type: DataType,
    pub expression: Expression,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataDictionary {
    pub fields: Vec<DataField>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationDictionary {
    pub derived_fields: Vec<DerivedField>,
}

// =============================================================================
// Mining schema and output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningField {
    pub name: String,
    pub usage_type: UsageType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MiningSchema {
    pub fields: Vec<MiningField>,
}

impl MiningSchema {
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    pub fn add(&mut self, name: impl Into<String>, usage_type: UsageType) {
        self.fields.push(MiningField {
            name: name.into(),
            usage_type,
        });
    }
}

/// Value a model reports beyond its prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputField {
    pub name: String,
    pub op_type: OpType,
    pub data_type: DataType,
    pub result_feature: ResultFeature,
    /// Target category for probability fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    pub is_final_result: bool,
}

impl OutputField {
    pub fn predicted_value(name: impl Into<String>, op_type: OpType, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            op_type,
            data_type,
            result_feature: ResultFeature::PredictedValue,
            value: None,
            expression: None,
            is_final_result: true,
        }
    }

    /// `probability(<value>)` for one class.
    pub fn probability(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            name: probability_field_name(&value),
            op_type: OpType::Continuous,
            data_type: DataType::Double,
            result_feature: ResultFeature::Probability,
            value: Some(value),
            expression: None,
            is_final_result: true,
        }
    }

    pub fn entity_id(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            op_type: OpType::Categorical,
            data_type,
            result_feature: ResultFeature::EntityId,
            value: None,
            expression: None,
            is_final_result: true,
        }
    }

    /// Output copy of a derived field.
    pub fn transformed_value(field: &DerivedField) -> Self {
        Self {
            name: field.name.clone(),
            op_type: field.op_type,
            data_type: field.data_type,
            result_feature: ResultFeature::TransformedValue,
            value: None,
            expression: Some(field.expression.clone()),
            is_final_result: true,
        }
    }

    pub fn with_final_result(mut self, is_final_result: bool) -> Self {
        self.is_final_result = is_final_result;
        self
    }
}

/// Name of the probability output field for a class value.
pub fn probability_field_name(value: &str) -> String {
    format!("probability({value})")
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Output {
    pub fields: Vec<OutputField>,
}

impl Output {
    /// Whether every name in `names` is declared by this block.
    pub fn contains_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names
            .iter()
            .all(|name| self.fields.iter().any(|field| field.name == name.as_ref()))
    }
}

// =============================================================================
// Verification
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationField {
    pub field: String,
    /// Column name in [`ModelVerification::rows`].
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_threshold: Option<f64>,
}

impl VerificationField {
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            column: verification_column_name(&field),
            field,
            precision: None,
            zero_threshold: None,
        }
    }

    pub fn with_tolerance(mut self, precision: Option<f64>, zero_threshold: Option<f64>) -> Self {
        self.precision = precision;
        self.zero_threshold = zero_threshold;
        self
    }
}

/// `data:<name>` with characters outside `[A-Za-z0-9_.-]` replaced by `_`.
pub fn verification_column_name(field: &str) -> String {
    let sanitized: String = field
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("data:{sanitized}")
}

/// Example inputs and expected outputs, stored row-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVerification {
    pub record_count: usize,
    pub fields: Vec<VerificationField>,
    pub rows: Vec<Vec<String>>,
}

impl ModelVerification {
    /// Transpose equally long columns into rows.
    pub fn from_columns(columns: Vec<(VerificationField, Vec<String>)>) -> Self {
        let record_count = columns.first().map_or(0, |(_, values)| values.len());
        let rows = (0..record_count)
            .map(|row| {
                columns
                    .iter()
                    .map(|(_, values)| values.get(row).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        Self {
            record_count,
            fields: columns.into_iter().map(|(field, _)| field).collect(),
            rows,
        }
    }
}

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionNormalization {
    None,
    Logit,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericPredictor {
    pub name: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionTable {
    pub intercept: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numeric_predictors: Vec<NumericPredictor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultipleModelMethod {
    ModelChain,
    Sum,
    Average,
    SelectFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub model: Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation {
    pub multiple_model_method: MultipleModelMethod,
    pub segments: Vec<Segment>,
}

/// Algorithm-specific part of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModelBody {
    #[serde(rename_all = "camelCase")]
    Regression {
        normalization: RegressionNormalization,
        tables: Vec<RegressionTable>,
    },
    Mining { segmentation: Segmentation },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub function: MiningFunction,
    pub mining_schema: MiningSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<ModelVerification>,
    pub body: ModelBody,
}

impl Model {
    pub fn new(function: MiningFunction, mining_schema: MiningSchema, body: ModelBody) -> Self {
        Self {
            function,
            mining_schema,
            output: None,
            verification: None,
            body,
        }
    }

    /// The output block, created empty if missing.
    pub fn ensure_output(&mut self) -> &mut Output {
        self.output.get_or_insert_with(Output::default)
    }

    pub fn segments(&self) -> &[Segment] {
        match &self.body {
            ModelBody::Mining { segmentation } => &segmentation.segments,
            ModelBody::Regression { .. } => &[],
        }
    }

    /// The model that produces the final prediction: the last segment of a
    /// mining model, followed recursively; otherwise the model itself.
    pub fn final_model_mut(&mut self) -> &mut Model {
        if self.segments().is_empty() {
            return self;
        }
        let segments = self.segments_mut();
        let last = segments.len() - 1;
        segments[last].model.final_model_mut()
    }

    fn segments_mut(&mut self) -> &mut [Segment] {
        match &mut self.body {
            ModelBody::Mining { segmentation } => &mut segmentation.segments,
            ModelBody::Regression { .. } => &mut [],
        }
    }

    /// Nested model reached by following segment indices.
    pub fn descendant_mut(&mut self, path: &[usize]) -> Option<&mut Model> {
        match path.split_first() {
            None => Some(self),
            Some((&index, rest)) => match &mut self.body {
                ModelBody::Mining { segmentation } => {
                    segmentation.segments.get_mut(index)?.model.descendant_mut(rest)
                }
                ModelBody::Regression { .. } => None,
            },
        }
    }
}

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub application: Application,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            application: Application {
                name: APPLICATION_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Build provenance, e.g. the pipeline's `repr`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MiningBuildTask {
    pub extensions: Vec<Extension>,
}

/// A complete PMML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pmml {
    pub version: String,
    pub header: Header,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mining_build_task: Option<MiningBuildTask>,
    pub data_dictionary: DataDictionary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformation_dictionary: Option<TransformationDictionary>,
    pub model: Model,
}

impl Pmml {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn data_field(&self, name: &str) -> Option<&DataField> {
        self.data_dictionary.fields.iter().find(|field| field.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(intercept: f64) -> Model {
        Model::new(
            MiningFunction::Regression,
            MiningSchema::default(),
            ModelBody::Regression {
                normalization: RegressionNormalization::None,
                tables: vec![RegressionTable {
                    intercept,
                    target_category: None,
                    numeric_predictors: vec![],
                }],
            },
        )
    }

    fn chain(models: Vec<Model>) -> Model {
        let segments = models
            .into_iter()
            .enumerate()
            .map(|(i, model)| Segment {
                id: (i + 1).to_string(),
                model,
            })
            .collect();
        Model::new(
            MiningFunction::Regression,
            MiningSchema::default(),
            ModelBody::Mining {
                segmentation: Segmentation {
                    multiple_model_method: MultipleModelMethod::ModelChain,
                    segments,
                },
            },
        )
    }

    #[test]
    fn final_model_follows_last_segment() {
        let mut model = chain(vec![leaf(1.0), chain(vec![leaf(2.0), leaf(3.0)])]);
        let last = model.final_model_mut();
        assert!(matches!(
            &last.body,
            ModelBody::Regression { tables, .. } if tables[0].intercept == 3.0
        ));

        let mut single = leaf(5.0);
        assert_eq!(single.final_model_mut().clone(), leaf(5.0));
    }

    #[test]
    fn final_model_output_lands_in_nested_segment() {
        let mut model = chain(vec![leaf(1.0), chain(vec![leaf(2.0), leaf(3.0)])]);
        model
            .final_model_mut()
            .ensure_output()
            .fields
            .push(OutputField::probability("a"));

        assert!(model.output.is_none());
        let nested = &model.segments()[1].model;
        assert!(nested.output.is_none());
        assert!(nested.segments()[0].model.output.is_none());
        let output = nested.segments()[1].model.output.as_ref().unwrap();
        assert!(output.contains_all(&["probability(a)"]));

        let mut empty = chain(vec![]);
        empty.final_model_mut().ensure_output();
        assert!(empty.output.is_some());
    }

    #[test]
    fn descendant_paths() {
        let mut model = chain(vec![leaf(1.0), chain(vec![leaf(2.0)])]);
        assert!(model.descendant_mut(&[1, 0]).is_some());
        assert!(model.descendant_mut(&[2]).is_none());
        assert!(model.descendant_mut(&[0, 0]).is_none());
    }

    #[test]
    fn verification_rows_and_columns() {
        let verification = ModelVerification::from_columns(vec![
            (VerificationField::new("x 1"), vec!["1".into(), "2".into()]),
            (VerificationField::new("probability(a)"), vec!["0.5".into(), "0.25".into()]),
        ]);
        assert_eq!(verification.record_count, 2);
        assert_eq!(verification.fields[0].column, "data:x_1");
        assert_eq!(verification.fields[1].column, "data:probability_a_");
        assert_eq!(verification.rows[1], vec!["2".to_string(), "0.25".to_string()]);
    }

    #[test]
    fn output_contains_all() {
        let output = Output {
            fields: vec![
                OutputField::probability("a"),
                OutputField::probability("b"),
            ],
        };
        assert!(output.contains_all(&["probability(a)", "probability(b)"]));
        assert!(!output.contains_all(&["probability(a)", "predict(y)"]));
        assert!(output.contains_all::<&str>(&[]));
    }

    #[test]
    fn serializes_with_pmml_names() {
        let field = OutputField::predicted_value("predict(y)", OpType::Continuous, DataType::Double)
            .with_final_result(false);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["resultFeature"], "predictedValue");
        assert_eq!(json["opType"], "continuous");
        assert_eq!(json["isFinalResult"], false);
    }
}
