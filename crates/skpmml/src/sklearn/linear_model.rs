//! `sklearn.linear_model` estimators encoded as PMML regression models.
//!
//! scikit-learn stores coefficients as `coef_` with shape `(n_targets, n_features)`
//! (or `(n_features,)` for a single target) and intercepts as `intercept_`, either a
//! scalar or one value per row of `coef_`.

use crate::pickle::registry::ObjectFactory;
use crate::pickle::value::{FieldError, Record, Value};
use crate::pipeline::EncodeError;
use crate::pmml::{
    DataType, Encoder, MiningFunction, MiningSchema, Model, ModelBody, NumericPredictor, OpType,
    Output, OutputField, RegressionNormalization, RegressionTable, UsageType,
};
use crate::schema::{Feature, Label, Schema};

use super::{n_features_in, Estimator, TaskKind};

// =============================================================================
// Shared helpers
// =============================================================================

/// Trailing dimension of `coef_`.
fn coef_width(this: &Record) -> Option<usize> {
    match this.get_optional("coef_")? {
        Value::Array(array) => array.shape.last().copied(),
        other => other.as_slice().map(<[Value]>::len),
    }
}

/// `coef_` split into `n_rows` rows of `n_features` coefficients each.
fn coefficient_rows(
    this: &Record,
    n_rows: usize,
    n_features: usize,
) -> Result<Vec<Vec<f64>>, EncodeError> {
    let coef = this.get_f64_values("coef_")?;
    let expected = n_rows * n_features;
    if coef.len() != expected {
        return Err(EncodeError::shape("coef_ elements", expected, coef.len()));
    }
    Ok((0..n_rows)
        .map(|row| coef[row * n_features..(row + 1) * n_features].to_vec())
        .collect())
}

/// `intercept_` as a list, whether pickled as a scalar or an array.
fn intercepts(this: &Record) -> Result<Vec<f64>, FieldError> {
    match this.get_required("intercept_")?.as_f64() {
        Some(value) => Ok(vec![value]),
        None => this.get_f64_values("intercept_"),
    }
}

fn regression_table(
    intercept: f64,
    target_category: Option<&str>,
    features: &[Feature],
    coefficients: &[f64],
) -> RegressionTable {
    RegressionTable {
        intercept,
        target_category: target_category.map(str::to_string),
        numeric_predictors: features
            .iter()
            .zip(coefficients)
            .map(|(feature, &coefficient)| NumericPredictor {
                name: feature.name.clone(),
                coefficient,
            })
            .collect(),
    }
}

fn target_schema(label: &Label) -> MiningSchema {
    let mut mining_schema = MiningSchema::default();
    mining_schema.add(label.name(), UsageType::Target);
    mining_schema
}

// =============================================================================
// LinearRegression
// =============================================================================

/// Ordinary least squares.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearRegression;

impl ObjectFactory for LinearRegression {
    fn estimator(&self) -> Option<&dyn Estimator> {
        Some(self)
    }
}

impl Estimator for LinearRegression {
    fn task_kind(&self, _this: &Record) -> TaskKind {
        TaskKind::Regression
    }

    fn number_of_features(&self, this: &Record) -> Option<usize> {
        n_features_in(this).or_else(|| coef_width(this))
    }

    fn op_type(&self, _this: &Record) -> Option<OpType> {
        Some(OpType::Continuous)
    }

    fn data_type(&self, _this: &Record) -> Option<DataType> {
        Some(DataType::Double)
    }

    fn encode_model(
        &self,
        this: &Record,
        schema: &Schema,
        _encoder: &mut Encoder,
    ) -> Result<Model, EncodeError> {
        let label = match &schema.label {
            Some(label @ Label::Continuous { .. }) => label,
            _ => {
                return Err(EncodeError::configuration(format!(
                    "{} requires a continuous label",
                    this.class()
                )))
            }
        };

        let features = &schema.features;
        let coefficients = coefficient_rows(this, 1, features.len())?;
        let intercepts = intercepts(this)?;
        if intercepts.len() != 1 {
            return Err(EncodeError::shape("intercept_ elements", 1, intercepts.len()));
        }

        let table = regression_table(intercepts[0], None, features, &coefficients[0]);
        Ok(Model::new(
            MiningFunction::Regression,
            target_schema(label),
            ModelBody::Regression {
                normalization: RegressionNormalization::None,
                tables: vec![table],
            },
        ))
    }
}

// =============================================================================
// LogisticRegression
// =============================================================================

/// Logistic regression, binary or multiclass.
///
/// Binary models emit two tables under `logit` normalization: the positive
/// class carries the coefficients and the negative class is the zero table.
/// Multiclass models emit one table per class, normalized with `softmax` for
/// multinomial fits and `logit` for one-vs-rest fits.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogisticRegression;

impl LogisticRegression {
    fn multiclass_normalization(this: &Record) -> Result<RegressionNormalization, FieldError> {
        let multi_class = this.get_optional_string("multi_class")?;
        let solver = this.get_optional_string("solver")?;
        Ok(match (multi_class, solver) {
            (Some("ovr"), _) => RegressionNormalization::Logit,
            (Some("multinomial"), _) => RegressionNormalization::Softmax,
            (_, Some("liblinear")) => RegressionNormalization::Logit,
            _ => RegressionNormalization::Softmax,
        })
    }
}

impl ObjectFactory for LogisticRegression {
    fn estimator(&self) -> Option<&dyn Estimator> {
        Some(self)
    }
}

impl Estimator for LogisticRegression {
    fn task_kind(&self, _this: &Record) -> TaskKind {
        TaskKind::Classification
    }

    fn number_of_features(&self, this: &Record) -> Option<usize> {
        n_features_in(this).or_else(|| coef_width(this))
    }

    fn op_type(&self, _this: &Record) -> Option<OpType> {
        Some(OpType::Continuous)
    }

    fn data_type(&self, _this: &Record) -> Option<DataType> {
        Some(DataType::Double)
    }

    fn has_probability_distribution(&self, _this: &Record) -> bool {
        true
    }

    fn encode_model(
        &self,
        this: &Record,
        schema: &Schema,
        _encoder: &mut Encoder,
    ) -> Result<Model, EncodeError> {
        let label = match &schema.label {
            Some(label @ Label::Categorical { .. }) => label,
            _ => {
                return Err(EncodeError::configuration(format!(
                    "{} requires a categorical label",
                    this.class()
                )))
            }
        };

        let classes = label.values();
        let features = &schema.features;
        let intercepts = intercepts(this)?;

        let (normalization, tables) = match classes.len() {
            0 | 1 => {
                return Err(EncodeError::configuration(format!(
                    "{} needs at least two classes, got {}",
                    this.class(),
                    classes.len()
                )))
            }
            2 => {
                let coefficients = coefficient_rows(this, 1, features.len())?;
                if intercepts.len() != 1 {
                    return Err(EncodeError::shape("intercept_ elements", 1, intercepts.len()));
                }
                let tables = vec![
                    regression_table(intercepts[0], Some(classes[1]), features, &coefficients[0]),
                    regression_table(0.0, Some(classes[0]), &[], &[]),
                ];
                (RegressionNormalization::Logit, tables)
            }
            n_classes => {
                let coefficients = coefficient_rows(this, n_classes, features.len())?;
                if intercepts.len() != n_classes {
                    return Err(EncodeError::shape(
                        "intercept_ elements",
                        n_classes,
                        intercepts.len(),
                    ));
                }
                let tables = classes
                    .iter()
                    .zip(&coefficients)
                    .zip(&intercepts)
                    .map(|((class, row), &intercept)| {
                        regression_table(intercept, Some(*class), features, row)
                    })
                    .collect();
                (Self::multiclass_normalization(this)?, tables)
            }
        };

        let mut model = Model::new(
            MiningFunction::Classification,
            target_schema(label),
            ModelBody::Regression {
                normalization,
                tables,
            },
        );
        model.output = Some(Output {
            fields: classes.iter().map(|&class| OutputField::probability(class)).collect(),
        });
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::numpy::NdArray;
    use crate::pickle::value::ClassName;
    use crate::pmml::FieldValue;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::sync::Arc;

    fn features(encoder: &mut Encoder, n: usize) -> Vec<Feature> {
        (1..=n)
            .map(|i| {
                let field =
                    encoder.create_data_field(format!("x{i}"), OpType::Continuous, DataType::Double);
                Feature::data(field)
            })
            .collect()
    }

    fn categorical_label(encoder: &mut Encoder, classes: &[&str]) -> Label {
        let values = classes.iter().map(|&c| FieldValue::new(c)).collect();
        Label::categorical(encoder.create_categorical_field("y", DataType::String, values))
    }

    fn tables(model: &Model) -> (&RegressionNormalization, &[RegressionTable]) {
        match &model.body {
            ModelBody::Regression {
                normalization,
                tables,
            } => (normalization, tables),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn linear_regression_single_table() {
        let record = Record::new(ClassName::new("sklearn.linear_model", "LinearRegression"), vec![])
            .with_field("coef_", Value::Array(NdArray::from_f64(&[0.5, -2.0], vec![2]).unwrap()))
            .with_field("intercept_", 1.25)
            .with_behavior(Arc::new(LinearRegression));

        let estimator = record.as_estimator().unwrap();
        assert_eq!(estimator.number_of_features(), Some(2));

        let mut encoder = Encoder::new();
        let label = Label::continuous(encoder.create_data_field("y", OpType::Continuous, DataType::Double));
        let schema = Schema::new(Some(label), features(&mut encoder, 2));

        let model = estimator.encode_model(&schema, &mut encoder).unwrap();
        assert_eq!(model.function, MiningFunction::Regression);
        assert!(model.mining_schema.contains("y"));

        let (normalization, tables) = tables(&model);
        assert_eq!(*normalization, RegressionNormalization::None);
        assert_eq!(tables.len(), 1);
        assert_relative_eq!(tables[0].intercept, 1.25);
        let names: Vec<_> = tables[0].numeric_predictors.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["x1", "x2"]);
        assert_relative_eq!(tables[0].numeric_predictors[1].coefficient, -2.0);
    }

    #[test]
    fn linear_regression_rejects_coefficient_mismatch() {
        let record = Record::new(ClassName::new("sklearn.linear_model", "LinearRegression"), vec![])
            .with_field("coef_", Value::List(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]))
            .with_field("intercept_", 0.0);

        let mut encoder = Encoder::new();
        let label = Label::continuous(encoder.create_data_field("y", OpType::Continuous, DataType::Double));
        let schema = Schema::new(Some(label), features(&mut encoder, 2));

        let err = LinearRegression
            .encode_model(&record, &schema, &mut encoder)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ShapeMismatch { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn binary_logistic_regression() {
        let coef = NdArray::from_f64(&[1.5, -0.5], vec![1, 2]).unwrap();
        let record = Record::new(ClassName::new("sklearn.linear_model", "LogisticRegression"), vec![])
            .with_field("coef_", Value::Array(coef))
            .with_field("intercept_", Value::Array(NdArray::from_f64(&[0.25], vec![1]).unwrap()));

        assert_eq!(LogisticRegression.number_of_features(&record), Some(2));

        let mut encoder = Encoder::new();
        let label = categorical_label(&mut encoder, &["no", "yes"]);
        let schema = Schema::new(Some(label), features(&mut encoder, 2));
        let model = LogisticRegression
            .encode_model(&record, &schema, &mut encoder)
            .unwrap();

        let (normalization, tables) = tables(&model);
        assert_eq!(*normalization, RegressionNormalization::Logit);
        assert_eq!(tables[0].target_category.as_deref(), Some("yes"));
        assert_relative_eq!(tables[0].intercept, 0.25);
        assert_eq!(tables[0].numeric_predictors.len(), 2);
        assert_eq!(tables[1].target_category.as_deref(), Some("no"));
        assert!(tables[1].numeric_predictors.is_empty());

        let output = model.output.as_ref().unwrap();
        assert!(output.contains_all(&["probability(no)", "probability(yes)"]));
    }

    #[rstest]
    #[case(Some("multinomial"), Some("lbfgs"), RegressionNormalization::Softmax)]
    #[case(Some("ovr"), Some("lbfgs"), RegressionNormalization::Logit)]
    #[case(Some("auto"), Some("liblinear"), RegressionNormalization::Logit)]
    #[case(None, None, RegressionNormalization::Softmax)]
    fn multiclass_normalization(
        #[case] multi_class: Option<&str>,
        #[case] solver: Option<&str>,
        #[case] expected: RegressionNormalization,
    ) {
        let mut record = Record::new(ClassName::new("sklearn.linear_model", "LogisticRegression"), vec![])
            .with_field("coef_", Value::Array(NdArray::from_f64(&[1.0, 2.0, 3.0], vec![3, 1]).unwrap()))
            .with_field("intercept_", Value::Array(NdArray::from_f64(&[0.1, 0.2, 0.3], vec![3]).unwrap()));
        if let Some(multi_class) = multi_class {
            record = record.with_field("multi_class", multi_class);
        }
        if let Some(solver) = solver {
            record = record.with_field("solver", solver);
        }

        let mut encoder = Encoder::new();
        let label = categorical_label(&mut encoder, &["a", "b", "c"]);
        let schema = Schema::new(Some(label), features(&mut encoder, 1));
        let model = LogisticRegression
            .encode_model(&record, &schema, &mut encoder)
            .unwrap();

        let (normalization, tables) = tables(&model);
        assert_eq!(*normalization, expected);
        assert_eq!(tables.len(), 3);
        assert_eq!(tables[2].target_category.as_deref(), Some("c"));
        assert_relative_eq!(tables[2].intercept, 0.3);
        assert_relative_eq!(tables[2].numeric_predictors[0].coefficient, 3.0);
    }

    #[test]
    fn logistic_regression_needs_categorical_label() {
        let record = Record::new(ClassName::new("sklearn.linear_model", "LogisticRegression"), vec![]);
        let mut encoder = Encoder::new();
        let label = Label::continuous(encoder.create_data_field("y", OpType::Continuous, DataType::Double));
        let err = LogisticRegression
            .encode_model(&record, &Schema::new(Some(label), vec![]), &mut encoder)
            .unwrap_err();
        assert!(matches!(err, EncodeError::Configuration(_)));
    }
}
