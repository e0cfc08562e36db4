//! Model verification data.
//!
//! A `sklearn2pmml.Verification` record carries sample inputs (`active_values`)
//! and the predictions the fitted pipeline made for them (`target_values`, or
//! `probability_values` for classifiers). The matrices are stored row-major;
//! they are cut into one column per field and attached to the model as-is.

use crate::pickle::value::{Record, Value};
use crate::pmml::{probability_field_name, ModelVerification, VerificationField};
use crate::schema::Label;
use crate::sklearn::EstimatorRef;

use super::EncodeError;

/// Row-major matrix over a verification attribute.
///
/// 1-D arrays and flat lists are viewed as a single column.
#[derive(Debug)]
struct Matrix<'a> {
    name: &'a str,
    values: Vec<Value>,
    rows: usize,
    columns: usize,
}

impl<'a> Matrix<'a> {
    fn from_record(record: &Record, name: &'a str) -> Result<Self, EncodeError> {
        let (values, rows, columns) = match record.get_required(name)? {
            Value::Array(array) => {
                let (rows, columns) = match *array.shape.as_slice() {
                    [rows] => (rows, 1),
                    [rows, columns] => (rows, columns),
                    ref shape => {
                        return Err(EncodeError::configuration(format!(
                            "{name} must have one or two dimensions, got shape {shape:?}"
                        )))
                    }
                };
                (array.elements()?, rows, columns)
            }
            Value::List(items) | Value::Tuple(items) => Self::nested(name, items)?,
            other => {
                return Err(EncodeError::configuration(format!(
                    "{name} must be an array or a list, got {}",
                    other.type_name()
                )))
            }
        };

        if values.len() != rows * columns {
            return Err(EncodeError::shape(format!("{name} elements"), rows * columns, values.len()));
        }
        Ok(Self {
            name,
            values,
            rows,
            columns,
        })
    }

    /// Flatten a list of rows (or a list of scalars).
    fn nested(name: &str, items: &[Value]) -> Result<(Vec<Value>, usize, usize), EncodeError> {
        let mut values = Vec::new();
        let mut width = None;
        for item in items {
            let cells = item.to_elements().unwrap_or_else(|| vec![item.clone()]);
            let expected = *width.get_or_insert(cells.len());
            if cells.len() != expected {
                return Err(EncodeError::shape(format!("{name} row length"), expected, cells.len()));
            }
            values.extend(cells);
        }
        Ok((values, items.len(), width.unwrap_or(0)))
    }

    /// Column `index`: the values at `index`, `index + C`, `index + 2C`, ...
    fn column(&self, index: usize) -> Result<Vec<String>, EncodeError> {
        if index >= self.columns {
            return Err(EncodeError::shape(
                format!("{} column index bound", self.name),
                self.columns,
                index + 1,
            ));
        }
        (0..self.rows)
            .map(|row| {
                let position = row * self.columns + index;
                self.values
                    .get(position)
                    .map(Value::to_pmml_string)
                    .ok_or_else(|| {
                        EncodeError::shape(
                            format!("{} elements", self.name),
                            position + 1,
                            self.values.len(),
                        )
                    })
            })
            .collect()
    }

    fn expect_rows(&self, rows: usize) -> Result<(), EncodeError> {
        if self.rows != rows {
            return Err(EncodeError::shape(format!("{} rows", self.name), rows, self.rows));
        }
        Ok(())
    }

    fn expect_columns(&self, columns: usize) -> Result<(), EncodeError> {
        if self.columns != columns {
            return Err(EncodeError::shape(format!("{} columns", self.name), columns, self.columns));
        }
        Ok(())
    }
}

/// Build the verification block for a supervised pipeline.
///
/// Probability columns are used when the record has them, the estimator
/// produces a probability distribution and the label is categorical; target
/// columns are used otherwise. Floating-point targets and probabilities carry
/// the record's `precision` and `zero_threshold`.
pub fn encode_verification(
    verification: &Record,
    active_fields: &[String],
    target_fields: &[String],
    label: &Label,
    estimator: &EstimatorRef<'_>,
) -> Result<ModelVerification, EncodeError> {
    let active = Matrix::from_record(verification, "active_values")?;
    let target = Matrix::from_record(verification, "target_values")?;
    target.expect_rows(active.rows)?;
    active.expect_columns(active_fields.len())?;

    let use_probabilities = verification.get_optional("probability_values").is_some()
        && estimator.has_probability_distribution()
        && label.is_categorical();

    let precision = verification.get_optional_float("precision")?;
    let zero_threshold = verification.get_optional_float("zero_threshold")?;

    let mut columns = Vec::new();
    for (index, field) in active_fields.iter().enumerate() {
        columns.push((VerificationField::new(field.as_str()), active.column(index)?));
    }

    if use_probabilities {
        let probability = Matrix::from_record(verification, "probability_values")?;
        let fields: Vec<String> = label
            .values()
            .into_iter()
            .map(probability_field_name)
            .collect();
        probability.expect_rows(active.rows)?;
        probability.expect_columns(fields.len())?;
        for (index, field) in fields.into_iter().enumerate() {
            let field = VerificationField::new(field).with_tolerance(precision, zero_threshold);
            columns.push((field, probability.column(index)?));
        }
    } else {
        target.expect_columns(target_fields.len())?;
        let floating = label.data_type().is_floating();
        for (index, field) in target_fields.iter().enumerate() {
            let mut field = VerificationField::new(field.as_str());
            if floating {
                field = field.with_tolerance(precision, zero_threshold);
            }
            columns.push((field, target.column(index)?));
        }
    }

    Ok(ModelVerification::from_columns(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::numpy::NdArray;
    use crate::pickle::value::ClassName;
    use crate::pmml::{DataField, DataType, FieldValue, OpType};
    use crate::sklearn::linear_model::{LinearRegression, LogisticRegression};
    use std::sync::Arc;

    fn matrix(values: &[f64], shape: Vec<usize>) -> Value {
        Value::Array(NdArray::from_f64(values, shape).unwrap())
    }

    fn continuous_label() -> Label {
        Label::continuous(&DataField {
            name: "y".into(),
            op_type: OpType::Continuous,
            data_type: DataType::Double,
            values: vec![],
        })
    }

    fn categorical_label() -> Label {
        Label::categorical(&DataField {
            name: "y".into(),
            op_type: OpType::Categorical,
            data_type: DataType::String,
            values: vec![FieldValue::new("a"), FieldValue::new("b")],
        })
    }

    fn estimator_record(factory: &str) -> Record {
        let record = Record::new(ClassName::new("sklearn.linear_model", factory), vec![]);
        match factory {
            "LogisticRegression" => record.with_behavior(Arc::new(LogisticRegression)),
            _ => record.with_behavior(Arc::new(LinearRegression)),
        }
    }

    fn verification() -> Record {
        Record::new(ClassName::new("sklearn2pmml", "Verification"), vec![])
            .with_field("active_values", matrix(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]))
            .with_field("target_values", matrix(&[0.5, 1.5, 2.5], vec![3]))
            .with_field("precision", 1e-13)
            .with_field("zero_threshold", 1e-13)
    }

    fn names(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strided_columns_with_tolerance() {
        let record = estimator_record("LinearRegression");
        let estimator = record.as_estimator().unwrap();
        let result = encode_verification(
            &verification(),
            &names(&["a", "b"]),
            &names(&["y"]),
            &continuous_label(),
            &estimator,
        )
        .unwrap();

        assert_eq!(result.record_count, 3);
        assert_eq!(result.rows[0], names(&["1.0", "2.0", "0.5"]));
        assert_eq!(result.rows[2], names(&["5.0", "6.0", "2.5"]));
        assert_eq!(result.fields[0].precision, None);
        assert_eq!(result.fields[2].precision, Some(1e-13));
    }

    #[test]
    fn list_of_rows() {
        let rows = Value::List(vec![
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::List(vec![Value::Int(3), Value::Int(4)]),
        ]);
        let record = Record::new(ClassName::new("sklearn2pmml", "Verification"), vec![])
            .with_field("active_values", rows)
            .with_field("target_values", Value::List(vec![Value::Int(0), Value::Int(1)]));
        let estimator_record = estimator_record("LinearRegression");
        let result = encode_verification(
            &record,
            &names(&["a", "b"]),
            &names(&["y"]),
            &continuous_label(),
            &estimator_record.as_estimator().unwrap(),
        )
        .unwrap();
        assert_eq!(result.rows[1], names(&["3", "4", "1"]));
    }

    #[test]
    fn row_count_mismatch() {
        let record = verification().with_field("target_values", matrix(&[0.5, 1.5], vec![2]));
        let estimator_record = estimator_record("LinearRegression");
        let err = encode_verification(
            &record,
            &names(&["a", "b"]),
            &names(&["y"]),
            &continuous_label(),
            &estimator_record.as_estimator().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn active_column_mismatch() {
        let estimator_record = estimator_record("LinearRegression");
        let err = encode_verification(
            &verification(),
            &names(&["a", "b", "c"]),
            &names(&["y"]),
            &continuous_label(),
            &estimator_record.as_estimator().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::ShapeMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn probability_columns_for_classifiers() {
        let record = verification()
            .with_field("target_values", Value::List(vec!["a".into(), "b".into(), "a".into()]))
            .with_field("probability_values", matrix(&[0.9, 0.1, 0.2, 0.8, 0.7, 0.3], vec![3, 2]));
        let estimator_record = estimator_record("LogisticRegression");
        let result = encode_verification(
            &record,
            &names(&["a", "b"]),
            &names(&["y"]),
            &categorical_label(),
            &estimator_record.as_estimator().unwrap(),
        )
        .unwrap();

        let columns: Vec<_> = result.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(columns, vec!["a", "b", "probability(a)", "probability(b)"]);
        assert_eq!(result.rows[1][3], "0.8");
        assert_eq!(result.fields[3].zero_threshold, Some(1e-13));
    }

    #[test]
    fn probabilities_ignored_without_distribution() {
        let record = verification()
            .with_field("target_values", Value::List(vec!["a".into(), "b".into(), "a".into()]))
            .with_field("probability_values", matrix(&[0.9, 0.1, 0.2, 0.8, 0.7, 0.3], vec![3, 2]));
        // a regressor paired with a categorical label has no probability output
        let estimator_record = estimator_record("LinearRegression");
        let result = encode_verification(
            &record,
            &names(&["a", "b"]),
            &names(&["y"]),
            &categorical_label(),
            &estimator_record.as_estimator().unwrap(),
        )
        .unwrap();

        let columns: Vec<_> = result.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(columns, vec!["a", "b", "y"]);
        assert_eq!(result.fields[2].precision, None);
        assert_eq!(result.rows[2][2], "a");
    }
}
