//! Post-processing of model outputs.
//!
//! A post-processor (`predict_transformer`, `predict_proba_transformer`,
//! `apply_transformer`) reads output fields the model already declares and
//! derives new values from them. Its derived fields are appended to the output
//! block that declares every field it reads.

use crate::pmml::{Encoder, Model, Output, OutputField};
use crate::schema::Feature;
use crate::sklearn::TransformerRef;

use super::EncodeError;

/// Splice the fields `transformer` derives from `fields` into `model`'s output.
///
/// Fails with [`EncodeError::MissingOutputField`] when no output block in the
/// model tree declares all of `fields`.
pub fn encode_output(
    model: &mut Model,
    fields: &[OutputField],
    transformer: &TransformerRef<'_>,
) -> Result<(), EncodeError> {
    let mut encoder = Encoder::new();
    let mut features = Vec::with_capacity(fields.len());
    for field in fields {
        encoder.create_data_field(field.name.clone(), field.op_type, field.data_type);
        features.push(Feature::wildcard(field));
    }
    transformer.encode_features(features, &mut encoder)?;

    let names: Vec<&str> = fields.iter().map(|field| field.name.as_str()).collect();
    let output = find_output(model, &names).ok_or_else(|| EncodeError::MissingOutputField {
        fields: names.iter().map(|name| name.to_string()).collect(),
    })?;
    output
        .fields
        .extend(encoder.derived_fields().map(OutputField::transformed_value));
    Ok(())
}

/// First non-empty output block declaring all of `names`, searching the model
/// before its segments, depth first.
pub fn find_output<'m>(model: &'m mut Model, names: &[&str]) -> Option<&'m mut Output> {
    let path = output_path(model, names)?;
    model.descendant_mut(&path)?.output.as_mut()
}

/// Segment indices leading to the matching model.
fn output_path(model: &Model, names: &[&str]) -> Option<Vec<usize>> {
    let matches = model
        .output
        .as_ref()
        .is_some_and(|output| !output.fields.is_empty() && output.contains_all(names));
    if matches {
        return Some(Vec::new());
    }
    model
        .segments()
        .iter()
        .enumerate()
        .find_map(|(index, segment)| {
            let mut path = output_path(&segment.model, names)?;
            path.insert(0, index);
            Some(path)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::numpy::NdArray;
    use crate::pickle::value::{ClassName, Record, Value};
    use crate::pmml::{
        DataType, MiningFunction, MiningSchema, ModelBody, MultipleModelMethod, OpType,
        RegressionNormalization, ResultFeature, Segment, Segmentation,
    };
    use crate::sklearn::preprocessing::StandardScaler;
    use std::sync::Arc;

    fn regression(output: Option<Vec<OutputField>>) -> Model {
        let mut model = Model::new(
            MiningFunction::Regression,
            MiningSchema::default(),
            ModelBody::Regression {
                normalization: RegressionNormalization::None,
                tables: vec![],
            },
        );
        model.output = output.map(|fields| Output { fields });
        model
    }

    fn scaler() -> Record {
        Record::new(ClassName::new("sklearn.preprocessing", "StandardScaler"), vec![])
            .with_field("mean_", Value::Array(NdArray::from_f64(&[1.0], vec![1]).unwrap()))
            .with_field("scale_", Value::Array(NdArray::from_f64(&[2.0], vec![1]).unwrap()))
            .with_behavior(Arc::new(StandardScaler))
    }

    fn predict_y() -> OutputField {
        OutputField::predicted_value("predict(y)", OpType::Continuous, DataType::Double)
            .with_final_result(false)
    }

    #[test]
    fn appends_transformed_values() {
        let mut model = regression(Some(vec![predict_y()]));
        let record = scaler();
        let transformer = record.as_transformer().unwrap();

        encode_output(&mut model, &[predict_y()], &transformer).unwrap();

        let fields = &model.output.as_ref().unwrap().fields;
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].name, "standard_scaler(predict(y))");
        assert_eq!(fields[1].result_feature, ResultFeature::TransformedValue);
        assert!(fields[1].expression.is_some());
    }

    #[test]
    fn missing_output_field() {
        let mut model = regression(Some(vec![OutputField::probability("a")]));
        let record = scaler();
        let transformer = record.as_transformer().unwrap();

        let err = encode_output(&mut model, &[predict_y()], &transformer).unwrap_err();
        match err {
            EncodeError::MissingOutputField { fields } => assert_eq!(fields, vec!["predict(y)"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn searches_segments_depth_first() {
        let inner = regression(Some(vec![predict_y()]));
        let mut model = Model::new(
            MiningFunction::Regression,
            MiningSchema::default(),
            ModelBody::Mining {
                segmentation: Segmentation {
                    multiple_model_method: MultipleModelMethod::ModelChain,
                    segments: vec![
                        Segment { id: "1".into(), model: regression(Some(vec![])) },
                        Segment { id: "2".into(), model: inner },
                    ],
                },
            },
        );
        model.output = Some(Output::default());

        let output = find_output(&mut model, &["predict(y)"]).unwrap();
        output.fields.push(OutputField::probability("marker"));

        let segment = &model.segments()[1].model;
        assert_eq!(segment.output.as_ref().unwrap().fields.len(), 2);
    }
}
