//! `sklearn.preprocessing` transformers.

use crate::pickle::registry::ObjectFactory;
use crate::pickle::value::{FieldError, Record, Value};
use crate::pipeline::EncodeError;
use crate::pmml::{DataType, Encoder, Expression, OpType};
use crate::schema::Feature;

use super::{n_features_in, Transformer};

/// Standardization `(x - mean_) / scale_`.
///
/// Either statistic may be absent (`with_mean=False`, `with_std=False`). Columns
/// whose transform is the identity pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardScaler;

impl StandardScaler {
    /// A fitted statistic, unless its `with_*` switch turned it off.
    fn statistic(this: &Record, switch: &str, name: &str) -> Result<Option<Vec<f64>>, FieldError> {
        let enabled = this
            .get_optional(switch)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !enabled || this.get_optional(name).is_none() {
            return Ok(None);
        }
        this.get_f64_values(name).map(Some)
    }

    fn check_width(
        name: &str,
        values: Option<&Vec<f64>>,
        expected: usize,
    ) -> Result<(), EncodeError> {
        match values {
            Some(values) if values.len() != expected => {
                Err(EncodeError::shape(name, expected, values.len()))
            }
            _ => Ok(()),
        }
    }
}

impl ObjectFactory for StandardScaler {
    fn transformer(&self) -> Option<&dyn Transformer> {
        Some(self)
    }
}

impl Transformer for StandardScaler {
    fn op_type(&self, _this: &Record) -> Option<OpType> {
        Some(OpType::Continuous)
    }

    fn data_type(&self, _this: &Record) -> Option<DataType> {
        Some(DataType::Double)
    }

    fn number_of_features(&self, this: &Record) -> Option<usize> {
        n_features_in(this).or_else(|| {
            ["mean_", "scale_"]
                .iter()
                .find_map(|name| this.get_optional(name)?.to_elements())
                .map(|values| values.len())
        })
    }

    fn encode_features(
        &self,
        this: &Record,
        features: Vec<Feature>,
        encoder: &mut Encoder,
    ) -> Result<Vec<Feature>, EncodeError> {
        let mean = Self::statistic(this, "with_mean", "mean_")?;
        let scale = Self::statistic(this, "with_std", "scale_")?;
        Self::check_width("mean_ elements", mean.as_ref(), features.len())?;
        Self::check_width("scale_ elements", scale.as_ref(), features.len())?;

        let mut result = Vec::with_capacity(features.len());
        for (i, feature) in features.into_iter().enumerate() {
            let offset = mean.as_ref().map_or(0.0, |mean| mean[i]);
            let factor = scale.as_ref().map_or(1.0, |scale| scale[i]);
            if offset == 0.0 && factor == 1.0 {
                result.push(feature);
                continue;
            }

            let mut expression = feature.field_ref();
            if offset != 0.0 {
                expression = Expression::apply("-", vec![expression, Expression::constant(offset)]);
            }
            if factor != 1.0 {
                expression = Expression::apply("/", vec![expression, Expression::constant(factor)]);
            }

            let field = encoder.create_derived_field(
                format!("standard_scaler({})", feature.name),
                OpType::Continuous,
                DataType::Double,
                expression,
            );
            result.push(Feature::derived(field));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::numpy::NdArray;
    use crate::pickle::value::ClassName;
    use crate::schema::FieldSource;

    fn scaler(mean: &[f64], scale: &[f64]) -> Record {
        Record::new(ClassName::new("sklearn.preprocessing._data", "StandardScaler"), vec![])
            .with_field("with_mean", true)
            .with_field("with_std", true)
            .with_field("mean_", Value::Array(NdArray::from_f64(mean, vec![mean.len()]).unwrap()))
            .with_field("scale_", Value::Array(NdArray::from_f64(scale, vec![scale.len()]).unwrap()))
    }

    fn inputs(encoder: &mut Encoder, names: &[&str]) -> Vec<Feature> {
        names
            .iter()
            .map(|&name| {
                Feature::data(encoder.create_data_field(name, OpType::Continuous, DataType::Double))
            })
            .collect()
    }

    #[test]
    fn derives_standardized_fields() {
        let record = scaler(&[1.0, 0.0], &[2.0, 1.0]);
        assert_eq!(StandardScaler.number_of_features(&record), Some(2));

        let mut encoder = Encoder::new();
        let features = inputs(&mut encoder, &["a", "b"]);
        let out = StandardScaler
            .encode_features(&record, features, &mut encoder)
            .unwrap();

        assert_eq!(out[0].name, "standard_scaler(a)");
        assert_eq!(out[0].source, FieldSource::Derived);
        // identity column is passed through
        assert_eq!(out[1].name, "b");
        assert_eq!(out[1].source, FieldSource::Data);

        let derived = encoder.derived_field("standard_scaler(a)").unwrap();
        assert_eq!(
            derived.expression,
            Expression::apply(
                "/",
                vec![
                    Expression::apply("-", vec![Expression::field_ref("a"), Expression::constant(1.0)]),
                    Expression::constant(2.0),
                ],
            )
        );
    }

    #[test]
    fn disabled_statistics_are_ignored() {
        let record = scaler(&[5.0], &[3.0]).with_field("with_mean", false);
        let mut encoder = Encoder::new();
        let features = inputs(&mut encoder, &["a"]);
        StandardScaler
            .encode_features(&record, features, &mut encoder)
            .unwrap();

        let derived = encoder.derived_field("standard_scaler(a)").unwrap();
        assert_eq!(
            derived.expression,
            Expression::apply("/", vec![Expression::field_ref("a"), Expression::constant(3.0)])
        );
    }

    #[test]
    fn width_mismatch() {
        let record = scaler(&[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0]);
        let mut encoder = Encoder::new();
        let features = inputs(&mut encoder, &["a", "b"]);
        let err = StandardScaler
            .encode_features(&record, features, &mut encoder)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ShapeMismatch { expected: 2, actual: 3, .. }
        ));
    }
}
