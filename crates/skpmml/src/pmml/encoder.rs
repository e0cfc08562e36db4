//! Field registry shared by the steps of one conversion.

use indexmap::IndexMap;

use super::{
    DataDictionary, DataField, DataType, DerivedField, Expression, FieldValue, Header,
    Model, OpType, Pmml, TransformationDictionary, UsageType, PMML_VERSION,
};

/// Collects data and derived fields while a pipeline is being encoded.
///
/// Field names are unique per kind; creating a field under an existing name
/// replaces it in place.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    data_fields: IndexMap<String, DataField>,
    derived_fields: IndexMap<String, DerivedField>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a data field without valid values.
    pub fn create_data_field(
        &mut self,
        name: impl Into<String>,
        op_type: OpType,
        data_type: DataType,
    ) -> &DataField {
        self.insert_data_field(DataField {
            name: name.into(),
            op_type,
            data_type,
            values: Vec::new(),
        })
    }

    /// Declare a categorical data field with its valid values.
    pub fn create_categorical_field(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        values: Vec<FieldValue>,
    ) -> &DataField {
        self.insert_data_field(DataField {
            name: name.into(),
            op_type: OpType::Categorical,
            data_type,
            values,
        })
    }

    fn insert_data_field(&mut self, field: DataField) -> &DataField {
        let index = self.data_fields.insert_full(field.name.clone(), field).0;
        &self.data_fields[index]
    }

    pub fn data_field(&self, name: &str) -> Option<&DataField> {
        self.data_fields.get(name)
    }

    pub fn data_fields(&self) -> impl Iterator<Item = &DataField> {
        self.data_fields.values()
    }

    /// Declare a field computed from other fields.
    pub fn create_derived_field(
        &mut self,
        name: impl Into<String>,
        op_type: OpType,
        data_type: DataType,
        expression: Expression,
    ) -> &DerivedField {
        let field = DerivedField {
            name: name.into(),
            op_type,
            data_type,
            expression,
        };
        let index = self.derived_fields.insert_full(field.name.clone(), field).0;
        &self.derived_fields[index]
    }

    pub fn derived_field(&self, name: &str) -> Option<&DerivedField> {
        self.derived_fields.get(name)
    }

    pub fn derived_fields(&self) -> impl Iterator<Item = &DerivedField> {
        self.derived_fields.values()
    }

    /// Assemble the document around `model`.
    ///
    /// Every data field the model's mining schema does not mention yet is
    /// added to it as an active field.
    pub fn encode_pmml(self, mut model: Model) -> Pmml {
        for name in self.data_fields.keys() {
            if !model.mining_schema.contains(name) {
                model.mining_schema.add(name.clone(), UsageType::Active);
            }
        }

        let transformation_dictionary = (!self.derived_fields.is_empty()).then(|| {
            TransformationDictionary {
                derived_fields: self.derived_fields.into_values().collect(),
            }
        });

        Pmml {
            version: PMML_VERSION.to_string(),
            header: Header::default(),
            mining_build_task: None,
            data_dictionary: DataDictionary {
                fields: self.data_fields.into_values().collect(),
            },
            transformation_dictionary,
            model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmml::{MiningFunction, MiningSchema, ModelBody, RegressionNormalization};

    #[test]
    fn redeclaring_replaces_in_place() {
        let mut encoder = Encoder::new();
        encoder.create_data_field("a", OpType::Continuous, DataType::Double);
        encoder.create_data_field("b", OpType::Continuous, DataType::Double);
        encoder.create_data_field("a", OpType::Categorical, DataType::String);

        let names: Vec<_> = encoder.data_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(encoder.data_field("a").unwrap().op_type, OpType::Categorical);
    }

    #[test]
    fn encode_pmml_adds_active_fields_after_target() {
        let mut encoder = Encoder::new();
        encoder.create_categorical_field("y", DataType::Integer, vec![FieldValue::new("0")]);
        encoder.create_data_field("x1", OpType::Continuous, DataType::Double);
        encoder.create_derived_field(
            "neg(x1)",
            OpType::Continuous,
            DataType::Double,
            Expression::apply("*", vec![Expression::field_ref("x1"), Expression::constant(-1.0)]),
        );

        let mut schema = MiningSchema::default();
        schema.add("y", UsageType::Target);
        let model = Model::new(
            MiningFunction::Classification,
            schema,
            ModelBody::Regression {
                normalization: RegressionNormalization::Logit,
                tables: vec![],
            },
        );

        let pmml = encoder.encode_pmml(model);
        let usages: Vec<_> = pmml
            .model
            .mining_schema
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.usage_type))
            .collect();
        assert_eq!(usages, vec![("y", UsageType::Target), ("x1", UsageType::Active)]);
        assert_eq!(pmml.data_dictionary.fields.len(), 2);
        assert_eq!(
            pmml.transformation_dictionary.unwrap().derived_fields[0].name,
            "neg(x1)"
        );
    }
}
