//! Feature schema passed from the pipeline compiler to estimators.

use crate::pmml::{DataField, DataType, DerivedField, Expression, FieldValue, OpType, OutputField};

/// Kind of PMML field a feature refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Data,
    Derived,
    /// Unconstrained stand-in for an output field, used by post-processors.
    Wildcard,
}

/// One named, typed model input.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub name: String,
    pub op_type: OpType,
    pub data_type: DataType,
    pub source: FieldSource,
}

impl Feature {
    /// Feature backed by a data field, passed through without restriction.
    pub fn data(field: &DataField) -> Self {
        Self {
            name: field.name.clone(),
            op_type: field.op_type,
            data_type: field.data_type,
            source: FieldSource::Data,
        }
    }

    /// Feature backed by a derived field.
    pub fn derived(field: &DerivedField) -> Self {
        Self {
            name: field.name.clone(),
            op_type: field.op_type,
            data_type: field.data_type,
            source: FieldSource::Derived,
        }
    }

    /// Placeholder over an output field.
    pub fn wildcard(field: &OutputField) -> Self {
        Self {
            name: field.name.clone(),
            op_type: field.op_type,
            data_type: field.data_type,
            source: FieldSource::Wildcard,
        }
    }

    pub fn field_ref(&self) -> Expression {
        Expression::field_ref(self.name.clone())
    }
}

/// Target variable of a supervised model.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Categorical {
        name: String,
        data_type: DataType,
        /// Class values in estimator order, with their annotations.
        values: Vec<FieldValue>,
    },
    Continuous {
        name: String,
        data_type: DataType,
    },
}

impl Label {
    /// Label over a categorical data field.
    pub fn categorical(field: &DataField) -> Self {
        Self::Categorical {
            name: field.name.clone(),
            data_type: field.data_type,
            values: field.values.clone(),
        }
    }

    /// Label over a continuous data field.
    pub fn continuous(field: &DataField) -> Self {
        Self::Continuous {
            name: field.name.clone(),
            data_type: field.data_type,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Categorical { name, .. } | Self::Continuous { name, .. } => name,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Categorical { data_type, .. } | Self::Continuous { data_type, .. } => *data_type,
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            Self::Categorical { .. } => OpType::Categorical,
            Self::Continuous { .. } => OpType::Continuous,
        }
    }

    /// Class values as strings; empty for continuous labels.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Categorical { values, .. } => values.iter().map(|v| v.value.as_str()).collect(),
            Self::Continuous { .. } => Vec::new(),
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, Self::Categorical { .. })
    }
}

/// Label and features an estimator encodes its model against.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub label: Option<Label>,
    pub features: Vec<Feature>,
}

impl Schema {
    pub fn new(label: Option<Label>, features: Vec<Feature>) -> Self {
        Self { label, features }
    }
}
