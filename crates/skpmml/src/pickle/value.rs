//! Decoded pickle values.
//!
//! Every opcode stream decodes into a tree of [`Value`]s. Objects created by a
//! class reference become [`Record`]s: a class name, the constructor arguments
//! and the attribute mapping applied by `BUILD`. Records created by a
//! specialized factory additionally keep a handle to that factory, which is
//! how estimator and transformer capabilities are reached later on.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::numpy::NdArray;
use super::registry::ObjectFactory;
use crate::sklearn::{EstimatorRef, TransformerRef};

// =============================================================================
// ClassName
// =============================================================================

/// Fully qualified Python class (or function) reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassName {
    /// Defining module, e.g. `sklearn.linear_model._base`.
    pub module: String,
    /// Unqualified name, e.g. `LinearRegression`.
    pub name: String,
}

impl ClassName {
    /// Create a class name from its module and unqualified name.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Split a dotted `module.Name` key at its last dot.
    ///
    /// Returns `None` when the key contains no dot.
    pub fn parse(key: &str) -> Option<Self> {
        let dot = key.rfind('.')?;
        let (module, name) = (&key[..dot], &key[dot + 1..]);
        if module.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(module, name))
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

// =============================================================================
// FieldError
// =============================================================================

/// Failure of a typed attribute accessor on a [`Record`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("attribute '{field}' of {class} is not set")]
    Missing { class: ClassName, field: String },
    #[error("attribute '{field}' of {class} has type {actual}, expected {expected}")]
    Type {
        class: ClassName,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
}

// =============================================================================
// Value
// =============================================================================

/// A decoded pickle value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Dict),
    Record(Record),
    Array(NdArray),
    /// A class or function reference that was never called.
    Global(ClassName),
}

impl Value {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Record(_) => "object",
            Self::Array(_) => "ndarray",
            Self::Global(_) => "global",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Array(array) => array.scalar().ok().and_then(|v| v.as_i64()),
            _ => None,
        }
    }

    /// Numeric value as `f64`; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::Array(array) => array.scalar().ok().and_then(|v| v.as_f64()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Flatten a sequence-like value (list, tuple or array) into its elements.
    ///
    /// Arrays are flattened in row-major order regardless of their memory layout.
    pub fn to_elements(&self) -> Option<Vec<Value>> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items.clone()),
            Self::Array(array) => array.elements().ok(),
            _ => None,
        }
    }

    /// Render a scalar the way PMML documents spell values.
    ///
    /// Integral floats keep a trailing `.0` so that `1.0` and `1` stay distinct.
    pub fn to_pmml_string(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::String(s) => s.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => format!("{other:?}"),
        }
    }
}

/// Format a float with the shortest representation, keeping `.0` on integers.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "INF" } else { "-INF" };
        text.to_string()
    } else {
        value.to_string()
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

// =============================================================================
// Dict
// =============================================================================

/// Insertion-ordered Python dict.
///
/// Keys are arbitrary values (class labels are often integers), so lookups are
/// linear. Pickled dicts in model files are small.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`.
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a string key.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl IntoIterator for Dict {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(Value, Value)> for Dict {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

// =============================================================================
// Record
// =============================================================================

/// An object reconstructed from a class reference.
#[derive(Clone)]
pub struct Record {
    class: ClassName,
    args: Vec<Value>,
    fields: IndexMap<String, Value>,
    behavior: Option<Arc<dyn ObjectFactory>>,
}

impl Record {
    /// Create an empty record for `class` with the given constructor arguments.
    pub fn new(class: ClassName, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            fields: IndexMap::new(),
            behavior: None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attach the specialized factory whose capabilities this record exposes.
    pub fn with_behavior(mut self, behavior: Arc<dyn ObjectFactory>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.fields
    }

    pub fn behavior(&self) -> Option<&Arc<dyn ObjectFactory>> {
        self.behavior.as_ref()
    }

    pub(crate) fn set_behavior(&mut self, behavior: Arc<dyn ObjectFactory>) {
        self.behavior = Some(behavior);
    }

    /// Apply a `__setstate__`-style state value.
    ///
    /// Dict states populate attributes; `(dict, slots)` pairs populate both.
    /// Any other state is kept verbatim under `__state__`.
    pub fn apply_state(&mut self, state: Value) {
        match state {
            Value::Dict(dict) => self.merge_dict(dict),
            Value::Tuple(mut items) if items.len() == 2 => {
                let slots = items.pop().unwrap_or(Value::None);
                let main = items.pop().unwrap_or(Value::None);
                for part in [main, slots] {
                    match part {
                        Value::Dict(dict) => self.merge_dict(dict),
                        Value::None => {}
                        other => {
                            self.fields.insert("__state__".to_string(), other);
                        }
                    }
                }
            }
            Value::None => {}
            other => {
                self.fields.insert("__state__".to_string(), other);
            }
        }
    }

    fn merge_dict(&mut self, dict: Dict) {
        for (key, value) in dict {
            match key {
                Value::String(name) => {
                    self.fields.insert(name, value);
                }
                other => {
                    self.fields.insert(other.to_pmml_string(), value);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    /// Raw attribute lookup.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Whether the attribute is present (even if it holds `None`).
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Attribute lookup treating Python `None` as absent.
    pub fn get_optional(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_none())
    }

    pub fn get_required(&self, name: &str) -> Result<&Value, FieldError> {
        self.get_optional(name).ok_or_else(|| FieldError::Missing {
            class: self.class.clone(),
            field: name.to_string(),
        })
    }

    pub fn get_optional_string(&self, name: &str) -> Result<Option<&str>, FieldError> {
        match self.get_optional(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.type_error(name, "str", other)),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<&str, FieldError> {
        let value = self.get_required(name)?;
        value
            .as_str()
            .ok_or_else(|| self.type_error(name, "str", value))
    }

    pub fn get_int(&self, name: &str) -> Result<i64, FieldError> {
        let value = self.get_required(name)?;
        value
            .as_i64()
            .ok_or_else(|| self.type_error(name, "int", value))
    }

    pub fn get_optional_float(&self, name: &str) -> Result<Option<f64>, FieldError> {
        match self.get_optional(name) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.type_error(name, "float", value)),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<f64, FieldError> {
        let value = self.get_required(name)?;
        value
            .as_f64()
            .ok_or_else(|| self.type_error(name, "float", value))
    }

    pub fn get_record(&self, name: &str) -> Result<&Record, FieldError> {
        let value = self.get_required(name)?;
        value
            .as_record()
            .ok_or_else(|| self.type_error(name, "object", value))
    }

    pub fn get_optional_record(&self, name: &str) -> Result<Option<&Record>, FieldError> {
        match self.get_optional(name) {
            None => Ok(None),
            Some(Value::Record(record)) => Ok(Some(record)),
            Some(other) => Err(self.type_error(name, "object", other)),
        }
    }

    /// Elements of a list, tuple or array attribute, flattened row-major.
    pub fn get_values(&self, name: &str) -> Result<Vec<Value>, FieldError> {
        let value = self.get_required(name)?;
        value
            .to_elements()
            .ok_or_else(|| self.type_error(name, "sequence", value))
    }

    /// A sequence attribute of floats.
    pub fn get_f64_values(&self, name: &str) -> Result<Vec<f64>, FieldError> {
        let value = self.get_required(name)?;
        let elements = value
            .to_elements()
            .ok_or_else(|| self.type_error(name, "sequence", value))?;
        elements
            .iter()
            .map(|element| {
                element
                    .as_f64()
                    .ok_or_else(|| self.type_error(name, "float sequence", element))
            })
            .collect()
    }

    /// A sequence attribute of strings, or `None` when unset.
    pub fn get_optional_strings(&self, name: &str) -> Result<Option<Vec<String>>, FieldError> {
        let Some(value) = self.get_optional(name) else {
            return Ok(None);
        };
        let elements = value
            .to_elements()
            .ok_or_else(|| self.type_error(name, "sequence", value))?;
        elements
            .into_iter()
            .map(|element| match element {
                Value::String(s) => Ok(s),
                other => Err(self.type_error(name, "str sequence", &other)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn type_error(&self, field: &str, expected: &'static str, actual: &Value) -> FieldError {
        FieldError::Type {
            class: self.class.clone(),
            field: field.to_string(),
            expected,
            actual: actual.type_name(),
        }
    }

    // -------------------------------------------------------------------------
    // Capabilities
    // -------------------------------------------------------------------------

    /// View this record as an estimator, if its factory declares one.
    pub fn as_estimator(&self) -> Option<EstimatorRef<'_>> {
        let estimator = self.behavior.as_ref()?.estimator()?;
        Some(EstimatorRef::new(self, estimator))
    }

    /// View this record as a transformer, if its factory declares one.
    pub fn as_transformer(&self) -> Option<TransformerRef<'_>> {
        let transformer = self.behavior.as_ref()?.transformer()?;
        Some(TransformerRef::new(self, transformer))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.args == other.args && self.fields == other.fields
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("class", &self.class.to_string())
            .field("args", &self.args)
            .field("fields", &self.fields)
            .field("specialized", &self.behavior.is_some())
            .finish()
    }
}
