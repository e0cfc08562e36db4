//! NumPy array and dtype reconstruction.
//!
//! Arrays reach a pickle stream in two ways:
//!
//! - **Reduce protocol**: `numpy.core.multiarray._reconstruct(ndarray, (0,), b'b')`
//!   followed by `BUILD` with `(version, shape, dtype, is_fortran, data)`.
//!   [`ReconstructFactory`] handles this entirely inside the generic machine.
//! - **joblib wrappers**: a `NumpyArrayWrapper` sentinel carrying only
//!   `dtype`/`shape`/`order`, with the payload written to the stream right
//!   after the `BUILD` opcode. [`read_wrapped_array`] is the fast path the
//!   decoder switches to for those. Older `NDArrayWrapper` sentinels point at
//!   a sibling `.npy` file instead; see [`super::npy`].

use std::io::Read;

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use thiserror::Error;

use super::registry::{Factory, ObjectFactory, Registry};
use super::unpickler::{read_bounded, read_exact, DecodeError, Unpickler};
use super::value::{ClassName, Record, Value};

/// Module paths NumPy has used for its pickling helpers.
const MULTIARRAY_MODULES: [&str; 2] = ["numpy.core.multiarray", "numpy._core.multiarray"];

/// Module paths of the joblib array wrapper sentinel.
pub const ARRAY_WRAPPER_MODULES: [&str; 2] = [
    "joblib.numpy_pickle",
    "sklearn.externals.joblib.numpy_pickle",
];

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while interpreting array metadata or payloads.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArrayError {
    #[error("unsupported dtype '{0}'")]
    UnsupportedDType(String),

    #[error("array payload has {actual} bytes, dtype and shape require {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("array element count {actual} does not match shape (expected {expected})")]
    ElementCount { expected: usize, actual: usize },

    #[error("invalid array element: {0}")]
    InvalidElement(String),

    #[error("invalid array state: {0}")]
    InvalidState(String),

    #[error("array has {0} elements, expected a scalar")]
    NotScalar(usize),

    #[error("array of shape {shape:?} with {item_size}-byte elements exceeds the address space")]
    TooLarge { shape: Vec<usize>, item_size: usize },

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

// =============================================================================
// DType
// =============================================================================

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    /// Single-byte and object elements.
    NotApplicable,
}

impl ByteOrder {
    fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    fn symbol(self) -> char {
        match self {
            Self::Little => '<',
            Self::Big => '>',
            Self::NotApplicable => '|',
        }
    }
}

/// Element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeKind {
    Bool,
    Int,
    UInt,
    Float,
    /// Fixed-width byte strings (`S`).
    Bytes,
    /// Fixed-width UTF-32 strings (`U`).
    Unicode,
    /// Python object references.
    Object,
}

/// Array element type, as described by a NumPy type string such as `<f8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DType {
    pub kind: DTypeKind,
    /// Bytes per element.
    pub item_size: usize,
    pub byte_order: ByteOrder,
}

impl DType {
    pub fn new(kind: DTypeKind, item_size: usize, byte_order: ByteOrder) -> Self {
        let byte_order = if item_size <= 1 || kind == DTypeKind::Object {
            ByteOrder::NotApplicable
        } else {
            byte_order
        };
        Self {
            kind,
            item_size,
            byte_order,
        }
    }

    pub fn float64() -> Self {
        Self::new(DTypeKind::Float, 8, ByteOrder::Little)
    }

    pub fn int64() -> Self {
        Self::new(DTypeKind::Int, 8, ByteOrder::Little)
    }

    /// Parse a NumPy type string (`<f8`, `|b1`, `O8`, `<U5`, `float64`, ...).
    pub fn parse(descr: &str) -> Result<Self, ArrayError> {
        let unsupported = || ArrayError::UnsupportedDType(descr.to_string());

        if let Some(canonical) = named_dtype(descr) {
            return Self::parse(canonical);
        }

        let mut chars = descr.chars();
        let (order, rest) = match chars.next() {
            Some('<') => (ByteOrder::Little, chars.as_str()),
            Some('>') => (ByteOrder::Big, chars.as_str()),
            Some('|') => (ByteOrder::NotApplicable, chars.as_str()),
            Some('=') => (ByteOrder::native(), chars.as_str()),
            Some(_) => (ByteOrder::native(), descr),
            None => return Err(unsupported()),
        };

        let code = rest.chars().next().ok_or_else(unsupported)?;
        let digits = &rest[code.len_utf8()..];
        let size = if digits.is_empty() {
            None
        } else {
            Some(digits.parse::<usize>().map_err(|_| unsupported())?)
        };

        let (kind, item_size) = match (code, size) {
            ('?', None) | ('b', Some(1)) => (DTypeKind::Bool, 1),
            ('b', None) => (DTypeKind::Int, 1),
            ('B', None) => (DTypeKind::UInt, 1),
            ('i', Some(n @ (1 | 2 | 4 | 8))) => (DTypeKind::Int, n),
            ('u', Some(n @ (1 | 2 | 4 | 8))) => (DTypeKind::UInt, n),
            ('f', Some(n @ (4 | 8))) => (DTypeKind::Float, n),
            ('O', None | Some(4 | 8)) => (DTypeKind::Object, 8),
            ('U', Some(n)) if n > 0 => (DTypeKind::Unicode, n.checked_mul(4).ok_or_else(unsupported)?),
            ('S' | 'a', Some(n)) if n > 0 => (DTypeKind::Bytes, n),
            _ => return Err(unsupported()),
        };

        Ok(Self::new(kind, item_size, order))
    }

    /// NumPy type string for this dtype.
    pub fn descr(&self) -> String {
        let (code, size) = match self.kind {
            DTypeKind::Bool => ('b', 1),
            DTypeKind::Int => ('i', self.item_size),
            DTypeKind::UInt => ('u', self.item_size),
            DTypeKind::Float => ('f', self.item_size),
            DTypeKind::Bytes => ('S', self.item_size),
            DTypeKind::Unicode => ('U', self.item_size / 4),
            DTypeKind::Object => return "|O".to_string(),
        };
        format!("{}{}{}", self.byte_order.symbol(), code, size)
    }

    /// Interpret a decoded dtype: a `numpy.dtype` record, a type string, or a
    /// scalar type reference such as `numpy.float64`.
    pub fn from_value(value: &Value) -> Result<Self, ArrayError> {
        match value {
            Value::String(descr) => Self::parse(descr),
            Value::Record(record) => {
                let descr = record
                    .get("descr")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ArrayError::InvalidState(format!("{record:?} is not a dtype")))?;
                Self::parse(descr)
            }
            Value::Global(class) if class.module == "numpy" || class.module == "builtins" => {
                Self::parse(&class.name)
            }
            other => Err(ArrayError::InvalidState(format!(
                "expected a dtype, got {}",
                other.type_name()
            ))),
        }
    }

    /// Decode one element from exactly `item_size` bytes.
    pub fn decode_element(&self, bytes: &[u8]) -> Result<Value, ArrayError> {
        debug_assert_eq!(bytes.len(), self.item_size);
        match self.kind {
            DTypeKind::Bool => Ok(Value::Bool(bytes[0] != 0)),
            DTypeKind::Int => {
                let raw = self.read_uint(bytes);
                let shift = 64 - 8 * self.item_size as u32;
                Ok(Value::Int(((raw << shift) as i64) >> shift))
            }
            DTypeKind::UInt => {
                let raw = self.read_uint(bytes);
                i64::try_from(raw)
                    .map(Value::Int)
                    .map_err(|_| ArrayError::InvalidElement(format!("{raw} overflows int64")))
            }
            DTypeKind::Float => {
                let raw = self.read_uint(bytes);
                Ok(Value::Float(match self.item_size {
                    4 => f64::from(f32::from_bits(raw as u32)),
                    _ => f64::from_bits(raw),
                }))
            }
            DTypeKind::Bytes => {
                let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Ok(Value::Bytes(bytes[..end].to_vec()))
            }
            DTypeKind::Unicode => {
                let mut text = String::with_capacity(bytes.len() / 4);
                for chunk in bytes.chunks_exact(4) {
                    let code = self.read_uint(chunk) as u32;
                    if code == 0 {
                        break;
                    }
                    let ch = char::from_u32(code).ok_or_else(|| {
                        ArrayError::InvalidElement(format!("invalid code point {code:#x}"))
                    })?;
                    text.push(ch);
                }
                Ok(Value::String(text))
            }
            DTypeKind::Object => Err(ArrayError::InvalidElement(
                "object elements have no binary representation".to_string(),
            )),
        }
    }

    fn read_uint(&self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, &b: &u8| (acc << 8) | u64::from(b);
        match self.byte_order {
            ByteOrder::Big => bytes.iter().fold(0, fold),
            _ => bytes.iter().rev().fold(0, fold),
        }
    }
}

fn named_dtype(name: &str) -> Option<&'static str> {
    Some(match name {
        "float64" | "double" | "float" | "float_" => "<f8",
        "float32" | "single" => "<f4",
        "int64" | "int" | "int_" | "long" | "longlong" => "<i8",
        "int32" | "intc" => "<i4",
        "int16" | "short" => "<i2",
        "int8" | "byte" => "|i1",
        "uint64" | "ulonglong" => "<u8",
        "uint32" | "uintc" => "<u4",
        "uint16" | "ushort" => "<u2",
        "uint8" | "ubyte" => "|u1",
        "bool" | "bool_" => "|b1",
        "object" | "object_" => "|O",
        _ => return None,
    })
}

// =============================================================================
// NdArray
// =============================================================================

/// Number of elements of `shape`, or `None` when it overflows `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

/// Payload size in bytes of `shape` elements of `item_size` bytes each.
pub(crate) fn byte_len(shape: &[usize], item_size: usize) -> Result<usize, ArrayError> {
    element_count(shape)
        .and_then(|count| count.checked_mul(item_size))
        .ok_or_else(|| ArrayError::TooLarge {
            shape: shape.to_vec(),
            item_size,
        })
}

/// Array element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// Flat buffer in the array's memory order.
    Raw(Vec<u8>),
    /// Decoded elements of an object array, in memory order.
    Objects(Vec<Value>),
}

/// A materialized NumPy array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Whether `data` is laid out column-major.
    pub fortran_order: bool,
    pub data: ArrayData,
}

impl NdArray {
    /// Wrap a raw buffer, checking its length against dtype and shape.
    pub fn from_raw(
        dtype: DType,
        shape: Vec<usize>,
        fortran_order: bool,
        bytes: Vec<u8>,
    ) -> Result<Self, ArrayError> {
        if dtype.kind == DTypeKind::Object {
            return Err(ArrayError::UnsupportedDType(
                "object arrays need decoded elements".to_string(),
            ));
        }
        let expected = byte_len(&shape, dtype.item_size)?;
        if bytes.len() != expected {
            return Err(ArrayError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            fortran_order,
            data: ArrayData::Raw(bytes),
        })
    }

    /// Wrap already-decoded object elements.
    pub fn from_objects(
        shape: Vec<usize>,
        fortran_order: bool,
        values: Vec<Value>,
    ) -> Result<Self, ArrayError> {
        let expected = element_count(&shape).ok_or_else(|| ArrayError::TooLarge {
            shape: shape.clone(),
            item_size: 8,
        })?;
        if values.len() != expected {
            return Err(ArrayError::ElementCount {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            dtype: DType::new(DTypeKind::Object, 8, ByteOrder::NotApplicable),
            shape,
            fortran_order,
            data: ArrayData::Objects(values),
        })
    }

    /// Row-major little-endian `float64` array.
    pub fn from_f64(values: &[f64], shape: Vec<usize>) -> Result<Self, ArrayError> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_raw(DType::float64(), shape, false, bytes)
    }

    /// Total element count.
    ///
    /// Constructors reject shapes whose count overflows; this saturates for
    /// hand-built values.
    pub fn len(&self) -> usize {
        self.shape.iter().fold(1usize, |count, &dim| count.saturating_mul(dim))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Elements in memory order.
    fn storage_elements(&self) -> Result<Vec<Value>, ArrayError> {
        match &self.data {
            ArrayData::Objects(values) => Ok(values.clone()),
            ArrayData::Raw(bytes) => {
                if self.dtype.item_size == 0 {
                    return Ok(vec![self.dtype.decode_element(&[])?; self.len()]);
                }
                bytes
                    .chunks_exact(self.dtype.item_size)
                    .map(|chunk| self.dtype.decode_element(chunk))
                    .collect()
            }
        }
    }

    /// All elements, flattened in row-major (C) order.
    pub fn elements(&self) -> Result<Vec<Value>, ArrayError> {
        let storage = self.storage_elements()?;
        if !self.fortran_order || self.ndim() <= 1 {
            return Ok(storage);
        }
        let array = ArrayD::from_shape_vec(IxDyn(&self.shape).f(), storage)?;
        Ok(array.iter().cloned().collect())
    }

    /// The single element of a 0-d or one-element array.
    pub fn scalar(&self) -> Result<Value, ArrayError> {
        if self.len() != 1 {
            return Err(ArrayError::NotScalar(self.len()));
        }
        let mut elements = self.storage_elements()?;
        Ok(elements.remove(0))
    }

    /// Convert to an owned `f64` array in logical (row-major) layout.
    pub fn to_f64(&self) -> Result<ArrayD<f64>, ArrayError> {
        let values = self
            .elements()?
            .iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    ArrayError::InvalidElement(format!("{} is not numeric", v.type_name()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), values)?)
    }
}

// =============================================================================
// Factories
// =============================================================================

/// `numpy.dtype(descr, align, copy)`; `BUILD` carries the byte order.
#[derive(Debug, Default)]
pub struct DTypeFactory;

impl ObjectFactory for DTypeFactory {
    fn construct(&self, class: &ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        let descr = match args.first() {
            Some(Value::String(descr)) => descr.clone(),
            Some(Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            other => {
                return Err(DecodeError::InvalidArgument(format!(
                    "{class} expects a type string, got {}",
                    other.map_or("nothing", Value::type_name)
                )))
            }
        };
        let dtype = DType::parse(&descr)?;
        Ok(Value::Record(
            Record::new(class.clone(), args).with_field("descr", dtype.descr()),
        ))
    }

    fn build(&self, mut record: Record, state: Value) -> Result<Value, DecodeError> {
        let order = state
            .as_slice()
            .and_then(|items| items.get(1))
            .and_then(Value::as_str)
            .and_then(|s| s.chars().next());
        let descr = record
            .get("descr")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::InvalidState("dtype without descr".to_string()))?;
        let mut dtype = DType::parse(descr)?;
        if let Some(symbol) = order {
            let order = match symbol {
                '<' => ByteOrder::Little,
                '>' => ByteOrder::Big,
                '=' => ByteOrder::native(),
                _ => ByteOrder::NotApplicable,
            };
            dtype = DType::new(dtype.kind, dtype.item_size, order);
        }
        record
            .fields_mut()
            .insert("descr".to_string(), Value::String(dtype.descr()));
        Ok(Value::Record(record))
    }
}

/// `numpy.core.multiarray._reconstruct(subtype, shape, dtype)` followed by
/// `ndarray.__setstate__`.
#[derive(Debug, Default)]
pub struct ReconstructFactory;

impl ObjectFactory for ReconstructFactory {
    fn construct(&self, _class: &ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        let subtype = match args.first() {
            Some(Value::Global(class)) => class.clone(),
            _ => ClassName::new("numpy", "ndarray"),
        };
        Ok(Value::Record(Record::new(subtype, args)))
    }

    fn build(&self, _record: Record, state: Value) -> Result<Value, DecodeError> {
        Ok(Value::Array(array_from_state(state)?))
    }
}

/// Interpret `ndarray.__reduce__` state: `([version,] shape, dtype, is_fortran, data)`.
fn array_from_state(state: Value) -> Result<NdArray, ArrayError> {
    let mut items = match state {
        Value::Tuple(items) | Value::List(items) => items,
        other => {
            return Err(ArrayError::InvalidState(format!(
                "expected a tuple, got {}",
                other.type_name()
            )))
        }
    };
    if items.len() == 5 {
        items.remove(0);
    }
    let [shape, dtype, fortran, data]: [Value; 4] = items
        .try_into()
        .map_err(|items: Vec<Value>| {
            ArrayError::InvalidState(format!("expected 4 or 5 state items, got {}", items.len()))
        })?;

    let shape = shape_from_value(&shape)?;
    let dtype = DType::from_value(&dtype)?;
    let fortran_order = fortran.as_bool().unwrap_or(false);

    match data {
        Value::Bytes(bytes) => NdArray::from_raw(dtype, shape, fortran_order, bytes),
        Value::String(text) => NdArray::from_raw(dtype, shape, fortran_order, latin1_bytes(&text)?),
        Value::List(values) | Value::Tuple(values) => {
            NdArray::from_objects(shape, fortran_order, values)
        }
        other => Err(ArrayError::InvalidState(format!(
            "unexpected array data of type {}",
            other.type_name()
        ))),
    }
}

/// `numpy.core.multiarray.scalar(dtype, data)`: a boxed NumPy scalar.
#[derive(Debug, Default)]
pub struct ScalarFactory;

impl ObjectFactory for ScalarFactory {
    fn construct(&self, class: &ClassName, mut args: Vec<Value>) -> Result<Value, DecodeError> {
        if args.len() != 2 {
            return Err(DecodeError::InvalidArgument(format!(
                "{class} expects (dtype, data), got {} arguments",
                args.len()
            )));
        }
        let data = args.pop().unwrap_or(Value::None);
        let dtype = DType::from_value(&args[0])?;
        if dtype.kind == DTypeKind::Object {
            return Ok(data);
        }
        let bytes = match data {
            Value::Bytes(bytes) => bytes,
            Value::String(text) => latin1_bytes(&text)?,
            other => {
                return Err(DecodeError::InvalidArgument(format!(
                    "{class} data must be bytes, got {}",
                    other.type_name()
                )))
            }
        };
        if bytes.len() != dtype.item_size {
            return Err(ArrayError::LengthMismatch {
                expected: dtype.item_size,
                actual: bytes.len(),
            }
            .into());
        }
        Ok(dtype.decode_element(&bytes)?)
    }
}

/// Python 2 byte strings arrive as latin-1 decoded text.
fn latin1_bytes(text: &str) -> Result<Vec<u8>, ArrayError> {
    text.chars()
        .map(|ch| {
            u8::try_from(u32::from(ch)).map_err(|_| {
                ArrayError::InvalidElement(format!("{ch:?} is not a latin-1 byte"))
            })
        })
        .collect()
}

fn shape_from_value(value: &Value) -> Result<Vec<usize>, ArrayError> {
    let dims = match value {
        Value::Int(n) => return dim(*n).map(|n| vec![n]),
        Value::Tuple(items) | Value::List(items) => items,
        other => {
            return Err(ArrayError::InvalidState(format!(
                "shape must be a tuple, got {}",
                other.type_name()
            )))
        }
    };
    dims.iter()
        .map(|d| {
            d.as_i64()
                .ok_or_else(|| ArrayError::InvalidState("non-integer dimension".to_string()))
                .and_then(dim)
        })
        .collect()
}

fn dim(n: i64) -> Result<usize, ArrayError> {
    usize::try_from(n).map_err(|_| ArrayError::InvalidState(format!("negative dimension {n}")))
}

// =============================================================================
// joblib fast path
// =============================================================================

/// Materialize the array described by a joblib `NumpyArrayWrapper` whose
/// state has already been applied, reading the payload from `reader`.
///
/// Non-object payloads follow the wrapper immediately, optionally preceded by
/// one padding-length byte and that many padding bytes when the wrapper was
/// written with `numpy_array_alignment_bytes`. Object payloads are a complete
/// nested pickle stream.
pub fn read_wrapped_array(
    wrapper: &Record,
    reader: &mut dyn Read,
    registry: &Registry,
) -> Result<NdArray, DecodeError> {
    let dtype = DType::from_value(wrapper.get_required("dtype")?)?;
    let shape = shape_from_value(wrapper.get_required("shape")?)?;
    let fortran_order = match wrapper.get_optional_string("order")?.unwrap_or("C") {
        "C" => false,
        "F" => true,
        other => {
            return Err(ArrayError::InvalidState(format!("unknown array order '{other}'")).into())
        }
    };

    if dtype.kind == DTypeKind::Object {
        tracing::debug!(?shape, "reading nested pickle for object array");
        let nested = Unpickler::new(reader, registry).load()?;
        return match nested {
            Value::Array(array) => Ok(array),
            Value::List(values) => Ok(NdArray::from_objects(shape, fortran_order, values)?),
            other => Err(ArrayError::InvalidState(format!(
                "object array payload decoded to {}",
                other.type_name()
            ))
            .into()),
        };
    }

    if wrapper.get_optional("numpy_array_alignment_bytes").is_some() {
        let mut padding_length = [0u8; 1];
        read_exact(reader, &mut padding_length, "array padding length")?;
        let mut padding = vec![0u8; usize::from(padding_length[0])];
        read_exact(reader, &mut padding, "array padding")?;
    }

    let byte_len = byte_len(&shape, dtype.item_size).map_err(|_| {
        DecodeError::IntegerOverflow(format!(
            "array payload of shape {shape:?} with {}-byte elements",
            dtype.item_size
        ))
    })?;
    tracing::debug!(dtype = %dtype.descr(), ?shape, byte_len, "reading wrapped array payload");

    let bytes = read_bounded(reader, byte_len, "array payload")?;
    Ok(NdArray::from_raw(dtype, shape, fortran_order, bytes)?)
}

/// Register NumPy and joblib constructors, including both joblib wrapper
/// generations.
pub(crate) fn register(registry: &mut Registry) {
    registry.register("numpy", "dtype", Factory::specialized(DTypeFactory));
    registry.register("numpy", "ndarray", Factory::specialized(ReconstructFactory));
    for module in MULTIARRAY_MODULES {
        registry.register(module, "_reconstruct", Factory::specialized(ReconstructFactory));
        registry.register(module, "scalar", Factory::specialized(ScalarFactory));
        registry.register(module, "dtype", Factory::specialized(DTypeFactory));
    }
    for module in ARRAY_WRAPPER_MODULES {
        registry.register(module, "NumpyArrayWrapper", Factory::ArrayWrapper);
        registry.register(module, "NDArrayWrapper", Factory::ArrayFile);
    }
}
