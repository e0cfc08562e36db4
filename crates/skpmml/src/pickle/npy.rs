//! Standalone `.npy` array files.
//!
//! joblib releases before 0.10 dumped every array as an `NDArrayWrapper`
//! whose state names a sibling file written by `numpy.save`; the pickle keeps
//! only the file name. [`read_array_file`] resolves that name against the
//! directory of the pickle file and decodes it with [`read_npy`].

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::numpy::{self, ArrayError, DType, DTypeKind, NdArray};
use super::registry::Registry;
use super::unpickler::{read_bounded, read_exact, DecodeError, Unpickler};
use super::value::{Record, Value};

/// Leading bytes of every `.npy` file.
pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Parsed `.npy` header dictionary.
#[derive(Debug, Clone, PartialEq)]
struct NpyHeader {
    dtype: DType,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl NpyHeader {
    /// Parse the Python dict literal, e.g.
    /// `{'descr': '<f8', 'fortran_order': False, 'shape': (2, 3), }`.
    fn parse(text: &str) -> Result<Self, ArrayError> {
        let descr = header_entry(text, "descr")?;
        let descr = descr
            .strip_prefix('\'')
            .and_then(|rest| rest.split_once('\''))
            .map(|(descr, _)| descr)
            .ok_or_else(|| invalid_header(text, "descr"))?;

        let fortran_order = match header_entry(text, "fortran_order")? {
            rest if rest.starts_with("True") => true,
            rest if rest.starts_with("False") => false,
            _ => return Err(invalid_header(text, "fortran_order")),
        };

        let shape = header_entry(text, "shape")?
            .strip_prefix('(')
            .and_then(|rest| rest.split_once(')'))
            .map(|(dims, _)| dims)
            .ok_or_else(|| invalid_header(text, "shape"))?;
        let shape = shape
            .split(',')
            .map(str::trim)
            .filter(|dim| !dim.is_empty())
            .map(|dim| dim.trim_end_matches('L').parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid_header(text, "shape"))?;

        Ok(Self {
            dtype: DType::parse(descr)?,
            fortran_order,
            shape,
        })
    }
}

/// The text following `'key':`.
fn header_entry<'h>(text: &'h str, key: &str) -> Result<&'h str, ArrayError> {
    let pattern = format!("'{key}':");
    text.find(&pattern)
        .map(|start| text[start + pattern.len()..].trim_start())
        .ok_or_else(|| ArrayError::InvalidState(format!("npy header has no '{key}': {text}")))
}

fn invalid_header(text: &str, key: &str) -> ArrayError {
    ArrayError::InvalidState(format!("npy header has a malformed '{key}': {text}"))
}

/// Decode one array in `.npy` format.
///
/// Versions 1.0 (16-bit header length) and 2.0/3.0 (32-bit) are accepted.
/// Object arrays carry a nested pickle after the header.
pub fn read_npy(reader: &mut dyn Read, registry: &Registry) -> Result<NdArray, DecodeError> {
    let mut preamble = [0u8; 8];
    read_exact(reader, &mut preamble, "npy preamble")?;
    if !preamble.starts_with(NPY_MAGIC) {
        return Err(ArrayError::InvalidState("missing npy magic".to_string()).into());
    }

    let (major, minor) = (preamble[6], preamble[7]);
    let header_len = match major {
        1 => {
            let mut len = [0u8; 2];
            read_exact(reader, &mut len, "npy header length")?;
            usize::from(u16::from_le_bytes(len))
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            read_exact(reader, &mut len, "npy header length")?;
            let len = u32::from_le_bytes(len);
            usize::try_from(len)
                .map_err(|_| DecodeError::IntegerOverflow(format!("npy header length: {len}")))?
        }
        _ => {
            return Err(ArrayError::InvalidState(format!(
                "unsupported npy version {major}.{minor}"
            ))
            .into())
        }
    };

    let header = read_bounded(reader, header_len, "npy header")?;
    let header = String::from_utf8(header)
        .map_err(|e| DecodeError::InvalidArgument(format!("npy header: invalid UTF-8: {e}")))?;
    let NpyHeader {
        dtype,
        fortran_order,
        shape,
    } = NpyHeader::parse(&header)?;

    if dtype.kind == DTypeKind::Object {
        tracing::debug!(?shape, "reading nested pickle for npy object array");
        return match Unpickler::new(reader, registry).load()? {
            Value::Array(array) => Ok(array),
            Value::List(values) => Ok(NdArray::from_objects(shape, fortran_order, values)?),
            other => Err(ArrayError::InvalidState(format!(
                "npy object payload decoded to {}",
                other.type_name()
            ))
            .into()),
        };
    }

    let byte_len = numpy::byte_len(&shape, dtype.item_size).map_err(|_| {
        DecodeError::IntegerOverflow(format!(
            "npy payload of shape {shape:?} with {}-byte elements",
            dtype.item_size
        ))
    })?;
    let bytes = read_bounded(reader, byte_len, "npy payload")?;
    Ok(NdArray::from_raw(dtype, shape, fortran_order, bytes)?)
}

/// Materialize the array behind a joblib `NDArrayWrapper` whose state has
/// already been applied.
///
/// `filename` must be a bare file name; it is looked up in `directory`, the
/// directory holding the pickle file.
pub fn read_array_file(
    wrapper: &Record,
    directory: Option<&Path>,
    registry: &Registry,
) -> Result<NdArray, DecodeError> {
    let filename = wrapper.get_string("filename")?;
    let name = Path::new(filename);
    if name.file_name() != Some(name.as_os_str()) {
        return Err(DecodeError::InvalidState(format!(
            "array file name '{filename}' is not a plain file name"
        )));
    }
    let directory = directory.ok_or_else(|| {
        DecodeError::InvalidState(format!(
            "array file '{filename}' can only be resolved from a file-backed storage"
        ))
    })?;

    let path = directory.join(name);
    tracing::debug!(path = %path.display(), "reading array file");
    let file = File::open(&path).map_err(|source| DecodeError::ArrayFile {
        path: path.clone(),
        source,
    })?;
    read_npy(&mut BufReader::new(file), registry)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testing::npy_bytes;

    #[test]
    fn header_dict_literal() {
        let header =
            NpyHeader::parse("{'descr': '<i8', 'fortran_order': True, 'shape': (2, 3), }").unwrap();
        assert_eq!(header.dtype, DType::int64());
        assert!(header.fortran_order);
        assert_eq!(header.shape, vec![2, 3]);

        let scalar = NpyHeader::parse("{'descr': '|b1', 'fortran_order': False, 'shape': (), }").unwrap();
        assert!(scalar.shape.is_empty());

        let vector = NpyHeader::parse("{'descr': '<f8', 'fortran_order': False, 'shape': (4,), }").unwrap();
        assert_eq!(vector.shape, vec![4]);
    }

    #[rstest]
    #[case("{'fortran_order': False, 'shape': (2,), }")]
    #[case("{'descr': [('a', '<f8')], 'fortran_order': False, 'shape': (2,), }")]
    #[case("{'descr': '<f8', 'fortran_order': 0, 'shape': (2,), }")]
    #[case("{'descr': '<f8', 'fortran_order': False, 'shape': (-1,), }")]
    fn header_rejects_malformed_entries(#[case] text: &str) {
        assert!(matches!(
            NpyHeader::parse(text),
            Err(ArrayError::InvalidState(_))
        ));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn reads_version_1_and_2(#[case] major: u8) {
        let payload: Vec<u8> = [1.0f64, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let bytes = npy_bytes(major, "<f8", &[3], false, &payload);
        let array = read_npy(&mut bytes.as_slice(), &Registry::new()).unwrap();
        assert_eq!(array.shape, vec![3]);
        assert_eq!(
            array.elements().unwrap(),
            vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]
        );
    }

    #[test]
    fn short_payload_is_truncated() {
        let bytes = npy_bytes(1, "<f8", &[2], false, &[0; 12]);
        let err = read_npy(&mut bytes.as_slice(), &Registry::new()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                what: "npy payload",
                expected: 16,
                actual: 12
            }
        ));
    }

    #[test]
    fn bad_magic_and_version() {
        let err = read_npy(&mut b"\x80\x02NUMPY\x01\x00".as_slice(), &Registry::new()).unwrap_err();
        assert!(matches!(err, DecodeError::Array(ArrayError::InvalidState(_))));

        let mut bytes = npy_bytes(1, "<f8", &[0], false, &[]);
        bytes[6] = 9;
        let err = read_npy(&mut bytes.as_slice(), &Registry::new()).unwrap_err();
        assert!(err.to_string().contains("version 9.0"), "{err}");
    }

    #[rstest]
    #[case("../outside.npy")]
    #[case("/tmp/absolute.npy")]
    #[case("nested/array.npy")]
    fn array_file_name_must_be_bare(#[case] filename: &str) {
        let wrapper = Record::new(
            crate::pickle::ClassName::new("joblib.numpy_pickle", "NDArrayWrapper"),
            vec![],
        )
        .with_field("filename", filename);
        let dir = tempfile::tempdir().unwrap();
        let err = read_array_file(&wrapper, Some(dir.path()), &Registry::new()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidState(_)), "{err}");
    }
}
