//! Test utilities.
//!
//! [`PickleBuilder`] emits protocol 2 opcode streams the way Python's pickler
//! lays them out, including NumPy array reductions and joblib array wrappers
//! followed by their raw payloads. [`npy_bytes`] writes the sibling array
//! files that older joblib releases reference by name.

use crate::pickle::opcodes as op;

/// Incremental pickle stream writer.
///
/// Primitive methods append exactly one opcode; composite methods
/// ([`object`](Self::object), [`list`](Self::list), [`dict`](Self::dict), ...)
/// append the opcode sequence Python would produce for that value.
#[derive(Debug, Clone)]
pub struct PickleBuilder {
    bytes: Vec<u8>,
}

impl Default for PickleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PickleBuilder {
    /// Start a protocol 2 stream.
    pub fn new() -> Self {
        Self {
            bytes: vec![op::PROTO, 2],
        }
    }

    /// Start a stream without a `PROTO` header (protocol 0/1 style).
    pub fn headerless() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    // -------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    /// Append bytes verbatim, e.g. an out-of-band array payload.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn none(&mut self) -> &mut Self {
        self.op(op::NONE)
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.op(if value { op::NEWTRUE } else { op::NEWFALSE })
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        if let Ok(small) = u8::try_from(value) {
            self.op(op::BININT1).raw(&[small])
        } else if let Ok(medium) = u16::try_from(value) {
            self.op(op::BININT2).raw(&medium.to_le_bytes())
        } else if let Ok(word) = i32::try_from(value) {
            self.op(op::BININT).raw(&word.to_le_bytes())
        } else {
            let bytes = value.to_le_bytes();
            self.op(op::LONG1).raw(&[bytes.len() as u8]).raw(&bytes)
        }
    }

    pub fn float(&mut self, value: f64) -> &mut Self {
        self.op(op::BINFLOAT).raw(&value.to_be_bytes())
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        let len = value.len() as u32;
        self.op(op::BINUNICODE)
            .raw(&len.to_le_bytes())
            .raw(value.as_bytes())
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        let len = value.len() as u32;
        self.op(op::BINBYTES).raw(&len.to_le_bytes()).raw(value)
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.op(op::GLOBAL)
            .raw(module.as_bytes())
            .raw(b"\n")
            .raw(name.as_bytes())
            .raw(b"\n")
    }

    pub fn mark(&mut self) -> &mut Self {
        self.op(op::MARK)
    }

    pub fn tuple(&mut self) -> &mut Self {
        self.op(op::TUPLE)
    }

    pub fn empty_tuple(&mut self) -> &mut Self {
        self.op(op::EMPTY_TUPLE)
    }

    pub fn empty_list(&mut self) -> &mut Self {
        self.op(op::EMPTY_LIST)
    }

    pub fn append(&mut self) -> &mut Self {
        self.op(op::APPEND)
    }

    pub fn appends(&mut self) -> &mut Self {
        self.op(op::APPENDS)
    }

    pub fn empty_dict(&mut self) -> &mut Self {
        self.op(op::EMPTY_DICT)
    }

    pub fn setitem(&mut self) -> &mut Self {
        self.op(op::SETITEM)
    }

    pub fn setitems(&mut self) -> &mut Self {
        self.op(op::SETITEMS)
    }

    pub fn reduce(&mut self) -> &mut Self {
        self.op(op::REDUCE)
    }

    pub fn newobj(&mut self) -> &mut Self {
        self.op(op::NEWOBJ)
    }

    pub fn build(&mut self) -> &mut Self {
        self.op(op::BUILD)
    }

    pub fn put(&mut self, key: u32) -> &mut Self {
        match u8::try_from(key) {
            Ok(short) => self.op(op::BINPUT).raw(&[short]),
            Err(_) => self.op(op::LONG_BINPUT).raw(&key.to_le_bytes()),
        }
    }

    pub fn get(&mut self, key: u32) -> &mut Self {
        match u8::try_from(key) {
            Ok(short) => self.op(op::BINGET).raw(&[short]),
            Err(_) => self.op(op::LONG_BINGET).raw(&key.to_le_bytes()),
        }
    }

    pub fn memoize(&mut self) -> &mut Self {
        self.op(op::MEMOIZE)
    }

    pub fn stop(&mut self) -> &mut Self {
        self.op(op::STOP)
    }

    // -------------------------------------------------------------------------
    // Composites
    // -------------------------------------------------------------------------

    /// `module.name()` with a `__dict__` state; `fields` writes key/value pairs.
    pub fn object(
        &mut self,
        module: &str,
        name: &str,
        fields: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.global(module, name).empty_tuple().newobj();
        self.dict(fields).build()
    }

    /// A list; `items` writes the elements.
    pub fn list(&mut self, items: impl FnOnce(&mut Self)) -> &mut Self {
        self.empty_list().mark();
        items(self);
        self.appends()
    }

    /// A tuple; `items` writes the elements.
    pub fn tuple_of(&mut self, items: impl FnOnce(&mut Self)) -> &mut Self {
        self.mark();
        items(self);
        self.tuple()
    }

    /// A dict; `entries` writes alternating keys and values.
    pub fn dict(&mut self, entries: impl FnOnce(&mut Self)) -> &mut Self {
        self.empty_dict().mark();
        entries(self);
        self.setitems()
    }

    pub fn strings(&mut self, values: &[&str]) -> &mut Self {
        self.list(|b| {
            for value in values {
                b.string(value);
            }
        })
    }

    /// `numpy.dtype` for a type string such as `<f8`, `|O` or `<U5`.
    pub fn dtype(&mut self, descr: &str) -> &mut Self {
        let (order, type_code) = match descr.chars().next() {
            Some(symbol @ ('<' | '>' | '|' | '=')) => (symbol, &descr[1..]),
            _ => ('|', descr),
        };
        let type_code = if type_code == "O" { "O8" } else { type_code };

        self.global("numpy", "dtype")
            .tuple_of(|b| {
                b.string(type_code).bool(false).bool(true);
            })
            .reduce();
        self.tuple_of(|b| {
            b.int(3)
                .string(&order.to_string())
                .none()
                .none()
                .none()
                .int(-1)
                .int(-1)
                .int(0);
        })
        .build()
    }

    /// `ndarray` pickled through `numpy.core.multiarray._reconstruct`.
    pub fn array(
        &mut self,
        descr: &str,
        shape: &[usize],
        fortran_order: bool,
        data: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.global("numpy.core.multiarray", "_reconstruct")
            .tuple_of(|b| {
                b.global("numpy", "ndarray")
                    .tuple_of(|b| {
                        b.int(0);
                    })
                    .bytes(b"b");
            })
            .reduce();
        self.tuple_of(|b| {
            b.int(1).shape(shape).dtype(descr).bool(fortran_order);
            data(b);
        })
        .build()
    }

    /// Row-major little-endian `float64` array.
    pub fn f64_array(&mut self, values: &[f64], shape: &[usize]) -> &mut Self {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.array("<f8", shape, false, |b| {
            b.bytes(&payload);
        })
    }

    /// Row-major little-endian `int64` array.
    pub fn i64_array(&mut self, values: &[i64], shape: &[usize]) -> &mut Self {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.array("<i8", shape, false, |b| {
            b.bytes(&payload);
        })
    }

    /// 1-D object array of strings, as scikit-learn stores `classes_`.
    pub fn str_array(&mut self, values: &[&str]) -> &mut Self {
        self.array("|O", &[values.len()], false, |b| {
            b.strings(values);
        })
    }

    fn shape(&mut self, shape: &[usize]) -> &mut Self {
        self.tuple_of(|b| {
            for &dim in shape {
                b.int(dim as i64);
            }
        })
    }

    /// joblib `NumpyArrayWrapper` followed by its raw payload.
    ///
    /// With `alignment`, the payload is preceded by a padding-length byte and
    /// padding up to the next multiple of `alignment`, as joblib writes it.
    pub fn wrapped_array(
        &mut self,
        descr: &str,
        shape: &[usize],
        fortran_order: bool,
        payload: &[u8],
        alignment: Option<u8>,
    ) -> &mut Self {
        self.object("joblib.numpy_pickle", "NumpyArrayWrapper", |b| {
            b.string("subclass").global("numpy", "ndarray");
            b.string("shape").shape(shape);
            b.string("order").string(if fortran_order { "F" } else { "C" });
            b.string("dtype").dtype(descr);
            b.string("allow_mmap").bool(false);
            if let Some(alignment) = alignment {
                b.string("numpy_array_alignment_bytes").int(i64::from(alignment));
            }
        });
        if let Some(alignment) = alignment {
            let alignment = usize::from(alignment);
            let padding = alignment - (self.position() + 1) % alignment;
            let padding = if padding == alignment { 0 } else { padding };
            self.raw(&[padding as u8]).raw(&vec![0xff; padding]);
        }
        self.raw(payload)
    }

    /// [`wrapped_array`](Self::wrapped_array) for row-major `float64` values.
    pub fn wrapped_f64_array(&mut self, values: &[f64], shape: &[usize]) -> &mut Self {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.wrapped_array("<f8", shape, false, &payload, None)
    }

    /// joblib < 0.10 `NDArrayWrapper` naming a sibling `.npy` file.
    pub fn array_file(&mut self, filename: &str) -> &mut Self {
        self.object("joblib.numpy_pickle", "NDArrayWrapper", |b| {
            b.string("filename").string(filename);
            b.string("subclass").global("numpy", "ndarray");
            b.string("allow_mmap").bool(true);
        })
    }
}

/// A `.npy` file as `numpy.save` writes it, header padded to 64 bytes.
pub fn npy_bytes(
    major: u8,
    descr: &str,
    shape: &[usize],
    fortran_order: bool,
    payload: &[u8],
) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    let shape = match dims.as_slice() {
        [single] => format!("({single},)"),
        _ => format!("({})", dims.join(", ")),
    };
    let order = if fortran_order { "True" } else { "False" };
    let mut header = format!("{{'descr': '{descr}', 'fortran_order': {order}, 'shape': {shape}, }}");

    let length_width = if major == 1 { 2 } else { 4 };
    let unpadded = 8 + length_width + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut bytes = b"\x93NUMPY".to_vec();
    bytes.extend_from_slice(&[major, 0]);
    if major == 1 {
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    } else {
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
    }
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_encodings() {
        let bytes = PickleBuilder::headerless()
            .int(7)
            .int(300)
            .int(-1)
            .int(1 << 40)
            .to_bytes();
        assert_eq!(&bytes[..2], &[op::BININT1, 7]);
        assert_eq!(&bytes[2..5], &[op::BININT2, 0x2c, 0x01]);
        assert_eq!(&bytes[5..10], &[op::BININT, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(bytes[10], op::LONG1);
        assert_eq!(bytes[11], 8);
    }

    #[test]
    fn aligned_payload_starts_on_boundary() {
        let mut builder = PickleBuilder::new();
        builder.wrapped_array("<f8", &[1], false, &1.0f64.to_le_bytes(), Some(16));
        let bytes = builder.to_bytes();
        let payload_start = bytes.len() - 8;
        assert_eq!(payload_start % 16, 0);
    }

    #[test]
    fn npy_header_is_padded() {
        let bytes = npy_bytes(1, "<f8", &[2, 3], false, &[]);
        assert_eq!(bytes.len() % 64, 0);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }
}
