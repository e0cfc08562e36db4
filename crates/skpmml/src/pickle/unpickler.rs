//! Pickle stack machine.
//!
//! [`Unpickler`] interprets protocol 0 to 5 opcode streams into a single
//! [`Value`]. Object construction goes through the [`Registry`]; `BUILD` on a
//! joblib array wrapper switches to [`numpy::read_wrapped_array`], which reads
//! the raw payload from the same reader and replaces the wrapper on the stack.
//! `BUILD` on the older file-backed wrapper loads the named `.npy` file from
//! the [directory](Unpickler::with_directory) of the pickle instead.
//!
//! # Memo identity
//!
//! Values are owned, so a memoized container that is filled after `PUT`
//! (`APPEND(S)`, `SETITEM(S)`, `ADDITEMS`, `BUILD`) cannot share storage with
//! its memo entry. Each stack slot remembers the memo keys it was stored under;
//! `GET` reads a live slot directly, and the memo entry is refreshed when the
//! slot leaves the stack. A container that references itself observes the
//! state it had at the time of the `GET`.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

use super::npy;
use super::numpy::{self, ArrayError};
use super::opcodes as op;
use super::registry::{Factory, Registry};
use super::value::{ClassName, Dict, FieldError, Record, Value};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while decoding a pickle stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(&'static str),

    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("truncated stream: {what} needs {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stack underflow in {0}")]
    StackUnderflow(&'static str),

    #[error("{0} without a matching MARK")]
    MissingMark(&'static str),

    #[error("memo key {0} is not defined")]
    MemoMiss(usize),

    #[error("integer overflow: {0}")]
    IntegerOverflow(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("array error: {0}")]
    Array(#[from] ArrayError),

    #[error("{0}")]
    Field(#[from] FieldError),

    #[error("failed to read array file {path}: {source}")]
    ArrayFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read exactly `len` bytes, growing with the data instead of trusting the
/// declared length up front.
pub(crate) fn read_bounded<R: Read + ?Sized>(
    reader: &mut R,
    len: usize,
    what: &'static str,
) -> Result<Vec<u8>, DecodeError> {
    let limit = u64::try_from(len).unwrap_or(u64::MAX);
    let mut buf = Vec::new();
    let read = reader.take(limit).read_to_end(&mut buf)?;
    if read < len {
        return Err(DecodeError::Truncated {
            what,
            expected: len,
            actual: read,
        });
    }
    Ok(buf)
}

/// Fill `buf` completely, reporting short reads as [`DecodeError::Truncated`].
pub(crate) fn read_exact<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), DecodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(DecodeError::Truncated {
                    what,
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Decode one pickle from `reader`.
pub fn from_reader<R: Read>(reader: R, registry: &Registry) -> Result<Value, DecodeError> {
    Unpickler::new(reader, registry).load()
}

/// Decode one pickle from an in-memory buffer.
pub fn from_slice(bytes: &[u8], registry: &Registry) -> Result<Value, DecodeError> {
    from_reader(bytes, registry)
}

// =============================================================================
// Unpickler
// =============================================================================

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    /// Memo keys this slot was stored under.
    memo_keys: Vec<usize>,
    /// Whether the memo entries lag behind `value`.
    dirty: bool,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            memo_keys: Vec::new(),
            dirty: false,
        }
    }
}

/// Pickle virtual machine over a byte reader.
pub struct Unpickler<'r, R> {
    reader: R,
    registry: &'r Registry,
    stack: Vec<Slot>,
    metastack: Vec<Vec<Slot>>,
    memo: HashMap<usize, Value>,
    /// Where array files named by the stream live.
    directory: Option<PathBuf>,
}

impl<'r, R: Read> Unpickler<'r, R> {
    pub fn new(reader: R, registry: &'r Registry) -> Self {
        Self {
            reader,
            registry,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
            directory: None,
        }
    }

    /// Resolve joblib array files against `directory`.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Run until `STOP` and return the top of the stack.
    ///
    /// Bytes after `STOP` are left unread.
    pub fn load(mut self) -> Result<Value, DecodeError> {
        loop {
            let opcode = self.read_u8("opcode")?;
            if opcode == op::STOP {
                let slot = self
                    .stack
                    .pop()
                    .ok_or(DecodeError::StackUnderflow("STOP"))?;
                return Ok(slot.value);
            }
            self.dispatch(opcode)?;
        }
    }

    fn dispatch(&mut self, opcode: u8) -> Result<(), DecodeError> {
        match opcode {
            // Framing and protocol
            op::PROTO => {
                let version = self.read_u8("PROTO")?;
                if version > op::HIGHEST_PROTOCOL {
                    return Err(DecodeError::UnsupportedProtocol(version));
                }
            }
            op::FRAME => {
                self.read_u64("FRAME")?;
            }
            op::READONLY_BUFFER => {}

            // Stack manipulation
            op::MARK => {
                let stack = std::mem::take(&mut self.stack);
                self.metastack.push(stack);
            }
            op::POP => {
                if self.stack.is_empty() {
                    self.pop_mark("POP")?;
                } else {
                    self.pop("POP")?;
                }
            }
            op::POP_MARK => {
                self.pop_mark("POP_MARK")?;
            }
            op::DUP => {
                let value = self.top_mut("DUP")?.value.clone();
                self.push(value);
            }

            // Scalars
            op::NONE => self.push(Value::None),
            op::NEWTRUE => self.push(Value::Bool(true)),
            op::NEWFALSE => self.push(Value::Bool(false)),
            op::INT => {
                let line = self.read_text_line("INT")?;
                let value = match line.as_str() {
                    "00" => Value::Bool(false),
                    "01" => Value::Bool(true),
                    text => Value::Int(parse_int(text)?),
                };
                self.push(value);
            }
            op::LONG => {
                let line = self.read_text_line("LONG")?;
                let value = parse_int(line.trim_end_matches('L'))?;
                self.push(Value::Int(value));
            }
            op::BININT => {
                let value = i32::from_le_bytes(self.read_array("BININT")?);
                self.push(Value::Int(i64::from(value)));
            }
            op::BININT1 => {
                let value = self.read_u8("BININT1")?;
                self.push(Value::Int(i64::from(value)));
            }
            op::BININT2 => {
                let value = u16::from_le_bytes(self.read_array("BININT2")?);
                self.push(Value::Int(i64::from(value)));
            }
            op::LONG1 => {
                let len = usize::from(self.read_u8("LONG1")?);
                let bytes = self.read_bytes(len, "LONG1")?;
                self.push(Value::Int(decode_long(&bytes)?));
            }
            op::LONG4 => {
                let len = self.read_len_i32("LONG4")?;
                let bytes = self.read_bytes(len, "LONG4")?;
                self.push(Value::Int(decode_long(&bytes)?));
            }
            op::FLOAT => {
                let line = self.read_text_line("FLOAT")?;
                let value = line.trim().parse::<f64>().map_err(|_| {
                    DecodeError::InvalidArgument(format!("FLOAT: '{line}' is not a float"))
                })?;
                self.push(Value::Float(value));
            }
            op::BINFLOAT => {
                let value = f64::from_be_bytes(self.read_array("BINFLOAT")?);
                self.push(Value::Float(value));
            }

            // Strings and bytes
            op::STRING => {
                let line = self.read_line("STRING")?;
                let bytes = unescape_string(&line)?;
                self.push(Value::String(latin1_string(&bytes)));
            }
            op::BINSTRING => {
                let len = self.read_len_i32("BINSTRING")?;
                let bytes = self.read_bytes(len, "BINSTRING")?;
                self.push(Value::String(latin1_string(&bytes)));
            }
            op::SHORT_BINSTRING => {
                let len = usize::from(self.read_u8("SHORT_BINSTRING")?);
                let bytes = self.read_bytes(len, "SHORT_BINSTRING")?;
                self.push(Value::String(latin1_string(&bytes)));
            }
            op::UNICODE => {
                let line = self.read_line("UNICODE")?;
                self.push(Value::String(raw_unicode_unescape(&line)?));
            }
            op::SHORT_BINUNICODE => {
                let len = usize::from(self.read_u8("SHORT_BINUNICODE")?);
                let text = self.read_utf8(len, "SHORT_BINUNICODE")?;
                self.push(Value::String(text));
            }
            op::BINUNICODE => {
                let len = self.read_len_u32("BINUNICODE")?;
                let text = self.read_utf8(len, "BINUNICODE")?;
                self.push(Value::String(text));
            }
            op::BINUNICODE8 => {
                let len = self.read_len_u64("BINUNICODE8")?;
                let text = self.read_utf8(len, "BINUNICODE8")?;
                self.push(Value::String(text));
            }
            op::SHORT_BINBYTES => {
                let len = usize::from(self.read_u8("SHORT_BINBYTES")?);
                let bytes = self.read_bytes(len, "SHORT_BINBYTES")?;
                self.push(Value::Bytes(bytes));
            }
            op::BINBYTES => {
                let len = self.read_len_u32("BINBYTES")?;
                let bytes = self.read_bytes(len, "BINBYTES")?;
                self.push(Value::Bytes(bytes));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
                let len = self.read_len_u64("BINBYTES8")?;
                let bytes = self.read_bytes(len, "BINBYTES8")?;
                self.push(Value::Bytes(bytes));
            }

            // Collections
            op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let count = usize::from(opcode - op::TUPLE1 + 1);
                if self.stack.len() < count {
                    return Err(DecodeError::StackUnderflow("TUPLEn"));
                }
                let slots = self.stack.split_off(self.stack.len() - count);
                let items = slots.into_iter().map(|slot| self.release(slot)).collect();
                self.push(Value::Tuple(items));
            }
            op::TUPLE => {
                let items = self.pop_mark("TUPLE")?;
                self.push(Value::Tuple(items));
            }
            op::EMPTY_LIST => self.push(Value::List(Vec::new())),
            op::LIST => {
                let items = self.pop_mark("LIST")?;
                self.push(Value::List(items));
            }
            op::EMPTY_DICT => self.push(Value::Dict(Dict::new())),
            op::DICT => {
                let items = self.pop_mark("DICT")?;
                let dict = pairs(items, "DICT")?.collect();
                self.push(Value::Dict(dict));
            }
            op::EMPTY_SET => self.push(Value::List(Vec::new())),
            op::FROZENSET => {
                let items = self.pop_mark("FROZENSET")?;
                self.push(Value::List(items));
            }
            op::APPEND => {
                let item = self.pop("APPEND")?;
                self.extend_top(vec![item], "APPEND")?;
            }
            op::APPENDS => {
                let items = self.pop_mark("APPENDS")?;
                self.extend_top(items, "APPENDS")?;
            }
            op::ADDITEMS => {
                let items = self.pop_mark("ADDITEMS")?;
                self.extend_top(items, "ADDITEMS")?;
            }
            op::SETITEM => {
                let value = self.pop("SETITEM")?;
                let key = self.pop("SETITEM")?;
                self.set_items_top(vec![key, value], "SETITEM")?;
            }
            op::SETITEMS => {
                let items = self.pop_mark("SETITEMS")?;
                self.set_items_top(items, "SETITEMS")?;
            }

            // Memo
            op::PUT => {
                let key = self.read_decimal("PUT")?;
                self.memoize(key, "PUT")?;
            }
            op::BINPUT => {
                let key = usize::from(self.read_u8("BINPUT")?);
                self.memoize(key, "BINPUT")?;
            }
            op::LONG_BINPUT => {
                let key = self.read_len_u32("LONG_BINPUT")?;
                self.memoize(key, "LONG_BINPUT")?;
            }
            op::MEMOIZE => {
                let key = self.memo.len();
                self.memoize(key, "MEMOIZE")?;
            }
            op::GET => {
                let key = self.read_decimal("GET")?;
                self.push_memo(key)?;
            }
            op::BINGET => {
                let key = usize::from(self.read_u8("BINGET")?);
                self.push_memo(key)?;
            }
            op::LONG_BINGET => {
                let key = self.read_len_u32("LONG_BINGET")?;
                self.push_memo(key)?;
            }

            // Classes and construction
            op::GLOBAL => {
                let module = self.read_text_line("GLOBAL")?;
                let name = self.read_text_line("GLOBAL")?;
                self.push(Value::Global(ClassName::new(module, name)));
            }
            op::STACK_GLOBAL => {
                let name = self.pop("STACK_GLOBAL")?;
                let module = self.pop("STACK_GLOBAL")?;
                match (module, name) {
                    (Value::String(module), Value::String(name)) => {
                        self.push(Value::Global(ClassName::new(module, name)));
                    }
                    (module, name) => {
                        return Err(DecodeError::InvalidArgument(format!(
                            "STACK_GLOBAL expects two strings, got {} and {}",
                            module.type_name(),
                            name.type_name()
                        )))
                    }
                }
            }
            op::REDUCE => {
                let args = self.pop("REDUCE")?;
                let callable = self.pop("REDUCE")?;
                let class = expect_class(callable, "REDUCE")?;
                let value = self.instantiate(class, expect_args(args, "REDUCE")?)?;
                self.push(value);
            }
            op::NEWOBJ => {
                let args = self.pop("NEWOBJ")?;
                let cls = self.pop("NEWOBJ")?;
                let class = expect_class(cls, "NEWOBJ")?;
                let value = self.instantiate(class, expect_args(args, "NEWOBJ")?)?;
                self.push(value);
            }
            op::NEWOBJ_EX => {
                let kwargs = self.pop("NEWOBJ_EX")?;
                let args = self.pop("NEWOBJ_EX")?;
                let cls = self.pop("NEWOBJ_EX")?;
                let class = expect_class(cls, "NEWOBJ_EX")?;
                let mut args = expect_args(args, "NEWOBJ_EX")?;
                match kwargs {
                    Value::Dict(kwargs) if kwargs.is_empty() => {}
                    Value::Dict(kwargs) => args.push(Value::Dict(kwargs)),
                    other => {
                        return Err(DecodeError::InvalidArgument(format!(
                            "NEWOBJ_EX kwargs must be a dict, got {}",
                            other.type_name()
                        )))
                    }
                }
                let value = self.instantiate(class, args)?;
                self.push(value);
            }
            op::OBJ => {
                let mut items = self.pop_mark("OBJ")?;
                if items.is_empty() {
                    return Err(DecodeError::StackUnderflow("OBJ"));
                }
                let class = expect_class(items.remove(0), "OBJ")?;
                let value = self.instantiate(class, items)?;
                self.push(value);
            }
            op::INST => {
                let module = self.read_text_line("INST")?;
                let name = self.read_text_line("INST")?;
                let args = self.pop_mark("INST")?;
                let value = self.instantiate(ClassName::new(module, name), args)?;
                self.push(value);
            }
            op::BUILD => {
                let state = self.pop("BUILD")?;
                let target = std::mem::replace(&mut self.top_mut("BUILD")?.value, Value::None);
                let built = self.build(target, state)?;
                let slot = self.top_mut("BUILD")?;
                slot.value = built;
                slot.dirty |= !slot.memo_keys.is_empty();
            }

            other => {
                return Err(match op::unsupported_name(other) {
                    Some(name) => DecodeError::UnsupportedOpcode(name),
                    None => DecodeError::UnknownOpcode(other),
                })
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    fn instantiate(&mut self, class: ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        if matches!(class.module.as_str(), "copyreg" | "copy_reg") {
            match class.name.as_str() {
                "_reconstructor" => return self.reconstruct(args),
                "__newobj__" => {
                    let mut args = args.into_iter();
                    let inner = expect_class(args.next().unwrap_or(Value::None), "__newobj__")?;
                    return self.instantiate(inner, args.collect());
                }
                _ => {}
            }
        }

        match self.registry.resolve_class(&class) {
            Factory::Generic | Factory::ArrayWrapper | Factory::ArrayFile => {
                Ok(Value::Record(Record::new(class, args)))
            }
            Factory::Specialized(factory) => match factory.construct(&class, args)? {
                Value::Record(mut record) if record.behavior().is_none() => {
                    record.set_behavior(factory.clone());
                    Ok(Value::Record(record))
                }
                other => Ok(other),
            },
        }
    }

    /// `copyreg._reconstructor(cls, base, state)`.
    fn reconstruct(&mut self, args: Vec<Value>) -> Result<Value, DecodeError> {
        let mut args = args.into_iter();
        let class = expect_class(args.next().unwrap_or(Value::None), "_reconstructor")?;
        let _base = args.next();
        let inner_args = match args.next() {
            None | Some(Value::None) => Vec::new(),
            Some(state) => vec![state],
        };
        self.instantiate(class, inner_args)
    }

    fn build(&mut self, target: Value, state: Value) -> Result<Value, DecodeError> {
        match target {
            Value::Record(mut record) => {
                let factory = self.registry.resolve_class(record.class());
                if let Factory::ArrayWrapper = factory {
                    record.apply_state(state);
                    let array = numpy::read_wrapped_array(&record, &mut self.reader, self.registry)?;
                    return Ok(Value::Array(array));
                }
                if let Factory::ArrayFile = factory {
                    record.apply_state(state);
                    let array =
                        npy::read_array_file(&record, self.directory.as_deref(), self.registry)?;
                    return Ok(Value::Array(array));
                }
                if let Some(behavior) = record.behavior().cloned() {
                    return behavior.build(record, state);
                }
                match factory {
                    Factory::Specialized(factory) => factory.build(record, state),
                    _ => {
                        record.apply_state(state);
                        Ok(Value::Record(record))
                    }
                }
            }
            Value::Dict(mut dict) => match state {
                Value::Dict(extra) => {
                    for (key, value) in extra {
                        dict.insert(key, value);
                    }
                    Ok(Value::Dict(dict))
                }
                Value::None => Ok(Value::Dict(dict)),
                other => Err(DecodeError::InvalidState(format!(
                    "BUILD on dict with {} state",
                    other.type_name()
                ))),
            },
            other => Err(DecodeError::InvalidState(format!(
                "BUILD applied to {}",
                other.type_name()
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // In-place mutation
    // -------------------------------------------------------------------------

    fn extend_top(&mut self, items: Vec<Value>, opcode: &'static str) -> Result<(), DecodeError> {
        let slot = self.top_mut(opcode)?;
        match &mut slot.value {
            Value::List(list) => list.extend(items),
            other => {
                return Err(DecodeError::InvalidState(format!(
                    "{opcode} applied to {}",
                    other.type_name()
                )))
            }
        }
        slot.dirty |= !slot.memo_keys.is_empty();
        Ok(())
    }

    fn set_items_top(&mut self, items: Vec<Value>, opcode: &'static str) -> Result<(), DecodeError> {
        let entries = pairs(items, opcode)?;
        let slot = self.top_mut(opcode)?;
        match &mut slot.value {
            Value::Dict(dict) => {
                for (key, value) in entries {
                    dict.insert(key, value);
                }
            }
            // dict subclasses (defaultdict and friends) decode as records
            Value::Record(record) => {
                for (key, value) in entries {
                    let name = match key {
                        Value::String(name) => name,
                        other => other.to_pmml_string(),
                    };
                    record.fields_mut().insert(name, value);
                }
            }
            other => {
                return Err(DecodeError::InvalidState(format!(
                    "{opcode} applied to {}",
                    other.type_name()
                )))
            }
        }
        slot.dirty |= !slot.memo_keys.is_empty();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stack and memo
    // -------------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(Slot::new(value));
    }

    fn top_mut(&mut self, opcode: &'static str) -> Result<&mut Slot, DecodeError> {
        self.stack
            .last_mut()
            .ok_or(DecodeError::StackUnderflow(opcode))
    }

    fn pop(&mut self, opcode: &'static str) -> Result<Value, DecodeError> {
        let slot = self
            .stack
            .pop()
            .ok_or(DecodeError::StackUnderflow(opcode))?;
        Ok(self.release(slot))
    }

    /// Pop everything above the topmost mark.
    fn pop_mark(&mut self, opcode: &'static str) -> Result<Vec<Value>, DecodeError> {
        let below = self
            .metastack
            .pop()
            .ok_or(DecodeError::MissingMark(opcode))?;
        let slots = std::mem::replace(&mut self.stack, below);
        Ok(slots.into_iter().map(|slot| self.release(slot)).collect())
    }

    /// Take a slot's value off the stack, refreshing its memo entries.
    fn release(&mut self, slot: Slot) -> Value {
        if slot.dirty {
            for key in &slot.memo_keys {
                self.memo.insert(*key, slot.value.clone());
            }
        }
        slot.value
    }

    fn memoize(&mut self, key: usize, opcode: &'static str) -> Result<(), DecodeError> {
        for slot in self.stack.iter_mut().chain(self.metastack.iter_mut().flatten()) {
            slot.memo_keys.retain(|k| *k != key);
        }
        let slot = self.top_mut(opcode)?;
        slot.memo_keys.push(key);
        slot.dirty = true;
        // Reserve the key so MEMOIZE numbering stays in step.
        self.memo.insert(key, Value::None);
        Ok(())
    }

    fn push_memo(&mut self, key: usize) -> Result<(), DecodeError> {
        let live = self
            .stack
            .iter()
            .rev()
            .chain(self.metastack.iter().rev().flat_map(|slots| slots.iter().rev()))
            .find(|slot| slot.dirty && slot.memo_keys.contains(&key));
        let value = match live {
            Some(slot) => slot.value.clone(),
            None => self
                .memo
                .get(&key)
                .cloned()
                .ok_or(DecodeError::MemoMiss(key))?,
        };
        self.push(value);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        read_exact(&mut self.reader, &mut buf, what)?;
        Ok(buf)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>(what)?[0])
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array(what)?))
    }

    fn read_len_i32(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let len = i32::from_le_bytes(self.read_array(what)?);
        usize::try_from(len)
            .map_err(|_| DecodeError::InvalidArgument(format!("{what}: negative length {len}")))
    }

    fn read_len_u32(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let len = u32::from_le_bytes(self.read_array(what)?);
        usize::try_from(len).map_err(|_| DecodeError::IntegerOverflow(format!("{what}: {len}")))
    }

    fn read_len_u64(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let len = self.read_u64(what)?;
        usize::try_from(len).map_err(|_| DecodeError::IntegerOverflow(format!("{what}: {len}")))
    }

    fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        read_bounded(&mut self.reader, len, what)
    }

    fn read_utf8(&mut self, len: usize, what: &'static str) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(len, what)?;
        String::from_utf8(bytes)
            .map_err(|e| DecodeError::InvalidArgument(format!("{what}: invalid UTF-8: {e}")))
    }

    /// Read up to and excluding the next newline.
    fn read_line(&mut self, what: &'static str) -> Result<Vec<u8>, DecodeError> {
        let mut line = Vec::new();
        loop {
            let byte = match self.read_u8(what) {
                Ok(byte) => byte,
                Err(DecodeError::Truncated { .. }) => {
                    return Err(DecodeError::Truncated {
                        what,
                        expected: line.len() + 1,
                        actual: line.len(),
                    })
                }
                Err(e) => return Err(e),
            };
            if byte == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            line.push(byte);
        }
    }

    fn read_text_line(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let line = self.read_line(what)?;
        String::from_utf8(line)
            .map_err(|e| DecodeError::InvalidArgument(format!("{what}: invalid UTF-8: {e}")))
    }

    fn read_decimal(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let line = self.read_text_line(what)?;
        line.trim()
            .parse()
            .map_err(|_| DecodeError::InvalidArgument(format!("{what}: '{line}' is not a memo key")))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn expect_class(value: Value, opcode: &'static str) -> Result<ClassName, DecodeError> {
    match value {
        Value::Global(class) => Ok(class),
        other => Err(DecodeError::InvalidArgument(format!(
            "{opcode} expects a class reference, got {}",
            other.type_name()
        ))),
    }
}

fn expect_args(value: Value, opcode: &'static str) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Tuple(args) | Value::List(args) => Ok(args),
        Value::None => Ok(Vec::new()),
        other => Err(DecodeError::InvalidArgument(format!(
            "{opcode} expects an argument tuple, got {}",
            other.type_name()
        ))),
    }
}

fn pairs(
    items: Vec<Value>,
    opcode: &'static str,
) -> Result<impl Iterator<Item = (Value, Value)>, DecodeError> {
    if items.len() % 2 != 0 {
        return Err(DecodeError::InvalidArgument(format!(
            "{opcode} expects key/value pairs, got {} items",
            items.len()
        )));
    }
    let mut items = items.into_iter();
    Ok(std::iter::from_fn(move || Some((items.next()?, items.next()?))))
}

fn parse_int(text: &str) -> Result<i64, DecodeError> {
    let text = text.trim();
    text.parse::<i64>().map_err(|_| {
        let digits = text.strip_prefix('-').unwrap_or(text);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            DecodeError::IntegerOverflow(text.to_string())
        } else {
            DecodeError::InvalidArgument(format!("'{text}' is not an integer"))
        }
    })
}

/// Little-endian two's complement integer of arbitrary width.
fn decode_long(bytes: &[u8]) -> Result<i64, DecodeError> {
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let negative = last & 0x80 != 0;
    let fill = if negative { 0xff } else { 0x00 };

    if bytes.len() > 8 {
        let (low, high) = bytes.split_at(8);
        let sign_bit = low[7] & 0x80 != 0;
        if high.iter().any(|&b| b != fill) || sign_bit != negative {
            return Err(DecodeError::IntegerOverflow(format!(
                "{}-byte long",
                bytes.len()
            )));
        }
        return Ok(i64::from_le_bytes(low.try_into().unwrap_or([fill; 8])));
    }

    let mut buf = [fill; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Body of a protocol 0 `STRING`: a quoted Python literal with escapes.
fn unescape_string(line: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let invalid = || {
        DecodeError::InvalidArgument(format!(
            "STRING: malformed literal {}",
            String::from_utf8_lossy(line)
        ))
    };
    let body = match line {
        [b'\'', body @ .., b'\''] | [b'"', body @ .., b'"'] => body,
        _ => return Err(invalid()),
    };

    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        let escaped = bytes.next().ok_or_else(invalid)?;
        match escaped {
            b'\\' | b'\'' | b'"' => out.push(escaped),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hi = bytes.next().ok_or_else(invalid)?;
                let lo = bytes.next().ok_or_else(invalid)?;
                let hex = [hi, lo];
                let text = std::str::from_utf8(&hex).map_err(|_| invalid())?;
                out.push(u8::from_str_radix(text, 16).map_err(|_| invalid())?);
            }
            b'0'..=b'7' => {
                let mut value = u32::from(escaped - b'0');
                for _ in 0..2 {
                    match bytes.peek() {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            bytes.next();
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Body of a protocol 0 `UNICODE`: latin-1 text with `\uXXXX`/`\UXXXXXXXX`.
fn raw_unicode_unescape(line: &[u8]) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let width = match (line[i], line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (byte, _) => {
                out.push(char::from(byte));
                i += 1;
                continue;
            }
        };
        let digits = line
            .get(i + 2..i + 2 + width)
            .and_then(|d| std::str::from_utf8(d).ok())
            .ok_or_else(|| DecodeError::InvalidArgument("UNICODE: truncated escape".to_string()))?;
        let ch = u32::from_str_radix(digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| {
                DecodeError::InvalidArgument(format!("UNICODE: invalid escape \\u{digits}"))
            })?;
        out.push(ch);
        i += 2 + width;
    }
    Ok(out)
}
