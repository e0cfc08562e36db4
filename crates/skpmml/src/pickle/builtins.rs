//! Python builtin callables that appear in pickle streams.
//!
//! Containers reconstructed through `REDUCE` (sets, `OrderedDict`, Python 2
//! `bytearray` and `_codecs.encode` round trips) decode to the matching
//! [`Value`] variant instead of a record.

use super::registry::{Factory, ObjectFactory, Registry};
use super::unpickler::DecodeError;
use super::value::{ClassName, Dict, Value};

/// Builtin module names for Python 3 and Python 2 streams.
const BUILTIN_MODULES: [&str; 2] = ["builtins", "__builtin__"];

/// Which container a builtin constructor produces.
#[derive(Debug, Clone, Copy)]
enum Container {
    /// `set` and `frozenset`; decoded as lists in insertion order.
    Set,
    List,
    Tuple,
    Dict,
    ByteArray,
}

#[derive(Debug)]
struct ContainerFactory(Container);

impl ObjectFactory for ContainerFactory {
    fn construct(&self, class: &ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        let source = args.into_iter().next();

        if let Container::ByteArray = self.0 {
            return match source {
                None => Ok(Value::Bytes(Vec::new())),
                Some(Value::Bytes(bytes)) => Ok(Value::Bytes(bytes)),
                Some(Value::String(text)) => latin1(class, &text).map(Value::Bytes),
                Some(other) => Err(invalid(class, &other)),
            };
        }

        let items = match source {
            None => Vec::new(),
            Some(Value::List(items)) | Some(Value::Tuple(items)) => items,
            Some(Value::Dict(dict)) if matches!(self.0, Container::Dict) => {
                return Ok(Value::Dict(dict))
            }
            Some(Value::Dict(dict)) => dict.into_iter().map(|(key, _)| key).collect(),
            Some(other) => return Err(invalid(class, &other)),
        };

        Ok(match self.0 {
            Container::Tuple => Value::Tuple(items),
            Container::Dict => Value::Dict(pairs_to_dict(class, items)?),
            _ => Value::List(items),
        })
    }
}

fn pairs_to_dict(class: &ClassName, items: Vec<Value>) -> Result<Dict, DecodeError> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Tuple(pair) | Value::List(pair) if pair.len() == 2 => {
                let mut pair = pair.into_iter();
                match (pair.next(), pair.next()) {
                    (Some(key), Some(value)) => Ok((key, value)),
                    _ => Err(DecodeError::InvalidArgument(format!("{class} expects pairs"))),
                }
            }
            other => Err(invalid(class, &other)),
        })
        .collect()
}

/// `_codecs.encode(text, encoding)`: Python 2 byte strings re-encoded by
/// protocol 2+ writers.
#[derive(Debug)]
struct CodecsEncode;

impl ObjectFactory for CodecsEncode {
    fn construct(&self, class: &ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        match args.as_slice() {
            [Value::String(text)] => Ok(Value::Bytes(text.as_bytes().to_vec())),
            [Value::String(text), Value::String(encoding)] => {
                match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
                    "latin1" | "latin-1" | "iso-8859-1" => latin1(class, text).map(Value::Bytes),
                    "utf8" | "utf-8" | "ascii" => Ok(Value::Bytes(text.as_bytes().to_vec())),
                    other => Err(DecodeError::InvalidArgument(format!(
                        "{class}: unsupported encoding '{other}'"
                    ))),
                }
            }
            _ => Err(DecodeError::InvalidArgument(format!(
                "{class} expects (str, encoding), got {} arguments",
                args.len()
            ))),
        }
    }
}

fn latin1(class: &ClassName, text: &str) -> Result<Vec<u8>, DecodeError> {
    text.chars()
        .map(|ch| {
            u8::try_from(u32::from(ch)).map_err(|_| {
                DecodeError::InvalidArgument(format!("{class}: {ch:?} is outside latin-1"))
            })
        })
        .collect()
}

fn invalid(class: &ClassName, value: &Value) -> DecodeError {
    DecodeError::InvalidArgument(format!(
        "{class} cannot be built from {}",
        value.type_name()
    ))
}

pub(crate) fn register(registry: &mut Registry) {
    for module in BUILTIN_MODULES {
        for (name, container) in [
            ("set", Container::Set),
            ("frozenset", Container::Set),
            ("list", Container::List),
            ("tuple", Container::Tuple),
            ("dict", Container::Dict),
            ("bytearray", Container::ByteArray),
        ] {
            registry.register(module, name, Factory::specialized(ContainerFactory(container)));
        }
    }
    registry.register(
        "collections",
        "OrderedDict",
        Factory::specialized(ContainerFactory(Container::Dict)),
    );
    registry.register("_codecs", "encode", Factory::specialized(CodecsEncode));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn construct(module: &str, name: &str, args: Vec<Value>) -> Result<Value, DecodeError> {
        let mut registry = Registry::new();
        register(&mut registry);
        let class = ClassName::new(module, name);
        match registry.resolve_class(&class) {
            Factory::Specialized(factory) => factory.construct(&class, args),
            other => panic!("{class} registered as {other:?}"),
        }
    }

    #[test]
    fn sets_decode_to_lists() {
        let value = construct(
            "builtins",
            "set",
            vec![Value::List(vec![Value::Int(1), Value::Int(2)])],
        )
        .unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(construct("__builtin__", "frozenset", vec![]).unwrap(), Value::List(vec![]));
    }

    #[test]
    fn ordered_dict_from_pairs() {
        let pairs = Value::List(vec![Value::Tuple(vec!["a".into(), Value::Int(1)])]);
        let value = construct("collections", "OrderedDict", vec![pairs]).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get_str("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn codecs_encode_latin1() {
        let value = construct(
            "_codecs",
            "encode",
            vec!["\u{00ff}\u{0001}".into(), "latin1".into()],
        )
        .unwrap();
        assert_eq!(value, Value::Bytes(vec![0xff, 0x01]));

        assert!(construct("_codecs", "encode", vec!["\u{0100}".into(), "latin1".into()]).is_err());
    }
}
