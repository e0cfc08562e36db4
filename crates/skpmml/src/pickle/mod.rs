//! Pickle decoding.
//!
//! - [`storage`]: byte sources with transparent decompression
//! - [`registry`]: `(module, name)` → constructor map
//! - [`unpickler`]: the stack machine
//! - [`numpy`]: NumPy arrays, dtypes and the joblib array fast path
//! - [`npy`]: `.npy` files referenced by older joblib dumps
//! - [`value`]: the decoded value model
//!
//! # Example
//!
//! ```no_run
//! use skpmml::pickle::{self, Registry, Storage};
//!
//! let registry = Registry::with_defaults();
//! let storage = Storage::open("pipeline.pkl.z")?;
//! let value = pickle::load(&storage, &registry)?;
//! println!("{}", value.type_name());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;

mod builtins;
pub mod npy;
pub mod numpy;
pub mod opcodes;
pub mod registry;
pub mod storage;
pub mod unpickler;
pub mod value;

pub use numpy::{ArrayData, ArrayError, ByteOrder, DType, DTypeKind, NdArray};
pub use registry::{Factory, FactoryCatalog, ObjectFactory, Registry, RegistryError};
pub use storage::{Compression, Storage};
pub use unpickler::{from_reader, from_slice, DecodeError, Unpickler};
pub use value::{ClassName, Dict, FieldError, Record, Value};

/// Decode the pickle held by `storage`.
///
/// Array files named by the stream are looked up next to a file-backed
/// storage.
pub fn load(storage: &Storage, registry: &Registry) -> Result<Value, DecodeError> {
    let reader = storage.object()?;
    let mut unpickler = Unpickler::new(reader, registry);
    if let Some(directory) = storage.path().and_then(Path::parent) {
        unpickler = unpickler.with_directory(directory);
    }
    unpickler.load()
}
