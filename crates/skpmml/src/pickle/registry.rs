//! Constructor registry.
//!
//! Maps a `(module, name)` class reference to the [`Factory`] that turns
//! constructor arguments and `BUILD` state into a decoded [`Value`].
//! Unregistered classes fall back to [`Factory::Generic`], so unknown types
//! still decode as plain [`Record`]s.
//!
//! The registry is populated once (compile-time defaults, then optional
//! `sklearn2pmml.properties` resources) and shared read-only afterwards.
//! Decoding takes a `&Registry` explicitly; [`install_global`] and [`global`]
//! provide a write-once process-wide instance for embedders that want one.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use super::builtins;
use super::numpy::{self, DTypeFactory, ReconstructFactory, ScalarFactory};
use super::unpickler::DecodeError;
use super::value::{ClassName, Record, Value};
use crate::sklearn::{self, Estimator, Transformer};

/// Name of the registry configuration resource.
pub const PROPERTIES_FILE: &str = "sklearn2pmml.properties";

/// Catalog id of the generic record factory.
pub const GENERIC_FACTORY_ID: &str = "generic";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while populating a registry from configuration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{source_name}:{line}: key '{key}' is not of the form module.Name")]
    MalformedKey {
        source_name: String,
        line: usize,
        key: String,
    },

    #[error("{source_name}:{line}: unknown factory '{id}' for key '{key}'")]
    UnknownFactory {
        source_name: String,
        line: usize,
        key: String,
        id: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Factories
// =============================================================================

/// Constructor and state handler for a specialized class.
///
/// The defaults reproduce generic behavior: `construct` creates an empty
/// [`Record`] and `build` merges the state into it. Factories that also model
/// a pipeline step expose it through [`estimator`](Self::estimator) or
/// [`transformer`](Self::transformer); the decoder attaches the factory to
/// every record it constructs so those capabilities stay reachable.
pub trait ObjectFactory: Send + Sync {
    /// Create the object for a `REDUCE`/`NEWOBJ`/`INST`/`OBJ` call.
    fn construct(&self, class: &ClassName, args: Vec<Value>) -> Result<Value, DecodeError> {
        Ok(Value::Record(Record::new(class.clone(), args)))
    }

    /// Apply `BUILD` state to a record this factory constructed.
    fn build(&self, mut record: Record, state: Value) -> Result<Value, DecodeError> {
        record.apply_state(state);
        Ok(Value::Record(record))
    }

    /// Estimator capability, if instances of this class are estimators.
    fn estimator(&self) -> Option<&dyn Estimator> {
        None
    }

    /// Transformer capability, if instances of this class are transformers.
    fn transformer(&self) -> Option<&dyn Transformer> {
        None
    }
}

/// Registry entry.
#[derive(Clone)]
pub enum Factory {
    /// Plain attribute record.
    Generic,
    /// Class with its own construction logic or capabilities.
    Specialized(Arc<dyn ObjectFactory>),
    /// joblib array wrapper sentinel; `BUILD` switches to the array fast path.
    ArrayWrapper,
    /// joblib < 0.10 wrapper; `BUILD` loads the `.npy` file it names.
    ArrayFile,
}

impl Factory {
    pub fn specialized<F: ObjectFactory + 'static>(factory: F) -> Self {
        Self::Specialized(Arc::new(factory))
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Specialized(_) => "specialized",
            Self::ArrayWrapper => "array-wrapper",
            Self::ArrayFile => "array-file",
        }
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

static GENERIC: Factory = Factory::Generic;

// =============================================================================
// FactoryCatalog
// =============================================================================

/// Named factories that configuration resources may refer to.
///
/// Embedding applications add their own specialized factories here before
/// loading properties files that mention them.
#[derive(Debug, Clone)]
pub struct FactoryCatalog {
    entries: HashMap<String, Factory>,
}

impl FactoryCatalog {
    /// A catalog holding only the generic factory.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(GENERIC_FACTORY_ID.to_string(), Factory::Generic);
        Self { entries }
    }

    /// The catalog of every built-in factory.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.insert("numpy_dtype", Factory::specialized(DTypeFactory));
        catalog.insert("numpy_reconstruct", Factory::specialized(ReconstructFactory));
        catalog.insert("numpy_scalar", Factory::specialized(ScalarFactory));
        catalog.insert("joblib_array_wrapper", Factory::ArrayWrapper);
        catalog.insert("joblib_array_file", Factory::ArrayFile);
        sklearn::register_catalog(&mut catalog);
        catalog
    }

    pub fn insert(&mut self, id: impl Into<String>, factory: Factory) {
        self.entries.insert(id.into(), factory);
    }

    pub fn get(&self, id: &str) -> Option<&Factory> {
        self.entries.get(id)
    }
}

impl Default for FactoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// `(module, name)` → [`Factory`] map.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<ClassName, Factory>,
}

impl Registry {
    /// An empty registry; every class resolves to [`Factory::Generic`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The compile-time table: Python builtins, NumPy, joblib wrappers and the
    /// built-in scikit-learn steps.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        builtins::register(&mut registry);
        numpy::register(&mut registry);
        sklearn::register(&mut registry);
        registry
    }

    /// Defaults merged with every `sklearn2pmml.properties` found in `dirs`.
    ///
    /// Directories are visited in order; each may hold the file directly or
    /// under `META-INF/`. Later files override earlier keys.
    pub fn discover<P: AsRef<Path>>(
        dirs: &[P],
        catalog: &FactoryCatalog,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::with_defaults();
        for dir in dirs {
            let dir = dir.as_ref();
            for candidate in [dir.join(PROPERTIES_FILE), dir.join("META-INF").join(PROPERTIES_FILE)] {
                if candidate.is_file() {
                    registry.load_file(&candidate, catalog)?;
                }
            }
        }
        Ok(registry)
    }

    /// Register (or replace) the factory for `module.name`.
    pub fn register(&mut self, module: &str, name: &str, factory: Factory) {
        self.entries.insert(ClassName::new(module, name), factory);
    }

    /// The factory for `module.name`, or the generic factory.
    pub fn resolve(&self, module: &str, name: &str) -> &Factory {
        self.resolve_class(&ClassName::new(module, name))
    }

    pub fn resolve_class(&self, class: &ClassName) -> &Factory {
        self.entries.get(class).unwrap_or(&GENERIC)
    }

    /// Whether `module.name` has an explicit entry.
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.entries.contains_key(&ClassName::new(module, name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load one properties file. Returns the number of entries registered.
    pub fn load_file(&mut self, path: &Path, catalog: &FactoryCatalog) -> Result<usize, RegistryError> {
        let text = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.load_properties(&path.display().to_string(), &text, catalog)?;
        tracing::debug!(path = %path.display(), count, "loaded registry properties");
        Ok(count)
    }

    /// Load `module.Name = factory-id` lines.
    ///
    /// Entries are validated before any is registered, so a failing resource
    /// leaves the registry untouched.
    pub fn load_properties(
        &mut self,
        source_name: &str,
        text: &str,
        catalog: &FactoryCatalog,
    ) -> Result<usize, RegistryError> {
        let mut resolved = Vec::new();
        for (line, key, id) in parse_properties(text) {
            let class = ClassName::parse(&key).ok_or_else(|| RegistryError::MalformedKey {
                source_name: source_name.to_string(),
                line,
                key: key.clone(),
            })?;
            let factory = catalog.get(&id).ok_or_else(|| RegistryError::UnknownFactory {
                source_name: source_name.to_string(),
                line,
                key: key.clone(),
                id: id.clone(),
            })?;
            resolved.push((class, factory.clone()));
        }

        let count = resolved.len();
        for (class, factory) in resolved {
            self.entries.insert(class, factory);
        }
        Ok(count)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        f.debug_map()
            .entries(keys.into_iter().map(|(class, factory)| (class.to_string(), factory)))
            .finish()
    }
}

/// Split a Java-style properties document into `(line, key, value)` triples.
///
/// Supports `#`/`!` comments and `=`, `:` or whitespace separators.
fn parse_properties(text: &str) -> Vec<(usize, String, String)> {
    text.lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                return None;
            }
            let split = line
                .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
                .unwrap_or(line.len());
            let key = line[..split].trim_end();
            let mut value = line[split..].trim_start();
            if let Some(rest) = value.strip_prefix(['=', ':']) {
                value = rest.trim_start();
            }
            Some((index + 1, key.to_string(), value.to_string()))
        })
        .collect()
}

// =============================================================================
// Process-wide instance
// =============================================================================

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry.
///
/// Succeeds once; later calls hand the rejected registry back.
pub fn install_global(registry: Registry) -> Result<(), Registry> {
    GLOBAL.set(registry)
}

/// The process-wide registry, initialized to [`Registry::with_defaults`] on
/// first use if nothing was installed.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::with_defaults)
}
