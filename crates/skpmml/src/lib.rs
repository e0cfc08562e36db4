//! skpmml: convert pickled scikit-learn pipelines into PMML.
//!
//! The conversion runs in two stages:
//!
//! 1. [`pickle`] decodes the (optionally joblib-compressed) pickle stream into
//!    a [`Value`] tree. A [`Registry`] decides how each referenced class is
//!    reconstructed; NumPy arrays written out-of-band by joblib are read
//!    through a dedicated fast path.
//! 2. [`pipeline`] compiles the decoded `sklearn2pmml.pipeline.PMMLPipeline`
//!    into a [`Pmml`] document, delegating model construction to the
//!    estimator and transformer capabilities in [`sklearn`].
//!
//! # Example
//!
//! ```no_run
//! use skpmml::{convert, PipelineConfig, Registry};
//!
//! let registry = Registry::with_defaults();
//! let pmml = convert("pipeline.pkl.z", &registry, &PipelineConfig::default())?;
//! println!("{}", pmml.to_json_pretty()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
pub mod pickle;
pub mod pipeline;
pub mod pmml;
pub mod schema;
pub mod sklearn;
pub mod testing;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use error::{convert, convert_storage, Error};
pub use pickle::{ClassName, DecodeError, Record, Registry, RegistryError, Storage, Value};
pub use pipeline::{EncodeError, PipelineConfig, PmmlPipeline};
pub use pmml::Pmml;
pub use sklearn::{Estimator, TaskKind, Transformer};
