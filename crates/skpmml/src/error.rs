use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pickle::{self, DecodeError, Registry, RegistryError, Storage};
use crate::pipeline::{EncodeError, PipelineConfig, PmmlPipeline};
use crate::pmml::Pmml;

/// Any failure of a file-to-PMML conversion.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode pickle: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to encode PMML: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convert the pickled `PMMLPipeline` at `path` into a PMML document.
pub fn convert(
    path: impl AsRef<Path>,
    registry: &Registry,
    config: &PipelineConfig,
) -> Result<Pmml, Error> {
    let path = path.as_ref();
    let storage = Storage::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    convert_storage(&storage, registry, config)
}

/// Convert a pickled `PMMLPipeline` held by `storage`.
pub fn convert_storage(
    storage: &Storage,
    registry: &Registry,
    config: &PipelineConfig,
) -> Result<Pmml, Error> {
    let value = pickle::load(storage, registry)?;
    let pmml = PmmlPipeline::from_value(&value)?.encode_pmml(config)?;
    Ok(pmml)
}
