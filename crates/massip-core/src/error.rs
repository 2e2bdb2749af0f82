use thiserror::Error;

use crate::config::ConfigError;
use crate::rows::BatchIoError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Unknown parser: {0}")]
    UnknownParser(String),

    #[error("No plugins selected")]
    EmptySelection,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    BatchIo(#[from] BatchIoError),
}

pub type Result<T> = std::result::Result<T, Error>;
