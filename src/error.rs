//! Standard error type for ocl-blas operations.
//!

use std;
use crate::types::DataType;

pub type Result<T> = std::result::Result<T, Error>;

/// An enum containing the failure modes of the solution pipeline.
///
/// Device-runtime errors are passed through unchanged; storage problems
/// below the "file is corrupt" level never surface here (lookups simply
/// report that no data is available and callers fall back to defaults).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Ocl(#[from] ocl::Error),
    #[error("{0}")]
    OclCore(#[from] ocl::OclCoreError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidValue(String),
    #[error("no usable command queue supplied")]
    NoQueues,
    #[error("device lacks native support for {0:?}")]
    UnsupportedDataType(DataType),
    #[error("out of device resources: {0}")]
    OutOfResources(String),
    #[error("kernel build failed: {0}")]
    Build(String),
    #[error("tuning storage is corrupt: {0}")]
    StorageCorrupt(String),
}

impl Error {
    /// Shorthand used at argument-validation sites.
    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidValue(msg.into())
    }
}

impl From<String> for Error {
    fn from(desc: String) -> Error {
        Error::InvalidValue(desc)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(desc: &'a str) -> Error {
        Error::InvalidValue(desc.into())
    }
}
