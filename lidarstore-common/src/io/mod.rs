use crate::geometry::coordinate_system::CoordinateSystemError;
use std::sync::Arc;
use thiserror::Error;

pub mod chunk_file;
pub mod page_codec;

#[derive(Debug, Error, Clone)]
pub enum PointIoError {
    #[error("I/O Error")]
    Io(#[from] IoError),

    #[error("Invalid points file: {0}")]
    DataFormat(String),

    /// Some aspect of the data exceeds what the file format can store.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Coordinates(#[from] CoordinateSystemError),
}

/// Wrapper around std::io::Error,
/// that allows it to be "cloned" by putting it inside of an Arc.
#[derive(Debug, Clone)]
pub struct IoError(pub Arc<std::io::Error>);

impl IoError {
    pub fn kind(&self) -> std::io::ErrorKind {
        self.0.kind()
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<std::io::Error> for IoError {
    fn from(value: std::io::Error) -> Self {
        Self(Arc::new(value))
    }
}

impl From<std::io::Error> for PointIoError {
    fn from(value: std::io::Error) -> Self {
        PointIoError::Io(value.into())
    }
}
