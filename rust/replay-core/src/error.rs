// rust/replay-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Shape mismatch: {message}")]
    Shape {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ReplayError>;

// Convenience constructors
impl ReplayError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }
}

/// Failure to decode one source file.
///
/// Lanes never surface these mid-pass: the part is replaced by zeros and the
/// error is logged. Only [`DecodeError::is_schema_mismatch`] failures seen
/// while a pass is being constructed become a [`ReplayError::Config`].
#[derive(Error, Debug)]
pub enum DecodeError {

    #[error("failed to open '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error in '{path}'")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("arrow error in '{path}'")]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow_schema::ArrowError,
    },

    #[error("field '{field}' is missing from '{path}'")]
    MissingField {
        path: PathBuf,
        field: String,
    },

    #[error("malformed source '{path}': {message}")]
    Malformed {
        path: PathBuf,
        message: String,
    },
}

impl DecodeError {

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parquet(path: impl Into<PathBuf>, source: parquet::errors::ParquetError) -> Self {
        Self::Parquet {
            path: path.into(),
            source,
        }
    }

    pub fn arrow(path: impl Into<PathBuf>, source: arrow_schema::ArrowError) -> Self {
        Self::Arrow {
            path: path.into(),
            source,
        }
    }

    pub fn missing_field(path: impl Into<PathBuf>, field: impl Into<String>) -> Self {
        Self::MissingField {
            path: path.into(),
            field: field.into(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the source is readable but does not carry a requested field.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::MissingField { .. })
    }
}

impl From<DecodeError> for ReplayError {
    fn from(err: DecodeError) -> Self {
        if err.is_schema_mismatch() {
            let message = format!("requested field is absent from source schema: {err}");
            ReplayError::config_with_source(message, err)
        } else {
            ReplayError::Dataset {
                name: "source".to_string(),
                message: err.to_string(),
            }
        }
    }
}
