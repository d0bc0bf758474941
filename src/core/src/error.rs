use std::path::PathBuf;

use thiserror::Error;

/// acipack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Writing or finalizing the image archive failed
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Walking a filesystem tree failed
    #[error("Walk error: {} - {message}", path.display())]
    WalkError { path: PathBuf, message: String },

    /// Comparing two filesystem trees failed
    #[error("Diff error: {} - {message}", path.display())]
    DiffError { path: PathBuf, message: String },

    /// The image format cannot be determined or decoded
    #[error("Format error: {0}")]
    FormatError(String),

    /// Replaying an archive entry onto disk failed
    #[error("Extract error: {} - {message}", path.display())]
    ExtractError { path: PathBuf, message: String },

    /// Invalid manifest content
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Build a walk error for the given path.
    pub fn walk(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        PackError::WalkError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Build a diff error for the given path.
    pub fn diff(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        PackError::DiffError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Build an extract error for the given path.
    pub fn extract(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        PackError::ExtractError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error means the image format could not be determined
    /// or decoded, as opposed to a plain I/O failure.
    pub fn is_format_error(&self) -> bool {
        matches!(self, PackError::FormatError(_))
    }
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

/// Result type alias for acipack operations
pub type Result<T> = std::result::Result<T, PackError>;
