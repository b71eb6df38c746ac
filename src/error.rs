//! Error types, one enum per layer.

use thiserror::Error;

/// Errors from the durable record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store: corrupt log entry at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("store: serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the gallery. The gallery never swallows these; callers decide.
#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("identity already taken: {0}")]
    NameConflict(String),

    #[error("invalid dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors reported by the embedding collaborator.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embed: image could not be decoded")]
    InvalidImage,

    #[error("embed: no face detected")]
    NoFaceDetected,

    #[error("embed: extraction failed: {0}")]
    Failed(String),

    #[error("embed: timed out")]
    Timeout,
}

/// Errors reported by a blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob store backend error: {0}")]
    Backend(String),
}

/// The error taxonomy surfaced by the registry service.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no face detected")]
    NoFaceDetected,

    #[error("embedding extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("name already in use: {0}")]
    NameConflict(String),

    #[error("store failure: {0}")]
    StoreFailure(String),
}

impl RegistryError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::InvalidInput(_) => "invalid_input",
            RegistryError::NoFaceDetected => "no_face_detected",
            RegistryError::ExtractionFailure(_) => "extraction_failure",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::NameConflict(_) => "name_conflict",
            RegistryError::StoreFailure(_) => "store_failure",
        }
    }
}

impl From<EmbedError> for RegistryError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::InvalidImage => {
                RegistryError::InvalidInput("image could not be decoded".to_string())
            }
            EmbedError::NoFaceDetected => RegistryError::NoFaceDetected,
            EmbedError::Failed(msg) => RegistryError::ExtractionFailure(msg),
            EmbedError::Timeout => {
                RegistryError::ExtractionFailure("embedding timed out".to_string())
            }
        }
    }
}

impl From<GalleryError> for RegistryError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::NotFound(identity) => RegistryError::NotFound(identity),
            GalleryError::NameConflict(identity) => RegistryError::NameConflict(identity),
            GalleryError::DimensionMismatch { expected, actual } => {
                RegistryError::ExtractionFailure(format!(
                    "embedding has dimension {actual}, gallery expects {expected}"
                ))
            }
            GalleryError::Store(e) => RegistryError::StoreFailure(e.to_string()),
        }
    }
}
