use std::path::PathBuf;

use thiserror::Error;

/// Image build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Network or registry failure while fetching a source artifact
    #[error("Fetch failed: {artifact} - {message}")]
    Fetch { artifact: String, message: String },

    /// Malformed manifest, layer, bundle or image
    #[error("Validation failed: {artifact} - {message}")]
    Validation { artifact: String, message: String },

    /// Disk or filesystem failure while writing output
    #[error("Write failed: {} - {message}", path.display())]
    Write { path: PathBuf, message: String },

    /// Source uses a feature that cannot be translated
    #[error("Unsupported feature: {feature} - {message}")]
    Unsupported { feature: String, message: String },

    /// Build aborted by the caller
    #[error("Build cancelled: {0}")]
    Cancelled(String),

    /// A pipeline stage failed
    #[error("Build of {spec} failed during {stage}: {source}")]
    Stage {
        spec: String,
        stage: &'static str,
        #[source]
        source: Box<BuildError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

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

impl BuildError {
    /// Shorthand for a fetch error.
    pub fn fetch(artifact: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BuildError::Fetch {
            artifact: artifact.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(artifact: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BuildError::Validation {
            artifact: artifact.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a write error.
    pub fn write(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        BuildError::Write {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for an unsupported-feature error.
    pub fn unsupported(feature: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BuildError::Unsupported {
            feature: feature.into(),
            message: message.to_string(),
        }
    }

    /// Wrap this error with the build source and the stage it happened in.
    ///
    /// Already-wrapped errors are returned unchanged so the chain stays
    /// spec → stage → root cause.
    pub fn in_stage(self, spec: impl Into<String>, stage: &'static str) -> Self {
        match self {
            e @ BuildError::Stage { .. } => e,
            e => BuildError::Stage {
                spec: spec.into(),
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Stage { source, .. } => source.root_cause(),
            e => e,
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

/// Result type alias for image build operations
pub type Result<T> = std::result::Result<T, BuildError>;
