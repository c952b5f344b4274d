//! Build specification: the typed input of one pipeline run.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BuildError, Result};

/// Kind of upstream source an image is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Layered OCI/Docker image in a container registry
    Registry,
    /// Image hosted on an image hub
    Hub,
    /// OCI image layout on local disk (directory or tarball)
    Archive,
    /// Plain root filesystem directory
    Local,
}

impl SourceKind {
    /// URI scheme that selects this kind.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Registry => "docker",
            Self::Hub => "shub",
            Self::Archive => "oci-archive",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Hub => write!(f, "hub"),
            Self::Archive => write!(f, "archive"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Immutable description of what to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpecification {
    /// Source kind
    pub kind: SourceKind,

    /// Source location without the scheme (reference, hub path or filesystem path)
    pub source: String,

    /// Runscript replacing the one derived from the source
    #[serde(default)]
    pub runscript: Option<String>,

    /// Test script embedded in the image
    #[serde(default)]
    pub test_script: Option<String>,

    /// Extra labels, applied in order after the source labels
    #[serde(default)]
    pub labels: Vec<(String, String)>,

    /// Environment overrides
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

impl BuildSpecification {
    /// Create a specification without customizations.
    pub fn new(kind: SourceKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            runscript: None,
            test_script: None,
            labels: Vec::new(),
            environment: Vec::new(),
        }
    }

    /// Map a source URI to a specification.
    ///
    /// Supports:
    /// - `docker://alpine:3.19` → registry
    /// - `shub://user/collection:tag` → hub
    /// - `oci-archive:/path/image.tar`, `oci:/path/layout` → archive
    /// - `local:/path/rootfs` or an existing directory path → local
    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(BuildError::ConfigError("Empty source URI".to_string()));
        }

        let (scheme, rest) = match uri.split_once(':') {
            Some((scheme, rest)) if !scheme.contains('/') => {
                (scheme, rest.strip_prefix("//").unwrap_or(rest))
            }
            _ => ("", uri),
        };

        let kind = match scheme {
            "docker" => SourceKind::Registry,
            "shub" => SourceKind::Hub,
            "oci-archive" | "oci" => SourceKind::Archive,
            "local" => SourceKind::Local,
            "" if Path::new(rest).is_dir() => SourceKind::Local,
            "" => {
                return Err(BuildError::ConfigError(format!(
                    "Source '{}' has no scheme and is not a directory",
                    uri
                )))
            }
            other => {
                return Err(BuildError::ConfigError(format!(
                    "Unsupported source scheme '{}' (supported: docker, shub, oci-archive, oci, local)",
                    other
                )))
            }
        };

        if rest.is_empty() {
            return Err(BuildError::ConfigError(format!(
                "Source URI '{}' has an empty location",
                uri
            )));
        }

        Ok(Self::new(kind, rest))
    }

    /// Canonical URI form of the source.
    pub fn uri(&self) -> String {
        match self.kind {
            SourceKind::Registry | SourceKind::Hub => {
                format!("{}://{}", self.kind.scheme(), self.source)
            }
            SourceKind::Archive | SourceKind::Local => {
                format!("{}:{}", self.kind.scheme(), self.source)
            }
        }
    }

    pub fn with_runscript(mut self, script: impl Into<String>) -> Self {
        self.runscript = Some(script.into());
        self
    }

    pub fn with_test_script(mut self, script: impl Into<String>) -> Self {
        self.test_script = Some(script.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }
}

impl std::fmt::Display for BuildSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}
