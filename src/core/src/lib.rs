//! A3S Image Core - Foundational Types
//!
//! This module provides the error taxonomy, configuration and build
//! specification types shared by the image build pipeline and its CLI.

pub mod config;
pub mod error;
pub mod spec;

// Re-export commonly used types
pub use config::{BuildConfig, FsKind, LogLevel};
pub use error::{BuildError, Result};
pub use spec::{BuildSpecification, SourceKind};

/// A3S Image version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
