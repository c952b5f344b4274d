use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Default number of concurrent blob fetches per build.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Default image hub endpoint.
pub const DEFAULT_HUB_URL: &str = "https://singularity-hub.org";

/// Build pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Parent directory for per-build staging and bundle directories
    pub tmp_dir: PathBuf,

    /// Maximum number of blobs fetched concurrently within one build
    pub fetch_concurrency: usize,

    /// Target platform OS used to resolve multi-arch manifests
    pub platform_os: String,

    /// Target platform architecture (OCI naming, e.g. "amd64")
    pub platform_arch: String,

    /// Image hub base URL
    pub hub_url: String,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,

    /// Clamp for file modification times written into images
    pub source_date_epoch: Option<u64>,

    /// Filesystem format of the image partition
    pub fs_type: FsKind,

    /// Append an integrity block with section digests
    pub integrity_block: bool,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            platform_os: "linux".to_string(),
            platform_arch: host_arch().to_string(),
            hub_url: DEFAULT_HUB_URL.to_string(),
            insecure_registries: Vec::new(),
            source_date_epoch: None,
            fs_type: FsKind::Tar,
            integrity_block: true,
            log_level: LogLevel::Warn,
        }
    }
}

impl BuildConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// The format is picked from the file extension; anything other than
    /// `.json` is parsed as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: BuildConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Default location of the user config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("a3s-image").join("config.yaml"))
    }

    /// Load the user config file if present, otherwise defaults.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `A3S_IMAGE_TMPDIR`, `A3S_IMAGE_FETCH_CONCURRENCY`,
    /// `A3S_IMAGE_HUB_URL` and `SOURCE_DATE_EPOCH`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("A3S_IMAGE_TMPDIR") {
            self.tmp_dir = PathBuf::from(dir);
        }
        if let Ok(n) = std::env::var("A3S_IMAGE_FETCH_CONCURRENCY") {
            self.fetch_concurrency = n.parse().map_err(|_| {
                BuildError::ConfigError(format!(
                    "A3S_IMAGE_FETCH_CONCURRENCY must be a positive integer, got '{}'",
                    n
                ))
            })?;
        }
        if let Ok(url) = std::env::var("A3S_IMAGE_HUB_URL") {
            self.hub_url = url;
        }
        if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
            self.source_date_epoch = Some(epoch.parse().map_err(|_| {
                BuildError::ConfigError(format!(
                    "SOURCE_DATE_EPOCH must be unix seconds, got '{}'",
                    epoch
                ))
            })?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_concurrency == 0 {
            return Err(BuildError::ConfigError(
                "fetch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.platform_os.is_empty() || self.platform_arch.is_empty() {
            return Err(BuildError::ConfigError(
                "platform_os and platform_arch must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the given registry host should be reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Host CPU architecture in OCI naming.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Filesystem format used for the image partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsKind {
    /// Uncompressed, path-sorted tar stream
    Tar,
    /// Gzip-compressed tar stream
    TarGzip,
}

impl std::str::FromStr for FsKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tar" => Ok(Self::Tar),
            "tar-gzip" => Ok(Self::TarGzip),
            _ => Err(format!(
                "unknown filesystem type: '{}' (supported: tar, tar-gzip)",
                s
            )),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.fetch_concurrency, DEFAULT_FETCH_CONCURRENCY);
        assert_eq!(config.platform_os, "linux");
        assert_eq!(config.fs_type, FsKind::Tar);
        assert!(config.integrity_block);
        assert!(config.source_date_epoch.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_env_overrides() {
        // The only test in this crate that touches these variables.
        std::env::set_var("A3S_IMAGE_HUB_URL", "http://127.0.0.1:9/hub");
        std::env::set_var("SOURCE_DATE_EPOCH", "1600000000");
        let config = BuildConfig::default().with_env_overrides();
        std::env::set_var("SOURCE_DATE_EPOCH", "yesterday");
        let bad = BuildConfig::default().with_env_overrides();
        std::env::remove_var("A3S_IMAGE_HUB_URL");
        std::env::remove_var("SOURCE_DATE_EPOCH");

        let config = config.unwrap();
        assert_eq!(config.hub_url, "http://127.0.0.1:9/hub");
        assert_eq!(config.source_date_epoch, Some(1_600_000_000));
        assert!(bad.unwrap_err().to_string().contains("SOURCE_DATE_EPOCH"));
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let config = BuildConfig {
            fetch_concurrency: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fetch_concurrency"));
    }

    #[test]
    fn test_load_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "fetch_concurrency: 8\nfs_type: tar-gzip\ninsecure_registries: [\"localhost:5000\"]\n",
        )
        .unwrap();

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.fetch_concurrency, 8);
        assert_eq!(config.fs_type, FsKind::TarGzip);
        assert!(config.is_insecure("localhost:5000"));
        assert!(!config.is_insecure("docker.io"));
        // Unset fields keep their defaults
        assert_eq!(config.hub_url, DEFAULT_HUB_URL);
    }

    #[test]
    fn test_load_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"source_date_epoch": 1700000000, "log_level": "debug"}"#)
            .unwrap();

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.source_date_epoch, Some(1_700_000_000));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "fetch_concurrency: 0\n").unwrap();

        assert!(BuildConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = BuildConfig::load(Path::new("/nonexistent/a3s-image.yaml")).unwrap_err();
        assert!(matches!(err, BuildError::ConfigError(_)));
    }

    #[test]
    fn test_fs_kind_from_str() {
        assert_eq!("tar".parse::<FsKind>().unwrap(), FsKind::Tar);
        assert_eq!("tar-gzip".parse::<FsKind>().unwrap(), FsKind::TarGzip);
        assert!("squashfs".parse::<FsKind>().is_err());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }

    #[test]
    fn test_host_arch_is_oci_name() {
        let arch = host_arch();
        assert_ne!(arch, "x86_64");
        assert_ne!(arch, "aarch64");
    }
}
