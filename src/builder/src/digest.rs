//! SHA-256 helpers for blob verification and section digests.

use std::io::{Read, Write};
use std::path::Path;

use a3s_image_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

/// Compute SHA256 digest of a file (hex string, no algorithm prefix).
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        BuildError::validation(
            path.display().to_string(),
            format!("Failed to open file for hashing: {}", e),
        )
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            BuildError::validation(
                path.display().to_string(),
                format!("Failed to read file for hashing: {}", e),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Split `algorithm:hex` into its parts, defaulting the algorithm to sha256.
pub fn split_digest(digest: &str) -> (&str, &str) {
    match digest.split_once(':') {
        Some((algorithm, hex)) => (algorithm, hex),
        None => ("sha256", digest),
    }
}

/// Hex part of a `sha256:<64 lowercase hex>` digest.
///
/// Digests read from manifests and indexes pass through here before they
/// are joined into blob paths.
pub fn sha256_hex(digest: &str) -> Result<&str> {
    match digest.strip_prefix("sha256:") {
        Some(hex)
            if hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) =>
        {
            Ok(hex)
        }
        _ => Err(BuildError::validation(
            digest.to_string(),
            "expected a sha256 digest of 64 lowercase hex characters",
        )),
    }
}

/// Verify a file against an `algorithm:hex` digest.
///
/// Only sha256 is supported; other algorithms are a validation error.
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let (algorithm, hex) = split_digest(expected);
    if algorithm != "sha256" {
        return Err(BuildError::validation(
            path.display().to_string(),
            format!("unsupported digest algorithm '{}'", algorithm),
        ));
    }

    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(hex) {
        return Err(BuildError::validation(
            path.display().to_string(),
            format!("digest mismatch: expected sha256:{}, got sha256:{}", hex, actual),
        ));
    }
    Ok(())
}

/// Writer adapter that hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finish hashing, returning the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, [u8; 32], u64) {
        (self.inner, self.hasher.finalize().into(), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.txt");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(hex::encode(sha256_bytes(b"hello")), HELLO_SHA256);
    }

    #[test]
    fn test_split_digest() {
        assert_eq!(split_digest("sha256:abc"), ("sha256", "abc"));
        assert_eq!(split_digest("abc"), ("sha256", "abc"));
    }

    #[test]
    fn test_sha256_hex() {
        let digest = format!("sha256:{}", HELLO_SHA256);
        assert_eq!(sha256_hex(&digest).unwrap(), HELLO_SHA256);

        for bad in [
            "sha256:../../x",
            "sha256:abc",
            HELLO_SHA256,
            "sha512:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
        ] {
            let err = sha256_hex(bad).unwrap_err();
            assert!(matches!(err, BuildError::Validation { .. }), "{bad}");
        }
    }

    #[test]
    fn test_verify_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, "hello").unwrap();

        verify_file(&path, &format!("sha256:{}", HELLO_SHA256)).unwrap();

        let err = verify_file(&path, "sha256:0000").unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));

        let err = verify_file(&path, "sha512:abcd").unwrap_err();
        assert!(err.to_string().contains("unsupported digest algorithm"));
    }

    #[test]
    fn test_verify_missing_file_names_path() {
        let err = verify_file(Path::new("/nonexistent/blob"), "sha256:00").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/blob"));
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo").unwrap();
        let (inner, digest, written) = writer.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(written, 5);
        assert_eq!(hex::encode(digest), HELLO_SHA256);
    }
}
