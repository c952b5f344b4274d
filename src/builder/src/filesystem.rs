//! Filesystem partition encodings.
//!
//! An assembler turns a bundle rootfs into a single partition through a
//! [`FilesystemPacker`]. The default packer writes a deterministic tar
//! stream: entries are visited depth-first with siblings sorted by name,
//! and modification times can be clamped so that identical trees produce
//! identical bytes.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::FsKind;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, EntryType, Header, HeaderMode};

use crate::fs::is_privileged;
use crate::oci::layers::sanitize_entry_path;

/// Filesystem type code stored in a partition descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FsType {
    None = 0,
    Tar = 1,
    TarGzip = 2,
}

impl FsType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FsType::None),
            1 => Some(FsType::Tar),
            2 => Some(FsType::TarGzip),
            _ => None,
        }
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FsType::None => "none",
            FsType::Tar => "tar",
            FsType::TarGzip => "tar+gzip",
        };
        write!(f, "{}", name)
    }
}

/// Encodes a directory tree into partition bytes and back.
pub trait FilesystemPacker: Send + Sync {
    /// Type code recorded in the partition descriptor.
    fn fs_type(&self) -> FsType;

    /// Write the tree rooted at `rootfs` to `out`.
    fn pack(&self, rootfs: &Path, out: &mut dyn Write) -> Result<()>;

    /// Recreate a tree under `dest` from partition bytes.
    ///
    /// Returns special files that could not be created.
    fn unpack(&self, input: &mut dyn Read, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Tar partition, optionally gzip-compressed.
#[derive(Debug, Clone, Default)]
pub struct TarFilesystem {
    gzip: bool,
    mtime_clamp: Option<u64>,
}

impl TarFilesystem {
    /// Plain tar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gzip-compressed tar.
    pub fn gzip() -> Self {
        Self {
            gzip: true,
            mtime_clamp: None,
        }
    }

    /// Clamp entry modification times to at most `epoch`.
    pub fn with_mtime_clamp(mut self, epoch: Option<u64>) -> Self {
        self.mtime_clamp = epoch;
        self
    }

    fn write_tree<W: Write>(&self, rootfs: &Path, builder: &mut tar::Builder<W>) -> Result<()> {
        let mut skipped = Vec::new();
        self.append_dir_entries(rootfs, rootfs, builder, &mut skipped)?;
        for path in &skipped {
            tracing::warn!(path = %path.display(), "Socket not stored in filesystem partition");
        }
        Ok(())
    }

    fn append_dir_entries<W: Write>(
        &self,
        root: &Path,
        dir: &Path,
        builder: &mut tar::Builder<W>,
        skipped: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| pack_error(dir, e))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| pack_error(dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            let meta = std::fs::symlink_metadata(&path).map_err(|e| pack_error(&path, e))?;
            let file_type = meta.file_type();

            if file_type.is_socket() {
                skipped.push(relative);
                continue;
            }

            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_mode(meta.mode() & 0o7777);
            header.set_mtime(self.clamp(meta.mtime().max(0) as u64));

            if file_type.is_symlink() {
                let target = std::fs::read_link(&path).map_err(|e| pack_error(&path, e))?;
                header.set_size(0);
                builder
                    .append_link(&mut header, &relative, &target)
                    .map_err(|e| pack_error(&path, e))?;
            } else if file_type.is_dir() {
                header.set_size(0);
                builder
                    .append_data(&mut header, &relative, std::io::empty())
                    .map_err(|e| pack_error(&path, e))?;
                self.append_dir_entries(root, &path, builder, skipped)?;
            } else if file_type.is_file() {
                let file = File::open(&path).map_err(|e| pack_error(&path, e))?;
                builder
                    .append_data(&mut header, &relative, file)
                    .map_err(|e| pack_error(&path, e))?;
            } else {
                // FIFOs and device nodes carry no data.
                header.set_size(0);
                if file_type.is_char_device() || file_type.is_block_device() {
                    let (major, minor) = split_device(meta.rdev());
                    header
                        .set_device_major(major)
                        .and_then(|_| header.set_device_minor(minor))
                        .map_err(|e| pack_error(&path, e))?;
                }
                builder
                    .append_data(&mut header, &relative, std::io::empty())
                    .map_err(|e| pack_error(&path, e))?;
            }
        }
        Ok(())
    }

    fn clamp(&self, mtime: u64) -> u64 {
        match self.mtime_clamp {
            Some(epoch) => mtime.min(epoch),
            None => mtime,
        }
    }
}

impl FilesystemPacker for TarFilesystem {
    fn fs_type(&self) -> FsType {
        if self.gzip {
            FsType::TarGzip
        } else {
            FsType::Tar
        }
    }

    fn pack(&self, rootfs: &Path, out: &mut dyn Write) -> Result<()> {
        if self.gzip {
            let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
            self.write_tree(rootfs, &mut builder)?;
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(|e| pack_error(rootfs, e))?;
        } else {
            let mut builder = tar::Builder::new(out);
            self.write_tree(rootfs, &mut builder)?;
            builder.finish().map_err(|e| pack_error(rootfs, e))?;
        }

        tracing::debug!(rootfs = %rootfs.display(), fs_type = %self.fs_type(), "Packed filesystem");
        Ok(())
    }

    fn unpack(&self, input: &mut dyn Read, dest: &Path) -> Result<Vec<PathBuf>> {
        if self.gzip {
            unpack_tar(GzDecoder::new(input), dest)
        } else {
            unpack_tar(input, dest)
        }
    }
}

/// Pick the packer for a configured filesystem kind.
pub fn for_kind(kind: FsKind, mtime_clamp: Option<u64>) -> Box<dyn FilesystemPacker> {
    let packer = match kind {
        FsKind::Tar => TarFilesystem::new(),
        FsKind::TarGzip => TarFilesystem::gzip(),
    };
    Box::new(packer.with_mtime_clamp(mtime_clamp))
}

/// Pick the packer able to decode a partition of the given type.
pub fn for_type(fs_type: FsType) -> Result<Box<dyn FilesystemPacker>> {
    match fs_type {
        FsType::Tar => Ok(Box::new(TarFilesystem::new())),
        FsType::TarGzip => Ok(Box::new(TarFilesystem::gzip())),
        FsType::None => Err(BuildError::unsupported(
            "filesystem type",
            "partition has no filesystem type",
        )),
    }
}

/// Extract a tar stream of a whole root filesystem into `dest`.
///
/// Directory modes and times are applied after all entries so read-only
/// directories can still be populated. Device nodes are skipped when not
/// running privileged and returned to the caller.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>> {
    let privileged = is_privileged();
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(privileged);
    archive.set_preserve_ownerships(privileged);
    let mut dirs = Vec::new();
    let mut skipped = Vec::new();

    std::fs::create_dir_all(dest).map_err(|e| unpack_error(dest, e))?;

    let entries = archive.entries().map_err(|e| unpack_error(dest, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| unpack_error(dest, e))?;
        let raw = entry.path().map_err(|e| unpack_error(dest, e))?.into_owned();
        let Some(relative) = sanitize_entry_path(&raw)
            .map_err(|msg| BuildError::validation(dest.display().to_string(), msg))?
        else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::Char | EntryType::Block) && !privileged {
            tracing::warn!(
                path = %relative.display(),
                "Skipping device node: creating it requires privilege"
            );
            skipped.push(relative);
            continue;
        }

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            BuildError::validation(
                dest.display().to_string(),
                format!("failed to extract '{}': {}", relative.display(), e),
            )
        })?;
        if !unpacked {
            return Err(BuildError::validation(
                dest.display().to_string(),
                format!("entry '{}' escapes the root", raw.display()),
            ));
        }

        if entry_type == EntryType::Directory {
            let header = entry.header();
            let mode = header.mode().unwrap_or(0o755) & 0o7777;
            let mtime = header.mtime().unwrap_or(0);
            let target = dest.join(&relative);
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode | 0o700))
                .map_err(|e| unpack_error(&target, e))?;
            dirs.push((relative, mode, mtime));
        }
    }

    // Deepest first, so restricted parents never block their children.
    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (relative, mode, mtime) in dirs {
        let target = dest.join(&relative);
        File::open(&target)
            .and_then(|dir| dir.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime)))
            .map_err(|e| unpack_error(&target, e))?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
            .map_err(|e| unpack_error(&target, e))?;
    }

    Ok(skipped)
}

/// Split a Linux `dev_t` into major and minor numbers.
fn split_device(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}

fn pack_error(path: &Path, e: std::io::Error) -> BuildError {
    BuildError::Other(format!("Failed to pack {}: {}", path.display(), e))
}

fn unpack_error(path: &Path, e: std::io::Error) -> BuildError {
    BuildError::validation(
        path.display().to_string(),
        format!("failed to unpack filesystem: {}", e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::fs::write(root.join("etc/hostname"), "box\n").unwrap();
        std::fs::write(root.join("usr/bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(
            root.join("usr/bin/tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        symlink("usr/bin", root.join("bin")).unwrap();
        tmp
    }

    fn pack_to_vec(packer: &dyn FilesystemPacker, root: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        packer.pack(root, &mut out).unwrap();
        out
    }

    fn entry_paths(data: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().display().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_fs_type_codes() {
        assert_eq!(FsType::Tar.code(), 1);
        assert_eq!(FsType::from_code(2), Some(FsType::TarGzip));
        assert_eq!(FsType::from_code(9), None);
        assert_eq!(TarFilesystem::new().fs_type(), FsType::Tar);
        assert_eq!(TarFilesystem::gzip().fs_type(), FsType::TarGzip);
    }

    #[test]
    fn test_pack_orders_entries_by_name() {
        let tree = sample_tree();
        let data = pack_to_vec(&TarFilesystem::new(), tree.path());
        assert_eq!(
            entry_paths(&data),
            vec!["bin", "etc", "etc/hostname", "usr", "usr/bin", "usr/bin/tool"]
        );
    }

    #[test]
    fn test_pack_is_deterministic_with_clamp() {
        let tree = sample_tree();
        let packer = TarFilesystem::new().with_mtime_clamp(Some(1_000));
        let first = pack_to_vec(&packer, tree.path());
        let second = pack_to_vec(&packer, tree.path());
        assert_eq!(first, second);

        let mut archive = Archive::new(first.as_slice());
        for entry in archive.entries().unwrap() {
            assert_eq!(entry.unwrap().header().mtime().unwrap(), 1_000);
        }
    }

    #[test]
    fn test_clamp_keeps_older_times() {
        let packer = TarFilesystem::new().with_mtime_clamp(Some(1_000));
        assert_eq!(packer.clamp(500), 500);
        assert_eq!(packer.clamp(5_000), 1_000);
        assert_eq!(TarFilesystem::new().clamp(5_000), 5_000);
    }

    #[test]
    fn test_pack_unpack_preserves_tree() {
        let tree = sample_tree();
        for packer in [TarFilesystem::new(), TarFilesystem::gzip()] {
            let data = pack_to_vec(&packer, tree.path());
            let dest = TempDir::new().unwrap();
            let skipped = packer.unpack(&mut data.as_slice(), dest.path()).unwrap();
            assert!(skipped.is_empty());

            let root = dest.path();
            assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "box\n");
            let mode = std::fs::metadata(root.join("usr/bin/tool")).unwrap().mode();
            assert_eq!(mode & 0o777, 0o755);
            assert_eq!(
                std::fs::read_link(root.join("bin")).unwrap(),
                PathBuf::from("usr/bin")
            );
        }
    }

    #[test]
    fn test_gzip_output_is_compressed() {
        let tree = sample_tree();
        let data = pack_to_vec(&TarFilesystem::gzip(), tree.path());
        assert_eq!(&data[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_unpack_restores_read_only_directory() {
        let tree = TempDir::new().unwrap();
        std::fs::create_dir(tree.path().join("ro")).unwrap();
        std::fs::write(tree.path().join("ro/file"), "x").unwrap();
        std::fs::set_permissions(tree.path().join("ro"), std::fs::Permissions::from_mode(0o555))
            .unwrap();

        let data = pack_to_vec(&TarFilesystem::new(), tree.path());
        std::fs::set_permissions(tree.path().join("ro"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let dest = TempDir::new().unwrap();
        unpack_tar(data.as_slice(), dest.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dest.path().join("ro/file")).unwrap(), "x");
        let mode = std::fs::metadata(dest.path().join("ro")).unwrap().mode();
        assert_eq!(mode & 0o777, 0o555);

        std::fs::set_permissions(dest.path().join("ro"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
    }

    #[test]
    fn test_pack_skips_sockets() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("file"), "x").unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(tree.path().join("sock")).unwrap();

        let data = pack_to_vec(&TarFilesystem::new(), tree.path());
        assert_eq!(entry_paths(&data), vec!["file".to_string()]);
    }

    #[test]
    fn test_unpack_rejects_corrupt_stream() {
        let dest = TempDir::new().unwrap();
        let garbage = vec![0x42u8; 1024];
        let result = TarFilesystem::new().unpack(&mut garbage.as_slice(), dest.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_for_kind_and_type() {
        assert_eq!(for_kind(FsKind::TarGzip, None).fs_type(), FsType::TarGzip);
        assert_eq!(for_type(FsType::Tar).unwrap().fs_type(), FsType::Tar);
        assert!(for_type(FsType::None).is_err());
    }

    #[test]
    fn test_split_device() {
        // makedev(8, 1)
        assert_eq!(split_device((8 << 8) | 1), (8, 1));
    }

    #[test]
    fn test_unpack_keeps_ownership_when_privileged() {
        if !is_privileged() {
            eprintln!("Skipping: requires root");
            return;
        }
        let tree = TempDir::new().unwrap();
        let file = tree.path().join("owned");
        std::fs::write(&file, "x").unwrap();
        std::os::unix::fs::chown(&file, Some(1234), Some(5678)).unwrap();

        let data = pack_to_vec(&TarFilesystem::new(), tree.path());
        let dest = TempDir::new().unwrap();
        TarFilesystem::new()
            .unpack(&mut data.as_slice(), dest.path())
            .unwrap();

        let meta = std::fs::symlink_metadata(dest.path().join("owned")).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (1234, 5678));
    }
}
