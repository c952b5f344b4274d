//! OCI layer squashing.
//!
//! Applies an ordered sequence of layer archives onto one root filesystem,
//! honoring deletion markers:
//!
//! - `.wh.<name>` removes `<name>` from the accumulated tree
//! - `.wh..wh..opq` removes everything earlier layers put in its directory
//!
//! Each layer is read twice: the first pass collects and applies its
//! markers, the second extracts its regular entries. Markers therefore only
//! affect content of earlier layers, whatever their position in the tar.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use a3s_image_core::error::{BuildError, Result};
use tar::{Archive, EntryType};

use crate::bundle::FidelityReport;
use crate::fs::{is_privileged, remove_path};

/// Prefix of a deletion marker.
const WHITEOUT_PREFIX: &[u8] = b".wh.";

/// Name of the opaque-directory marker.
const OPAQUE_MARKER: &[u8] = b".wh..wh..opq";

/// Marker file name bytes, if `path` names a deletion or opaque marker.
///
/// Compared as raw bytes so names that are not valid UTF-8 are still seen.
fn marker_name(path: &Path) -> Option<&[u8]> {
    let name = path.file_name()?.as_bytes();
    name.starts_with(WHITEOUT_PREFIX).then_some(name)
}

/// Compression of a layer blob, detected from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

/// Detect layer compression from the blob's magic bytes.
///
/// zstd and other unrecognized compressed formats are reported as
/// unsupported; anything else is read as a plain tar stream.
pub fn detect_compression(layer_path: &Path) -> Result<LayerCompression> {
    let mut magic = [0u8; 6];
    let mut file = File::open(layer_path).map_err(|e| {
        BuildError::validation(
            layer_path.display().to_string(),
            format!("failed to open layer: {}", e),
        )
    })?;

    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                return Err(BuildError::validation(
                    layer_path.display().to_string(),
                    format!("failed to read layer: {}", e),
                ))
            }
        }
    }
    let magic = &magic[..filled];

    if magic.starts_with(&[0x1f, 0x8b]) {
        Ok(LayerCompression::Gzip)
    } else if magic.starts_with(b"BZh") {
        Ok(LayerCompression::Bzip2)
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Ok(LayerCompression::Xz)
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Err(BuildError::unsupported(
            "zstd layer compression",
            format!("cannot decompress {}", layer_path.display()),
        ))
    } else {
        Ok(LayerCompression::None)
    }
}

/// Open a layer blob as a decompressed tar stream.
pub fn open_layer(layer_path: &Path) -> Result<Box<dyn Read>> {
    let compression = detect_compression(layer_path)?;
    let file = File::open(layer_path).map_err(|e| {
        BuildError::validation(
            layer_path.display().to_string(),
            format!("failed to open layer: {}", e),
        )
    })?;
    let reader = BufReader::new(file);

    Ok(match compression {
        LayerCompression::None => Box::new(reader),
        LayerCompression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        LayerCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        LayerCompression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
    })
}

/// Normalize an archive entry path to a relative path inside the rootfs.
///
/// Leading `/` and `./` are stripped. Returns `None` for the archive root.
/// Paths escaping the root with `..` are rejected.
pub fn sanitize_entry_path(raw: &Path) -> std::result::Result<Option<PathBuf>, String> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                return Err(format!("entry '{}' escapes the root", raw.display()))
            }
            Component::Prefix(_) => {
                return Err(format!("entry '{}' has a path prefix", raw.display()))
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Resolve a relative path inside the rootfs without following symlinks
/// in any ancestor. Returns `None` when an ancestor is not a real directory.
fn resolve_in_root(rootfs: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = rootfs.to_path_buf();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.is_dir() => {}
                _ => return None,
            }
        }
    }
    Some(rootfs.join(relative))
}

/// Whether the parent of `relative` resolves inside the rootfs.
///
/// Symlinked ancestors pointing elsewhere in the tree are allowed, as tar
/// follows them when unpacking. A parent that does not exist yet holds
/// nothing to replace and counts as inside.
fn parent_within_root(rootfs: &Path, relative: &Path) -> std::io::Result<bool> {
    let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(true);
    };
    let root = rootfs.canonicalize()?;
    match rootfs.join(parent).canonicalize() {
        Ok(resolved) => Ok(resolved.starts_with(&root)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Per-layer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub entries: usize,
    pub whiteouts: usize,
    pub skipped_special: Vec<PathBuf>,
}

/// Recorded metadata of an extracted directory, restored after squashing.
#[derive(Debug, Clone, Copy)]
struct DirState {
    mode: u32,
    mtime: u64,
}

/// Applies layers, in order, onto a root filesystem.
pub struct LayerSquasher {
    rootfs: PathBuf,
    privileged: bool,
    dirs: BTreeMap<PathBuf, DirState>,
    layers_applied: usize,
    whiteouts_applied: usize,
    skipped_special: Vec<PathBuf>,
}

impl LayerSquasher {
    /// Create a squasher targeting an existing rootfs directory.
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            privileged: is_privileged(),
            dirs: BTreeMap::new(),
            layers_applied: 0,
            whiteouts_applied: 0,
            skipped_special: Vec::new(),
        }
    }

    /// Apply one layer on top of everything applied so far.
    pub fn apply(&mut self, layer_path: &Path) -> Result<LayerStats> {
        let mut stats = LayerStats::default();

        self.apply_markers(layer_path, &mut stats)?;
        self.extract_entries(layer_path, &mut stats)?;

        self.layers_applied += 1;
        self.whiteouts_applied += stats.whiteouts;
        self.skipped_special.extend(stats.skipped_special.iter().cloned());

        tracing::debug!(
            layer = %layer_path.display(),
            entries = stats.entries,
            whiteouts = stats.whiteouts,
            "Applied layer"
        );

        Ok(stats)
    }

    /// Restore directory modes and times, and fold the results into `report`.
    pub fn finish(self, report: &mut FidelityReport) -> Result<()> {
        // Deepest first, so restricted parents never block their children.
        for (relative, state) in self.dirs.iter().rev() {
            let path = self.rootfs.join(relative);
            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                _ => continue,
            }
            set_mtime(&path, state.mtime)?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(state.mode))
                .map_err(|e| layer_io_error(&path, "restore directory mode", e))?;
        }

        report.layers_applied += self.layers_applied;
        report.whiteouts_applied += self.whiteouts_applied;
        report.ownership_preserved = report.ownership_preserved && self.privileged;
        report.skipped_special.extend(self.skipped_special);

        if !self.privileged {
            tracing::warn!(
                rootfs = %self.rootfs.display(),
                "Not running privileged: file ownership from layers is not preserved"
            );
        }
        Ok(())
    }

    /// First pass: collect this layer's deletion markers and apply them.
    fn apply_markers(&mut self, layer_path: &Path, stats: &mut LayerStats) -> Result<()> {
        let mut opaque_dirs = Vec::new();
        let mut whiteouts = Vec::new();

        let mut archive = Archive::new(open_layer(layer_path)?);
        let entries = archive.entries().map_err(|e| corrupt_layer(layer_path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| corrupt_layer(layer_path, e))?;
            let raw = entry.path().map_err(|e| corrupt_layer(layer_path, e))?;
            let Some(name) = marker_name(&raw) else {
                continue;
            };

            let relative = sanitize_entry_path(&raw)
                .map_err(|msg| invalid_entry(layer_path, msg))?
                .ok_or_else(|| invalid_entry(layer_path, "marker at archive root".to_string()))?;
            let dir = relative.parent().map(Path::to_path_buf).unwrap_or_default();

            if name == OPAQUE_MARKER {
                opaque_dirs.push(dir);
            } else {
                let target = &name[WHITEOUT_PREFIX.len()..];
                if target.is_empty() || target == b"." || target == b".." {
                    return Err(BuildError::unsupported(
                        "deletion marker",
                        format!("cannot honor marker '{}' in {}", raw.display(), layer_path.display()),
                    ));
                }
                whiteouts.push(dir.join(OsStr::from_bytes(target)));
            }
        }

        for dir in opaque_dirs {
            self.clear_directory(&dir, layer_path)?;
            stats.whiteouts += 1;
        }
        for target in whiteouts {
            self.remove_entry(&target, layer_path)?;
            stats.whiteouts += 1;
        }
        Ok(())
    }

    /// Remove all children of a directory (opaque marker).
    fn clear_directory(&mut self, dir: &Path, layer_path: &Path) -> Result<()> {
        let Some(full) = resolve_in_root(&self.rootfs, dir) else {
            return Ok(());
        };
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Ok(()),
        }

        let children = std::fs::read_dir(&full)
            .map_err(|e| marker_error(layer_path, dir, e))?;
        for child in children {
            let child = child.map_err(|e| marker_error(layer_path, dir, e))?;
            remove_path(&child.path()).map_err(|e| marker_error(layer_path, dir, e))?;
        }
        let prefix = dir.to_path_buf();
        self.dirs
            .retain(|path, _| path == &prefix || !path.starts_with(&prefix));

        tracing::debug!(dir = %dir.display(), "Applied opaque marker");
        Ok(())
    }

    /// Remove one path (deletion marker).
    fn remove_entry(&mut self, target: &Path, layer_path: &Path) -> Result<()> {
        let Some(full) = resolve_in_root(&self.rootfs, target) else {
            return Ok(());
        };
        remove_path(&full).map_err(|e| marker_error(layer_path, target, e))?;
        self.dirs.retain(|path, _| !path.starts_with(target));

        tracing::debug!(path = %target.display(), "Applied deletion marker");
        Ok(())
    }

    /// Second pass: extract regular entries, skipping markers.
    fn extract_entries(&mut self, layer_path: &Path, stats: &mut LayerStats) -> Result<()> {
        let mut archive = Archive::new(open_layer(layer_path)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(self.privileged);
        archive.set_preserve_ownerships(self.privileged);
        let entries = archive.entries().map_err(|e| corrupt_layer(layer_path, e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| corrupt_layer(layer_path, e))?;
            let raw = entry
                .path()
                .map_err(|e| corrupt_layer(layer_path, e))?
                .into_owned();

            if marker_name(&raw).is_some() {
                continue;
            }

            let Some(relative) =
                sanitize_entry_path(&raw).map_err(|msg| invalid_entry(layer_path, msg))?
            else {
                continue;
            };

            let entry_type = entry.header().entry_type();
            if matches!(entry_type, EntryType::Char | EntryType::Block) && !self.privileged {
                tracing::warn!(
                    path = %relative.display(),
                    layer = %layer_path.display(),
                    "Skipping device node: creating it requires privilege"
                );
                stats.skipped_special.push(relative);
                continue;
            }

            // Checked before anything is replaced, so an earlier layer's
            // symlink can never redirect removal outside the rootfs.
            let inside = parent_within_root(&self.rootfs, &relative)
                .map_err(|e| layer_io_error(&self.rootfs.join(&relative), "resolve", e))?;
            if !inside {
                return Err(invalid_entry(
                    layer_path,
                    format!("entry '{}' resolves outside the root", raw.display()),
                ));
            }

            let target = self.rootfs.join(&relative);
            if let Ok(existing) = std::fs::symlink_metadata(&target) {
                let keep = existing.is_dir() && entry_type == EntryType::Directory;
                if !keep {
                    remove_path(&target).map_err(|e| layer_io_error(&target, "replace", e))?;
                    self.dirs.retain(|path, _| !path.starts_with(&relative));
                }
            }

            let unpacked = entry.unpack_in(&self.rootfs).map_err(|e| {
                BuildError::validation(
                    layer_path.display().to_string(),
                    format!("failed to extract '{}': {}", relative.display(), e),
                )
            })?;
            if !unpacked {
                return Err(invalid_entry(
                    layer_path,
                    format!("entry '{}' escapes the root", raw.display()),
                ));
            }

            if entry_type == EntryType::Directory {
                let header = entry.header();
                let state = DirState {
                    mode: header.mode().unwrap_or(0o755) & 0o7777,
                    mtime: header.mtime().unwrap_or(0),
                };
                std::fs::set_permissions(
                    &target,
                    std::fs::Permissions::from_mode(state.mode | 0o700),
                )
                .map_err(|e| layer_io_error(&target, "open directory for writing", e))?;
                self.dirs.insert(relative, state);
            }

            stats.entries += 1;
        }
        Ok(())
    }
}

fn set_mtime(path: &Path, mtime: u64) -> Result<()> {
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime);
    File::open(path)
        .and_then(|dir| dir.set_modified(time))
        .map_err(|e| layer_io_error(path, "restore directory time", e))
}

fn corrupt_layer(layer_path: &Path, e: std::io::Error) -> BuildError {
    BuildError::validation(
        layer_path.display().to_string(),
        format!("corrupt layer archive: {}", e),
    )
}

fn invalid_entry(layer_path: &Path, msg: String) -> BuildError {
    BuildError::validation(layer_path.display().to_string(), msg)
}

fn marker_error(layer_path: &Path, target: &Path, e: std::io::Error) -> BuildError {
    BuildError::unsupported(
        "deletion marker",
        format!(
            "failed to remove '{}' for {}: {}",
            target.display(),
            layer_path.display(),
            e
        ),
    )
}

fn layer_io_error(path: &Path, action: &str, e: std::io::Error) -> BuildError {
    BuildError::Other(format!("Failed to {} {}: {}", action, path.display(), e))
}
