//! Filesystem helpers shared by packers and assemblers.

use a3s_image_core::error::{BuildError, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Whether the process can faithfully restore ownership and device nodes.
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Whether a directory exists and has at least one entry.
pub fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Remove a path of any type without following symlinks.
///
/// Missing paths are not an error.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy a directory tree, preserving symlinks and permission bits.
///
/// Ownership, device nodes and FIFOs are copied when running privileged;
/// otherwise those nodes are skipped. Sockets are never copied. Relative
/// paths of skipped entries are returned so the caller can report the loss.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    let mut skipped = Vec::new();
    copy_tree_inner(src, src, dst, is_privileged(), &mut skipped)?;
    skipped.sort();
    Ok(skipped)
}

fn copy_tree_inner(
    root: &Path,
    src: &Path,
    dst: &Path,
    privileged: bool,
    skipped: &mut Vec<PathBuf>,
) -> Result<()> {
    let copy_err = |path: &Path, e: std::io::Error| {
        BuildError::Other(format!("Failed to copy {}: {}", path.display(), e))
    };

    std::fs::create_dir_all(dst).map_err(|e| copy_err(dst, e))?;

    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| copy_err(src, e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| copy_err(src, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src_path).map_err(|e| copy_err(&src_path, e))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(&src_path).map_err(|e| copy_err(&src_path, e))?;
            std::os::unix::fs::symlink(&target, &dst_path).map_err(|e| copy_err(&dst_path, e))?;
        } else if file_type.is_dir() {
            copy_tree_inner(root, &src_path, &dst_path, privileged, skipped)?;
            std::fs::set_permissions(&dst_path, std::fs::Permissions::from_mode(meta.mode()))
                .map_err(|e| copy_err(&dst_path, e))?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| copy_err(&src_path, e))?;
        } else if privileged
            && (file_type.is_char_device() || file_type.is_block_device() || file_type.is_fifo())
        {
            make_node(&dst_path, meta.mode(), meta.rdev()).map_err(|e| copy_err(&dst_path, e))?;
            std::fs::set_permissions(&dst_path, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
                .map_err(|e| copy_err(&dst_path, e))?;
        } else {
            let relative = src_path.strip_prefix(root).unwrap_or(&src_path);
            skipped.push(relative.to_path_buf());
            continue;
        }

        if privileged {
            std::os::unix::fs::lchown(&dst_path, Some(meta.uid()), Some(meta.gid()))
                .map_err(|e| copy_err(&dst_path, e))?;
        }
    }

    Ok(())
}

/// Create a device node or FIFO; `mode` carries the file type bits.
fn make_node(path: &Path, mode: u32, rdev: u64) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Calculate total size of regular files in a directory tree.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => total += dir_size(&path),
                Ok(meta) if meta.is_file() => total += meta.len(),
                _ => {}
            }
        }
    }
    total
}
