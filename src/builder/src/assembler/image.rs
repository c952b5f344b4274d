//! Single-file image assembler.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use a3s_image_core::error::{BuildError, Result};
use tempfile::NamedTempFile;

use super::{destination_parent, validate_target, AssembleStage, Assembler, AssemblerOptions};
use crate::bundle::Bundle;
use crate::digest::{sha256_bytes, HashingWriter};
use crate::filesystem::{self, FilesystemPacker};
use crate::format::descriptor::ImageDescriptor;
use crate::format::header::ImageHeader;
use crate::format::{integrity, metadata, DESCRIPTOR_SIZE, HEADER_SIZE};

/// Writes bundles in the single-file image format.
pub struct ImageAssembler {
    options: AssemblerOptions,
    packer: Box<dyn FilesystemPacker>,
}

/// The packed partition, spooled to an anonymous file.
struct SpooledPartition {
    file: File,
    digest: [u8; 32],
    length: u64,
}

impl ImageAssembler {
    pub fn new(options: AssemblerOptions) -> Self {
        let packer = filesystem::for_kind(options.fs_type, options.mtime_clamp);
        Self { options, packer }
    }

    /// Use a custom filesystem packer for the partition.
    pub fn with_packer(mut self, packer: Box<dyn FilesystemPacker>) -> Self {
        self.packer = packer;
        self
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    fn run(&self, bundle: &Bundle, destination: &Path, stage: &mut AssembleStage) -> Result<()> {
        *stage = AssembleStage::Validating;
        validate_target(bundle, destination)?;
        let parent = destination_parent(destination);

        *stage = AssembleStage::Packing;
        let mut partition = self.pack_partition(bundle)?;
        let metadata_blob = metadata::encode(bundle.metadata());

        *stage = AssembleStage::Writing;
        let (descriptors, integrity_blob) = self.layout(&partition, &metadata_blob);
        let data_len: u64 = descriptors.iter().map(|d| d.length).sum();
        let header = ImageHeader::new(self.options.arch.clone(), descriptors.len() as u32, data_len);
        let header_bytes = header.encode()?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".a3s-image-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| BuildError::write(&parent, format!("failed to create temp file: {}", e)))?;
        let tmp_path = tmp.path().to_path_buf();
        let write_err = |e: std::io::Error| BuildError::write(&tmp_path, e);

        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            out.write_all(&header_bytes).map_err(write_err)?;
            for desc in &descriptors {
                out.write_all(&desc.encode()).map_err(write_err)?;
            }
            partition
                .file
                .seek(SeekFrom::Start(0))
                .map_err(write_err)?;
            let copied = std::io::copy(&mut partition.file, &mut out).map_err(write_err)?;
            if copied != partition.length {
                return Err(BuildError::write(
                    &tmp_path,
                    format!("partition spool changed: copied {} of {} bytes", copied, partition.length),
                ));
            }
            out.write_all(&metadata_blob).map_err(write_err)?;
            if let Some(ref blob) = integrity_blob {
                out.write_all(blob).map_err(write_err)?;
            }
            out.flush().map_err(write_err)?;
        }

        *stage = AssembleStage::Finalizing;
        self.finalize(tmp, destination, &parent)?;

        tracing::info!(
            destination = %destination.display(),
            uuid = %header.uuid,
            size = header.file_size,
            partition = partition.length,
            "Image assembled"
        );
        Ok(())
    }

    /// Pack the rootfs into an anonymous spool file while hashing it.
    fn pack_partition(&self, bundle: &Bundle) -> Result<SpooledPartition> {
        let spool = match self.options.spool_dir {
            Some(ref dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
        .map_err(|e| {
            BuildError::write(
                self.options.spool_dir.clone().unwrap_or_else(std::env::temp_dir),
                format!("failed to create partition spool: {}", e),
            )
        })?;

        let mut writer = HashingWriter::new(BufWriter::new(spool));
        self.packer.pack(bundle.rootfs(), &mut writer)?;
        let (buffered, digest, length) = writer.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| BuildError::Other(format!("Failed to flush partition spool: {}", e.error())))?;

        tracing::debug!(
            rootfs = %bundle.rootfs().display(),
            bytes = length,
            digest = %hex::encode(digest),
            "Packed partition"
        );
        Ok(SpooledPartition { file, digest, length })
    }

    /// Lay out the descriptor table: partition, metadata, optional
    /// integrity block, back to back after the table.
    fn layout(
        &self,
        partition: &SpooledPartition,
        metadata_blob: &[u8],
    ) -> (Vec<ImageDescriptor>, Option<Vec<u8>>) {
        let mut part = ImageDescriptor::partition(1, self.packer.fs_type());
        part.length = partition.length;
        part.digest = partition.digest;

        let mut meta = ImageDescriptor::metadata(2);
        meta.length = metadata_blob.len() as u64;
        meta.digest = sha256_bytes(metadata_blob);

        let mut descriptors = vec![part, meta];
        let integrity_blob = self.options.integrity_block.then(|| {
            let entries: Vec<_> = descriptors.iter().map(|d| (d.id, d.digest)).collect();
            integrity::encode(&entries)
        });
        if let Some(ref blob) = integrity_blob {
            let mut sig = ImageDescriptor::signature(3, 1);
            sig.length = blob.len() as u64;
            sig.digest = sha256_bytes(blob);
            descriptors.push(sig);
        }

        let table_end = (HEADER_SIZE + descriptors.len() * DESCRIPTOR_SIZE) as u64;
        let mut offset = table_end;
        for desc in &mut descriptors {
            desc.offset = offset;
            offset += desc.length;
        }
        (descriptors, integrity_blob)
    }

    fn finalize(&self, tmp: NamedTempFile, destination: &Path, parent: &Path) -> Result<()> {
        let tmp_path = tmp.path().to_path_buf();
        tmp.as_file()
            .sync_all()
            .map_err(|e| BuildError::write(&tmp_path, format!("fsync failed: {}", e)))?;
        tmp.persist(destination).map_err(|e| {
            BuildError::write(
                &tmp_path,
                format!("failed to rename into {}: {}", destination.display(), e.error),
            )
        })?;
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| BuildError::write(parent, format!("fsync failed: {}", e)))
    }
}

impl Default for ImageAssembler {
    fn default() -> Self {
        Self::new(AssemblerOptions::default())
    }
}

impl Assembler for ImageAssembler {
    fn assemble(&self, bundle: &Bundle, destination: &Path) -> Result<()> {
        let mut stage = AssembleStage::Validating;
        tracing::info!(destination = %destination.display(), "Assembling image");

        let result = self.run(bundle, destination, &mut stage);
        match result {
            Ok(()) => {
                tracing::debug!(stage = %AssembleStage::Done, "Assembly finished");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    stage = %AssembleStage::Failed,
                    failed_in = %stage,
                    error = %e,
                    "Assembly failed"
                );
                Err(e)
            }
        }
    }
}
