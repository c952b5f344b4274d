//! Reader for built images.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use a3s_image_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

use super::descriptor::{DescriptorKind, ImageDescriptor, PartitionUsage};
use super::header::ImageHeader;
use super::{integrity, metadata, DESCRIPTOR_SIZE, HEADER_SIZE};
use crate::bundle::BundleMetadata;
use crate::filesystem;

/// An image opened for reading.
///
/// Opening checks the structure (magic, version, table bounds, section
/// layout); [`ImageFile::verify`] additionally checks section digests.
#[derive(Debug)]
pub struct ImageFile {
    path: PathBuf,
    header: ImageHeader,
    descriptors: Vec<ImageDescriptor>,
}

impl ImageFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let invalid = |message: String| BuildError::validation(path.display().to_string(), message);

        let mut file = File::open(&path)
            .map_err(|e| invalid(format!("failed to open image: {}", e)))?;
        let actual_size = file
            .metadata()
            .map_err(|e| invalid(format!("failed to stat image: {}", e)))?
            .len();

        let mut head = [0u8; HEADER_SIZE];
        file.read_exact(&mut head)
            .map_err(|e| invalid(format!("failed to read header: {}", e)))?;
        let header = ImageHeader::decode(&head)
            .map_err(|e| invalid(e.to_string()))?;

        if header.file_size != actual_size {
            return Err(invalid(format!(
                "header records {} bytes but file has {}",
                header.file_size, actual_size
            )));
        }
        if header.descriptor_offset != HEADER_SIZE as u64
            || header.descriptor_size != DESCRIPTOR_SIZE as u32
        {
            return Err(invalid("unexpected descriptor table geometry".to_string()));
        }
        let table_len = u64::from(header.descriptor_count) * DESCRIPTOR_SIZE as u64;
        let table_end = header.descriptor_offset + table_len;
        if header.descriptor_count == 0 || table_end > actual_size {
            return Err(invalid(format!(
                "descriptor table of {} entries does not fit the file",
                header.descriptor_count
            )));
        }
        if header.data_offset != table_end {
            return Err(invalid(format!(
                "data starts at {}, expected {}",
                header.data_offset, table_end
            )));
        }

        let mut table = vec![0u8; table_len as usize];
        file.read_exact(&mut table)
            .map_err(|e| invalid(format!("failed to read descriptor table: {}", e)))?;
        let descriptors = table
            .chunks_exact(DESCRIPTOR_SIZE)
            .map(ImageDescriptor::decode)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| invalid(e.to_string()))?;

        // Sections must follow the table back to back and end at EOF.
        let mut expected = header.data_offset;
        for (index, desc) in descriptors.iter().enumerate() {
            if desc.id != index as u32 + 1 {
                return Err(invalid(format!(
                    "descriptor {} has id {}",
                    index + 1,
                    desc.id
                )));
            }
            if desc.offset != expected {
                return Err(invalid(format!(
                    "section {} starts at {}, expected {}",
                    desc.id, desc.offset, expected
                )));
            }
            expected = expected
                .checked_add(desc.length)
                .filter(|&end| end <= actual_size)
                .ok_or_else(|| invalid(format!("section {} runs past end of file", desc.id)))?;
        }
        if expected != actual_size || header.data_len != actual_size - header.data_offset {
            return Err(invalid(format!(
                "sections cover {} bytes of {} data bytes",
                expected - header.data_offset,
                actual_size - header.data_offset
            )));
        }

        Ok(Self {
            path,
            header,
            descriptors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn descriptors(&self) -> &[ImageDescriptor] {
        &self.descriptors
    }

    /// First descriptor of the given kind.
    pub fn descriptor(&self, kind: DescriptorKind) -> Option<&ImageDescriptor> {
        self.descriptors.iter().find(|d| d.kind == kind)
    }

    /// Stream the bytes of one section.
    pub fn section_reader(&self, desc: &ImageDescriptor) -> Result<impl Read> {
        let mut file = File::open(&self.path).map_err(|e| self.io_error("open image", e))?;
        file.seek(SeekFrom::Start(desc.offset))
            .map_err(|e| self.io_error("seek to section", e))?;
        Ok(BufReader::new(file).take(desc.length))
    }

    /// Read one section into memory.
    pub fn read_section(&self, desc: &ImageDescriptor) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(desc.length as usize);
        self.section_reader(desc)?
            .read_to_end(&mut data)
            .map_err(|e| self.io_error("read section", e))?;
        if data.len() as u64 != desc.length {
            return Err(BuildError::validation(
                self.path.display().to_string(),
                format!("section {} is truncated", desc.id),
            ));
        }
        Ok(data)
    }

    /// Recompute every section digest and check the integrity block.
    pub fn verify(&self) -> Result<()> {
        for desc in &self.descriptors {
            let mut reader = self.section_reader(desc)?;
            let mut hasher = Sha256::new();
            std::io::copy(&mut reader, &mut hasher)
                .map_err(|e| self.io_error("read section", e))?;
            let actual: [u8; 32] = hasher.finalize().into();
            if actual != desc.digest {
                return Err(BuildError::validation(
                    self.path.display().to_string(),
                    format!(
                        "{} section {} digest mismatch: expected {}, got {}",
                        desc.kind,
                        desc.id,
                        desc.digest_hex(),
                        hex::encode(actual)
                    ),
                ));
            }
        }

        if let Some(block) = self.descriptor(DescriptorKind::Signature) {
            for (id, digest) in integrity::decode(&self.read_section(block)?)? {
                let described = self.descriptors.iter().find(|d| d.id == id).ok_or_else(|| {
                    BuildError::validation(
                        self.path.display().to_string(),
                        format!("integrity block names unknown section {}", id),
                    )
                })?;
                if described.digest != digest {
                    return Err(BuildError::validation(
                        self.path.display().to_string(),
                        format!("integrity block disagrees with section {}", id),
                    ));
                }
            }
        }

        tracing::debug!(image = %self.path.display(), "Image verified");
        Ok(())
    }

    /// Decode the metadata blob.
    pub fn metadata(&self) -> Result<BundleMetadata> {
        let desc = self.descriptor(DescriptorKind::Metadata).ok_or_else(|| {
            BuildError::validation(self.path.display().to_string(), "image has no metadata blob")
        })?;
        metadata::decode(&self.read_section(desc)?)
    }

    /// The system partition descriptor.
    pub fn system_partition(&self) -> Result<&ImageDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.kind == DescriptorKind::Partition && d.usage == PartitionUsage::System)
            .ok_or_else(|| {
                BuildError::validation(
                    self.path.display().to_string(),
                    "image has no system partition",
                )
            })
    }

    /// Unpack the system partition into `dest`.
    ///
    /// Returns special files that could not be created.
    pub fn extract_partition(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        let desc = self.system_partition()?;
        let packer = filesystem::for_type(desc.fs_type)?;
        let mut reader = self.section_reader(desc)?;

        tracing::debug!(
            image = %self.path.display(),
            dest = %dest.display(),
            fs_type = %desc.fs_type,
            "Extracting system partition"
        );
        packer.unpack(&mut reader, dest)
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> BuildError {
        BuildError::validation(
            self.path.display().to_string(),
            format!("failed to {}: {}", action, e),
        )
    }
}
