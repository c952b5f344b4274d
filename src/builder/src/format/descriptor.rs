//! Descriptor table records.

use a3s_image_core::error::{BuildError, Result};

use super::{read_u32, read_u64, DESCRIPTOR_SIZE};
use crate::filesystem::FsType;

/// What a section holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorKind {
    Partition = 1,
    Metadata = 2,
    Signature = 3,
}

impl DescriptorKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(DescriptorKind::Partition),
            2 => Some(DescriptorKind::Metadata),
            3 => Some(DescriptorKind::Signature),
            _ => None,
        }
    }
}

impl std::fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DescriptorKind::Partition => "partition",
            DescriptorKind::Metadata => "metadata",
            DescriptorKind::Signature => "signature",
        };
        write!(f, "{}", name)
    }
}

/// Role of a filesystem partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PartitionUsage {
    None = 0,
    /// The primary root filesystem
    System = 1,
}

impl PartitionUsage {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PartitionUsage::None),
            1 => Some(PartitionUsage::System),
            _ => None,
        }
    }
}

/// One entry of the descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub kind: DescriptorKind,
    /// 1-based position in the table
    pub id: u32,
    pub offset: u64,
    pub length: u64,
    pub fs_type: FsType,
    pub usage: PartitionUsage,
    /// Described section for signature blocks, 0 otherwise
    pub link: u32,
    /// SHA-256 of the section bytes
    pub digest: [u8; 32],
}

impl ImageDescriptor {
    pub fn partition(id: u32, fs_type: FsType) -> Self {
        Self {
            kind: DescriptorKind::Partition,
            id,
            offset: 0,
            length: 0,
            fs_type,
            usage: PartitionUsage::System,
            link: 0,
            digest: [0u8; 32],
        }
    }

    pub fn metadata(id: u32) -> Self {
        Self {
            kind: DescriptorKind::Metadata,
            id,
            offset: 0,
            length: 0,
            fs_type: FsType::None,
            usage: PartitionUsage::None,
            link: 0,
            digest: [0u8; 32],
        }
    }

    pub fn signature(id: u32, link: u32) -> Self {
        Self {
            kind: DescriptorKind::Signature,
            id,
            offset: 0,
            length: 0,
            fs_type: FsType::None,
            usage: PartitionUsage::None,
            link,
            digest: [0u8; 32],
        }
    }

    /// Hex form of the section digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.fs_type.code().to_le_bytes());
        buf[28..32].copy_from_slice(&(self.usage as u32).to_le_bytes());
        buf[32..36].copy_from_slice(&self.link.to_le_bytes());
        buf[48..80].copy_from_slice(&self.digest);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(BuildError::validation(
                "descriptor table",
                format!("descriptor truncated: {} of {} bytes", buf.len(), DESCRIPTOR_SIZE),
            ));
        }

        let id = read_u32(buf, 4);
        let invalid = |field: &str, code: u32| {
            BuildError::validation(
                "descriptor table",
                format!("descriptor {} has unknown {} {}", id, field, code),
            )
        };

        let kind_code = read_u32(buf, 0);
        let kind = DescriptorKind::from_code(kind_code).ok_or_else(|| invalid("kind", kind_code))?;
        let fs_code = read_u32(buf, 24);
        let fs_type = FsType::from_code(fs_code).ok_or_else(|| invalid("filesystem type", fs_code))?;
        let usage_code = read_u32(buf, 28);
        let usage =
            PartitionUsage::from_code(usage_code).ok_or_else(|| invalid("usage", usage_code))?;

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[48..80]);

        Ok(Self {
            kind,
            id,
            offset: read_u64(buf, 8),
            length: read_u64(buf, 16),
            fs_type,
            usage,
            link: read_u32(buf, 32),
            digest,
        })
    }
}
