//! Global image header.

use a3s_image_core::error::{BuildError, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{read_u32, read_u64, DESCRIPTOR_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC};

/// Maximum length of the architecture field.
const ARCH_LEN: usize = 16;

/// Fixed-size header at the start of every image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: u32,
    /// Fresh for every build
    pub uuid: Uuid,
    /// Creation time, unix seconds
    pub created: i64,
    pub descriptor_offset: u64,
    pub descriptor_count: u32,
    pub descriptor_size: u32,
    pub data_offset: u64,
    pub data_len: u64,
    pub file_size: u64,
    /// OCI architecture name, e.g. `amd64`
    pub arch: String,
}

impl ImageHeader {
    /// Header for an image with `descriptor_count` descriptors and
    /// `data_len` bytes of sections.
    pub fn new(arch: impl Into<String>, descriptor_count: u32, data_len: u64) -> Self {
        let descriptor_offset = HEADER_SIZE as u64;
        let data_offset = descriptor_offset + u64::from(descriptor_count) * DESCRIPTOR_SIZE as u64;
        Self {
            version: FORMAT_VERSION,
            uuid: Uuid::new_v4(),
            created: Utc::now().timestamp(),
            descriptor_offset,
            descriptor_count,
            descriptor_size: DESCRIPTOR_SIZE as u32,
            data_offset,
            data_len,
            file_size: data_offset + data_len,
            arch: arch.into(),
        }
    }

    /// Creation time as a timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.created, 0)
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let arch = self.arch.as_bytes();
        if arch.len() > ARCH_LEN || !self.arch.is_ascii() {
            return Err(BuildError::validation(
                "image header",
                format!("architecture '{}' does not fit the header", self.arch),
            ));
        }

        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[16..32].copy_from_slice(self.uuid.as_bytes());
        buf[32..40].copy_from_slice(&self.created.to_le_bytes());
        buf[40..48].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[48..52].copy_from_slice(&self.descriptor_count.to_le_bytes());
        buf[52..56].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.data_len.to_le_bytes());
        buf[72..80].copy_from_slice(&self.file_size.to_le_bytes());
        buf[80..80 + arch.len()].copy_from_slice(arch);
        Ok(buf)
    }

    /// Decode and check magic and version.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(BuildError::validation(
                "image header",
                format!("header truncated: {} of {} bytes", buf.len(), HEADER_SIZE),
            ));
        }
        if buf[0..8] != MAGIC {
            return Err(BuildError::validation("image header", "bad magic"));
        }

        let version = read_u32(buf, 8);
        if version != FORMAT_VERSION {
            return Err(BuildError::validation(
                "image header",
                format!("unsupported format version {}", version),
            ));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[16..32]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&buf[32..40]);

        let arch_field = &buf[80..80 + ARCH_LEN];
        let arch_len = arch_field.iter().position(|&b| b == 0).unwrap_or(ARCH_LEN);
        let arch = std::str::from_utf8(&arch_field[..arch_len])
            .map_err(|_| BuildError::validation("image header", "architecture is not ASCII"))?
            .to_string();

        Ok(Self {
            version,
            uuid: Uuid::from_bytes(uuid),
            created: i64::from_le_bytes(created),
            descriptor_offset: read_u64(buf, 40),
            descriptor_count: read_u32(buf, 48),
            descriptor_size: read_u32(buf, 52),
            data_offset: read_u64(buf, 56),
            data_len: read_u64(buf, 64),
            file_size: read_u64(buf, 72),
            arch,
        })
    }
}

/// Whether `buf` starts with the image magic.
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= MAGIC.len() && buf[..MAGIC.len()] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_computes_layout() {
        let header = ImageHeader::new("amd64", 3, 1000);
        assert_eq!(header.descriptor_offset, 128);
        assert_eq!(header.data_offset, 128 + 3 * 80);
        assert_eq!(header.file_size, 128 + 240 + 1000);
        assert_eq!(header.version, FORMAT_VERSION);
    }

    #[test]
    fn test_encode_field_offsets() {
        let header = ImageHeader::new("arm64", 2, 10);
        let buf = header.encode().unwrap();
        assert_eq!(&buf[0..8], b"A3SIMAGE");
        assert_eq!(read_u32(&buf, 8), 1);
        assert_eq!(&buf[16..32], header.uuid.as_bytes());
        assert_eq!(read_u64(&buf, 40), 128);
        assert_eq!(read_u32(&buf, 48), 2);
        assert_eq!(read_u32(&buf, 52), 80);
        assert_eq!(read_u64(&buf, 72), header.file_size);
        assert_eq!(&buf[80..85], b"arm64");
        assert!(buf[85..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_restores_fields() {
        let header = ImageHeader::new("amd64", 2, 4096);
        let decoded = ImageHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.created_at().is_some());
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_version() {
        let mut buf = ImageHeader::new("amd64", 1, 0).encode().unwrap();
        buf[0] = b'X';
        assert!(ImageHeader::decode(&buf).is_err());

        let mut buf = ImageHeader::new("amd64", 1, 0).encode().unwrap();
        buf[8..12].copy_from_slice(&7u32.to_le_bytes());
        let err = ImageHeader::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("version 7"));

        assert!(ImageHeader::decode(&buf[..64]).is_err());
    }

    #[test]
    fn test_encode_rejects_long_arch() {
        let header = ImageHeader::new("a-very-long-architecture", 1, 0);
        assert!(header.encode().is_err());
    }

    #[test]
    fn test_has_magic() {
        assert!(has_magic(b"A3SIMAGE and more"));
        assert!(!has_magic(b"A3S"));
        assert!(!has_magic(b"\x1f\x8b\x08\x00\x00\x00\x00\x00"));
    }
}
