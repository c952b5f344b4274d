//! Single-file image format.
//!
//! ```text
//! ┌──────────────────────────┐ 0
//! │ header (HEADER_SIZE)     │
//! ├──────────────────────────┤ HEADER_SIZE
//! │ descriptor table         │ count × DESCRIPTOR_SIZE
//! ├──────────────────────────┤ data offset
//! │ filesystem partition     │
//! │ metadata blob            │
//! │ integrity block          │ (optional)
//! └──────────────────────────┘ file size
//! ```
//!
//! All integers are little-endian. Sections follow the table in table
//! order with no gaps, so descriptor lengths sum to
//! `file size - header - table`.

pub mod descriptor;
pub mod header;
pub mod integrity;
pub mod metadata;
pub mod reader;

pub use descriptor::{DescriptorKind, ImageDescriptor, PartitionUsage};
pub use header::ImageHeader;
pub use reader::ImageFile;

/// Leading bytes of every image.
pub const MAGIC: [u8; 8] = *b"A3SIMAGE";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the global header in bytes.
pub const HEADER_SIZE: usize = 128;

/// Size of one descriptor record in bytes.
pub const DESCRIPTOR_SIZE: usize = 80;

/// Read a little-endian `u32` at `offset`. Callers check bounds.
pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Read a little-endian `u64` at `offset`. Callers check bounds.
pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
