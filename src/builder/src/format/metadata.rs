//! Metadata blob encoding.
//!
//! ```text
//! u16 version
//! record*: [u16 tag][u32 len][payload]
//! ```
//!
//! Key/value payloads are `[u32 klen][key][u32 vlen][value]`. Environment
//! records are written in key order, labels in insertion order. Decoders
//! skip tags they do not know.

use a3s_image_core::error::{BuildError, Result};

use crate::bundle::BundleMetadata;

/// Encoding version of the metadata blob.
pub const METADATA_VERSION: u16 = 1;

const TAG_SOURCE: u16 = 1;
const TAG_ENV: u16 = 2;
const TAG_LABEL: u16 = 3;
const TAG_RUNSCRIPT: u16 = 4;
const TAG_TEST_SCRIPT: u16 = 5;

/// Encode bundle metadata into a blob.
pub fn encode(metadata: &BundleMetadata) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&METADATA_VERSION.to_le_bytes());

    push_record(&mut buf, TAG_SOURCE, metadata.source.as_bytes());
    for (key, value) in &metadata.environment {
        push_record(&mut buf, TAG_ENV, &key_value(key, value));
    }
    for (key, value) in &metadata.labels {
        push_record(&mut buf, TAG_LABEL, &key_value(key, value));
    }
    if let Some(ref script) = metadata.runscript {
        push_record(&mut buf, TAG_RUNSCRIPT, script.as_bytes());
    }
    if let Some(ref script) = metadata.test_script {
        push_record(&mut buf, TAG_TEST_SCRIPT, script.as_bytes());
    }
    buf
}

/// Decode a metadata blob.
pub fn decode(data: &[u8]) -> Result<BundleMetadata> {
    let mut cursor = Cursor::new(data);
    let version = cursor.u16()?;
    if version != METADATA_VERSION {
        return Err(invalid(format!("unsupported metadata version {}", version)));
    }

    let mut metadata = BundleMetadata::default();
    while !cursor.is_empty() {
        let tag = cursor.u16()?;
        let len = cursor.u32()? as usize;
        let payload = cursor.take(len)?;

        match tag {
            TAG_SOURCE => metadata.source = utf8(payload)?,
            TAG_ENV => {
                let (key, value) = split_key_value(payload)?;
                metadata.environment.insert(key, value);
            }
            TAG_LABEL => {
                let (key, value) = split_key_value(payload)?;
                metadata.labels.push((key, value));
            }
            TAG_RUNSCRIPT => metadata.runscript = Some(utf8(payload)?),
            TAG_TEST_SCRIPT => metadata.test_script = Some(utf8(payload)?),
            other => tracing::debug!(tag = other, len, "Skipping unknown metadata record"),
        }
    }
    Ok(metadata)
}

fn push_record(buf: &mut Vec<u8>, tag: u16, payload: &[u8]) {
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

fn key_value(key: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + key.len() + value.len());
    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.extend_from_slice(value.as_bytes());
    payload
}

fn split_key_value(payload: &[u8]) -> Result<(String, String)> {
    let mut cursor = Cursor::new(payload);
    let key_len = cursor.u32()? as usize;
    let key = utf8(cursor.take(key_len)?)?;
    let value_len = cursor.u32()? as usize;
    let value = utf8(cursor.take(value_len)?)?;
    if !cursor.is_empty() {
        return Err(invalid("trailing bytes in key/value record".to_string()));
    }
    Ok((key, value))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| invalid(format!("invalid UTF-8: {}", e)))
}

fn invalid(message: String) -> BuildError {
    BuildError::validation("metadata blob", message)
}

/// Bounds-checked little-endian reader.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                invalid(format!(
                    "record truncated at byte {}: need {} of {} remaining",
                    self.pos,
                    len,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
