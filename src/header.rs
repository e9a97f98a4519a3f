//! Fixed byte layouts read from segment bodies and segment files.
//!
//! The server writes its structural metadata at known offsets; this tool only
//! ever reads those fields, it never interprets index content.

use thiserror::Error;

/// Namespace names are NUL-padded to this length.
pub const NAMESPACE_NAME_LEN: usize = 32;
/// Offset of the namespace name in a base segment or base file.
pub const BASE_NAMESPACE_OFFSET: usize = 1024;
/// Offset of the namespace name in a data segment or data file.
pub const DATA_NAMESPACE_OFFSET: usize = 12;

const BASE_VERSION_OFFSET: usize = 0;
const BASE_SHUTDOWN_OFFSET: usize = 4;
const BASE_ARENA_COUNT_OFFSET: usize = 2152;
const META_ARENA_COUNT_OFFSET: usize = 20;

/// Bytes of a base body needed to read every field this tool consumes.
pub const MIN_BASE_BODY: usize = BASE_ARENA_COUNT_OFFSET + 4;
/// Bytes of a meta body needed to read the declared arena count.
pub const MIN_META_BODY: usize = META_ARENA_COUNT_OFFSET + 4;
/// Bytes of a data body needed to read the namespace name.
pub const MIN_DATA_BODY: usize = DATA_NAMESPACE_OFFSET + NAMESPACE_NAME_LEN;

/// Structural metadata declared by a base segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseHeader {
    pub version: u32,
    pub shutdown_status: u32,
    pub namespace: String,
    pub arena_count: u32,
}

/// Reads the base fields from a segment body or raw file prefix.
pub fn read_base_header(body: &[u8]) -> Result<BaseHeader, HeaderError> {
    Ok(BaseHeader {
        version: read_u32(body, BASE_VERSION_OFFSET)?,
        shutdown_status: read_u32(body, BASE_SHUTDOWN_OFFSET)?,
        namespace: read_namespace_name(body, BASE_NAMESPACE_OFFSET)?,
        arena_count: read_u32(body, BASE_ARENA_COUNT_OFFSET)?,
    })
}

/// Reads the declared secondary arena count from a meta body.
pub fn read_meta_arena_count(body: &[u8]) -> Result<u32, HeaderError> {
    read_u32(body, META_ARENA_COUNT_OFFSET)
}

/// Reads the NUL-padded namespace name at `offset`.
pub fn read_namespace_name(body: &[u8], offset: usize) -> Result<String, HeaderError> {
    let end = offset + NAMESPACE_NAME_LEN;
    if body.len() < end {
        return Err(HeaderError::BodyTooShort {
            needed: end,
            have: body.len(),
        });
    }
    let raw = &body[offset..end];
    let name = match raw.iter().position(|byte| *byte == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    };
    Ok(String::from_utf8_lossy(name).into_owned())
}

fn read_u32(body: &[u8], offset: usize) -> Result<u32, HeaderError> {
    let end = offset + 4;
    if body.len() < end {
        return Err(HeaderError::BodyTooShort {
            needed: end,
            have: body.len(),
        });
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&body[offset..end]);
    Ok(u32::from_le_bytes(bytes))
}

/// Magic written at the head of every compressed segment file.
pub const SEGMENT_FILE_MAGIC: u32 = 0x544D_5341;
/// Byte-swapped magic emitted by earlier releases; accepted on read.
pub const SEGMENT_FILE_MAGIC_LEGACY: u32 = 0x4153_4D54;
/// Compressed file format version.
pub const SEGMENT_FILE_VERSION: u32 = 1;
/// Size of the fixed header preceding the gzip stream.
pub const SEGMENT_FILE_HEADER_LEN: usize = 20;

/// Little-endian header at offset 0 of every compressed segment file:
/// `{magic: u32, version: u32, segment_size: u64, crc32: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedHeader {
    pub magic: u32,
    pub version: u32,
    pub segment_size: u64,
    pub crc32: u32,
}

impl CompressedHeader {
    pub fn new(segment_size: u64, crc32: u32) -> Self {
        Self {
            magic: SEGMENT_FILE_MAGIC,
            version: SEGMENT_FILE_VERSION,
            segment_size,
            crc32,
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_FILE_HEADER_LEN] {
        let mut bytes = [0u8; SEGMENT_FILE_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.crc32.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < SEGMENT_FILE_HEADER_LEN {
            return Err(HeaderError::TruncatedHeader { have: bytes.len() });
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != SEGMENT_FILE_MAGIC && magic != SEGMENT_FILE_MAGIC_LEGACY {
            return Err(HeaderError::BadMagic(magic));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != SEGMENT_FILE_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            segment_size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            crc32: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("body too short: need {needed} bytes, have {have}")]
    BodyTooShort { needed: usize, have: usize },
    #[error("segment file header truncated at {have} bytes")]
    TruncatedHeader { have: usize },
    #[error("bad segment file magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported segment file version {0}")]
    UnsupportedVersion(u32),
}
