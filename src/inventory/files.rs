//! Segment file enumeration.
//!
//! File names fully encode the segment key: eight hex digits followed by
//! `.dat` (raw) or `.dat.gz` (compressed). For compressed files the segment
//! size comes from the embedded header, never from the file size.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::warn;

use crate::header::{self, DATA_NAMESPACE_OFFSET, MIN_BASE_BODY, MIN_DATA_BODY, MIN_META_BODY};
use crate::inventory::{InventoryError, ScanFilter};
use crate::key::{KeyClass, SegmentKey};
use crate::transfer;

const RAW_EXTENSION: &str = ".dat";
const COMPRESSED_EXTENSION: &str = ".dat.gz";

/// Largest inflated prefix read to extract a name from a compressed data
/// file.
const NAME_PREFIX_INFLATED_MAX: usize = 1 << 20;

/// One segment file that passed classification and filtering.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub key: SegmentKey,
    pub raw_key: u32,
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Uncompressed segment size.
    pub segment_size: u64,
    /// On-disk size; differs from `segment_size` for compressed files.
    pub file_size: u64,
    pub compressed: bool,
    pub namespace: Option<String>,
    pub base: Option<header::BaseHeader>,
    pub meta_arena_count: Option<u32>,
}

impl FileRecord {
    pub fn stage_ordinal(&self) -> Option<u16> {
        self.key.role.stage_ordinal()
    }
}

/// Result of a directory scan. `records` is sorted by key ascending and is
/// meaningful even when `last_error` is set.
#[derive(Debug)]
pub struct FileScan {
    pub records: Vec<FileRecord>,
    pub last_error: Option<io::Error>,
}

/// Canonical file name for a key.
pub fn segment_file_name(raw_key: u32, compressed: bool) -> String {
    if compressed {
        format!("{raw_key:08x}{COMPRESSED_EXTENSION}")
    } else {
        format!("{raw_key:08x}{RAW_EXTENSION}")
    }
}

/// Parses a candidate file name into `(key, compressed)`. Case of the hex
/// digits is not significant; anything else is rejected.
pub fn parse_file_name(name: &str) -> Option<(u32, bool)> {
    let (stem, compressed) = if let Some(stem) = name.strip_suffix(COMPRESSED_EXTENSION) {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(RAW_EXTENSION) {
        (stem, false)
    } else {
        return None;
    };
    if stem.len() != 8 || !stem.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    let raw_key = u32::from_str_radix(stem, 16).ok()?;
    Some((raw_key, compressed))
}

/// Scans `dir` for segment files that decode under the key scheme and pass
/// `filter`.
pub fn list_files(dir: &Path, filter: &ScanFilter) -> Result<FileScan, InventoryError> {
    let entries = fs::read_dir(dir).map_err(|source| InventoryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    let mut last_error = None;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                last_error = Some(err);
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((raw_key, compressed)) = parse_file_name(name) else {
            continue;
        };
        let key = match SegmentKey::decode(raw_key) {
            Ok(key) => key,
            Err(_) => continue,
        };
        if key.instance != filter.instance {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                last_error = Some(err);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        if compressed && (key.is_base() || key.is_meta()) {
            // Base and meta segments are never written compressed.
            warn!("event=file_skipped path={} reason=compressed_header_role", name);
            continue;
        }

        let path = entry.path();
        let mut record = FileRecord {
            key,
            raw_key,
            path: path.clone(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode(),
            segment_size: metadata.len(),
            file_size: metadata.len(),
            compressed,
            namespace: None,
            base: None,
            meta_arena_count: None,
        };

        match populate_body_fields(&path, &mut record) {
            Ok(()) => {}
            Err(err) => {
                warn!("event=file_unreadable path={} error={}", path.display(), err);
                last_error = Some(io::Error::other(err));
                continue;
            }
        }

        if let Some(want) = filter.namespace.as_deref() {
            let named = key.is_base() || key.class == KeyClass::Data;
            if named && record.namespace.as_deref() != Some(want) {
                continue;
            }
        }

        records.push(record);
    }

    records.sort_by_key(|record| record.raw_key);
    Ok(FileScan {
        records,
        last_error,
    })
}

fn populate_body_fields(
    path: &Path,
    record: &mut FileRecord,
) -> Result<(), transfer::TransferError> {
    if record.compressed {
        let mut file = File::open(path)?;
        let file_header = transfer::read_file_header(&mut file)?;
        record.segment_size = file_header.segment_size;
        if record.key.class == KeyClass::Data {
            let prefix = transfer::inflate_prefix(&mut file, NAME_PREFIX_INFLATED_MAX)?;
            record.namespace = header::read_namespace_name(&prefix, DATA_NAMESPACE_OFFSET).ok();
        }
        return Ok(());
    }

    if record.key.is_base() {
        let prefix = read_prefix(path, MIN_BASE_BODY)?;
        if let Ok(base) = header::read_base_header(&prefix) {
            record.namespace = Some(base.namespace.clone());
            record.base = Some(base);
        }
    } else if record.key.is_meta() {
        let prefix = read_prefix(path, MIN_META_BODY)?;
        record.meta_arena_count = header::read_meta_arena_count(&prefix).ok();
    } else if record.key.class == KeyClass::Data {
        let prefix = read_prefix(path, MIN_DATA_BODY)?;
        record.namespace = header::read_namespace_name(&prefix, DATA_NAMESPACE_OFFSET).ok();
    }
    Ok(())
}

/// Reads up to `len` leading bytes; short files yield a short prefix.
fn read_prefix(path: &Path, len: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut prefix = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}
