//! Candidate discovery: live segments from the kernel, segment files from a
//! directory. Both scans classify every candidate through the key codec,
//! apply the instance and namespace filters, and return a key-ascending
//! sequence plus the last per-candidate error so callers can tell an empty
//! result from a broken one.

pub mod files;
pub mod segments;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use files::{list_files, parse_file_name, segment_file_name, FileRecord, FileScan};
pub use segments::{list_segments, SegmentRecord, SegmentScan};

use crate::shm::ShmError;

/// Filter applied during both scans.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Server instance to match.
    pub instance: u8,
    /// Namespace name to match for base and data candidates; `None` keeps
    /// all names.
    pub namespace: Option<String>,
    /// Whether to stream every segment for a CRC32 during the scan.
    pub compute_crc: bool,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    /// The kernel refused shared-memory enumeration outright.
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("cannot open directory {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
}
