//! Live segment enumeration.

use log::debug;

use crate::header::{self, DATA_NAMESPACE_OFFSET};
use crate::inventory::{InventoryError, ScanFilter};
use crate::key::{KeyClass, SegmentKey};
use crate::shm::{self, ShmAttachment, ShmError};
use crate::transfer;

/// One unattached segment that passed classification and filtering.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub key: SegmentKey,
    pub raw_key: u32,
    pub shmid: i32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attach_count: u64,
    pub byte_size: u64,
    /// Embedded namespace name; populated for base and data segments.
    pub namespace: Option<String>,
    /// Structural metadata; populated for base segments large enough to
    /// carry it.
    pub base: Option<header::BaseHeader>,
    /// Declared secondary arena count; populated for meta segments.
    pub meta_arena_count: Option<u32>,
    /// Whole-segment CRC32, when the scan was asked to compute it.
    pub crc32: Option<u32>,
}

/// Result of a segment scan. `records` is sorted by key ascending and is
/// meaningful even when `last_error` is set.
#[derive(Debug)]
pub struct SegmentScan {
    pub records: Vec<SegmentRecord>,
    pub last_error: Option<ShmError>,
}

/// Enumerates every shared-memory table index the kernel reports, keeping
/// the unattached segments that decode under the key scheme and pass
/// `filter`.
pub fn list_segments(filter: &ScanFilter) -> Result<SegmentScan, InventoryError> {
    let max_index = shm::max_segment_index()?;
    let mut records = Vec::new();
    let mut last_error = None;

    for index in 0..=max_index {
        let stat = match shm::stat_index(index) {
            Ok(stat) => stat,
            Err(err) => {
                // Holes in the table are normal; keep the error observable.
                last_error = Some(err);
                continue;
            }
        };
        let key = match SegmentKey::decode(stat.key) {
            Ok(key) => key,
            Err(_) => continue,
        };
        if stat.attach_count != 0 {
            // A process is mapping it; the server is likely still running.
            debug!(
                "event=segment_skipped key={:08x} attach_count={}",
                stat.key, stat.attach_count
            );
            continue;
        }
        if key.instance != filter.instance {
            continue;
        }

        let mut record = SegmentRecord {
            key,
            raw_key: stat.key,
            shmid: stat.shmid,
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
            attach_count: stat.attach_count,
            byte_size: stat.byte_size,
            namespace: None,
            base: None,
            meta_arena_count: None,
            crc32: None,
        };

        let needs_body = filter.compute_crc
            || key.is_base()
            || key.is_meta()
            || key.class == KeyClass::Data;
        if needs_body {
            // Attach once, read every field we need, detach before moving on.
            let attachment = match ShmAttachment::read_only(stat.shmid, stat.byte_size) {
                Ok(attachment) => attachment,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            let body = attachment.bytes();
            if key.is_base() {
                if let Ok(base) = header::read_base_header(body) {
                    record.namespace = Some(base.namespace.clone());
                    record.base = Some(base);
                }
            } else if key.is_meta() {
                record.meta_arena_count = header::read_meta_arena_count(body).ok();
            } else if key.class == KeyClass::Data {
                record.namespace = header::read_namespace_name(body, DATA_NAMESPACE_OFFSET).ok();
            }
            if filter.compute_crc {
                record.crc32 = Some(transfer::crc32_of(body));
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
    Ok(SegmentScan {
        records,
        last_error,
    })
}

impl SegmentRecord {
    pub fn stage_ordinal(&self) -> Option<u16> {
        self.key.role.stage_ordinal()
    }
}
