//! Safe wrappers around the System V shared memory surface.
//!
//! Everything the crate needs from the kernel goes through this module:
//! table-index enumeration, per-segment stat, exclusive creation, attachment
//! with guaranteed detach, permission transfer, and removal.

use std::io;
use std::ptr::{self, NonNull};

use thiserror::Error;

use crate::sched::MemRegion;

// Not exposed by the `libc` crate on Linux, but part of the stable kernel
// IPC ABI (see linux/shm.h).
const SHM_STAT: libc::c_int = 13;
const SHM_INFO: libc::c_int = 14;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory enumeration failed: {0}")]
    Enumerate(#[source] io::Error),
    #[error("stat of shared memory index {index} failed: {source}")]
    Stat { index: i32, source: io::Error },
    #[error("segment with key {0:#010x} already exists")]
    AlreadyExists(u32),
    #[error("could not create segment with key {key:#010x}: {source}")]
    Create { key: u32, source: io::Error },
    #[error("could not attach segment shmid {shmid}: {source}")]
    Attach { shmid: i32, source: io::Error },
    #[error("shmctl({op}) on shmid {shmid} failed: {source}")]
    Control {
        op: &'static str,
        shmid: i32,
        source: io::Error,
    },
}

/// Kernel-reported facts about one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStat {
    pub shmid: i32,
    pub key: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attach_count: u64,
    pub byte_size: u64,
}

/// Upper bound on shared-memory-segment table indices, from `SHM_INFO`.
pub fn max_segment_index() -> Result<i32, ShmError> {
    // SHM_INFO fills a struct shm_info, which is smaller than shmid_ds; a
    // zeroed shmid_ds is a safe landing pad and only the return code
    // matters here.
    let mut dummy: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(0, SHM_INFO, &mut dummy) };
    if rc < 0 {
        return Err(ShmError::Enumerate(io::Error::last_os_error()));
    }
    Ok(rc)
}

/// Stats the segment occupying table index `index`, if any.
///
/// Holes in the table are normal; callers treat the error as a skip.
pub fn stat_index(index: i32) -> Result<SegmentStat, ShmError> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(index, SHM_STAT, &mut ds) };
    if rc < 0 {
        return Err(ShmError::Stat {
            index,
            source: io::Error::last_os_error(),
        });
    }
    Ok(SegmentStat {
        shmid: rc,
        key: ds.shm_perm.__key as u32,
        uid: ds.shm_perm.uid as u32,
        gid: ds.shm_perm.gid as u32,
        mode: ds.shm_perm.mode as u32,
        attach_count: ds.shm_nattch as u64,
        byte_size: ds.shm_segsz as u64,
    })
}

/// Creates a segment for `key`, failing if one already exists.
pub fn create_exclusive(key: u32, size: u64, mode: u32) -> Result<i32, ShmError> {
    let flags = libc::IPC_CREAT | libc::IPC_EXCL | (mode as i32 & 0o777);
    let shmid = unsafe { libc::shmget(key as libc::key_t, size as libc::size_t, flags) };
    if shmid < 0 {
        let err = io::Error::last_os_error();
        // The kernel reports ENOENT for a size clash on an existing key.
        return match err.raw_os_error() {
            Some(libc::EEXIST) | Some(libc::ENOENT) => Err(ShmError::AlreadyExists(key)),
            _ => Err(ShmError::Create { key, source: err }),
        };
    }
    Ok(shmid)
}

/// Looks up the shmid of an existing segment by key.
pub fn lookup(key: u32) -> io::Result<i32> {
    let shmid = unsafe { libc::shmget(key as libc::key_t, 0, 0) };
    if shmid < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(shmid)
}

/// Whether any live segment currently carries `key`.
pub fn key_exists(key: u32) -> bool {
    lookup(key).is_ok()
}

/// Marks the segment for destruction.
pub fn remove(shmid: i32) -> Result<(), ShmError> {
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
    if rc < 0 {
        return Err(ShmError::Control {
            op: "IPC_RMID",
            shmid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Applies `(uid, gid, mode & 0o777)` to the segment's permission structure.
pub fn set_identity(shmid: i32, uid: u32, gid: u32, mode: u32) -> Result<(), ShmError> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) };
    if rc < 0 {
        return Err(ShmError::Control {
            op: "IPC_STAT",
            shmid,
            source: io::Error::last_os_error(),
        });
    }
    ds.shm_perm.uid = uid as _;
    ds.shm_perm.gid = gid as _;
    ds.shm_perm.mode = (mode & 0o777) as _;
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_SET, &mut ds) };
    if rc < 0 {
        return Err(ShmError::Control {
            op: "IPC_SET",
            shmid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// RAII attachment to a segment; detaches exactly once on every path.
#[derive(Debug)]
pub struct ShmAttachment {
    addr: NonNull<u8>,
    len: usize,
    shmid: i32,
}

impl ShmAttachment {
    /// Attaches read-only, for measuring and backup sources.
    pub fn read_only(shmid: i32, len: u64) -> Result<Self, ShmError> {
        Self::attach(shmid, len, libc::SHM_RDONLY)
    }

    /// Attaches read-write, for restore targets.
    pub fn read_write(shmid: i32, len: u64) -> Result<Self, ShmError> {
        Self::attach(shmid, len, 0)
    }

    fn attach(shmid: i32, len: u64, flags: i32) -> Result<Self, ShmError> {
        let addr = unsafe { libc::shmat(shmid, ptr::null(), flags) };
        if addr as isize == -1 {
            return Err(ShmError::Attach {
                shmid,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            addr: NonNull::new(addr as *mut u8).expect("shmat returned NULL"),
            len: len as usize,
            shmid,
        })
    }

    pub fn shmid(&self) -> i32 {
        self.shmid
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    /// Non-owning view of the mapping for an I/O descriptor.
    ///
    /// The attachment must outlive every use of the returned region, and the
    /// caller must not touch the mapping through other means while a worker
    /// owns the region.
    pub fn region(&self) -> MemRegion {
        unsafe { MemRegion::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for ShmAttachment {
    fn drop(&mut self) {
        let rc = unsafe { libc::shmdt(self.addr.as_ptr() as *const libc::c_void) };
        if rc < 0 {
            log::error!(
                "event=shmdt_failed shmid={} error={}",
                self.shmid,
                io::Error::last_os_error()
            );
        }
    }
}

// The mapping is process-wide; the guard can move between threads.
unsafe impl Send for ShmAttachment {}
