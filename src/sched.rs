//! Parallel I/O scheduler.
//!
//! A fixed-width pool of OS threads consumes an ordered vector of per-segment
//! descriptors. Claim order is monotone; completion order is unspecified.
//! One mutex guards `{next index, ok flag, transferred bytes, decile}`; the
//! decile progress line is the only output produced under it. The pool is
//! fail-fast: the first failure flips the ok flag and idle workers exit
//! without claiming further work. Workers never roll back; compensating
//! cleanup belongs to the operation driver.

use std::fs::File;
use std::time::Instant;

use log::info;
use parking_lot::Mutex;
use thiserror::Error;

use crate::shm;
use crate::transfer::{self, TransferError};

/// Transfer direction, from the file's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// File to memory (restore).
    Read,
    /// Memory to file (backup).
    Write,
}

/// Non-owning view of a segment mapping (or, in tests, a heap buffer).
#[derive(Debug)]
pub struct MemRegion {
    ptr: *mut u8,
    len: usize,
}

// A region is handed to exactly one worker at a time; the backing mapping is
// kept alive by its owner for the duration of the pool run.
unsafe impl Send for MemRegion {}

impl MemRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads (and writes, when used as a read
    /// target) of `len` bytes for as long as the region is in use, and no
    /// other code may access the range concurrently.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// One unit of work for the pool: a whole segment moved between a file and a
/// memory region, raw or compressed.
#[derive(Debug)]
pub struct IoDescriptor {
    pub key: u32,
    pub direction: Direction,
    pub compressed: bool,
    pub file: File,
    pub region: MemRegion,
    pub segment_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Target segment on restore; negative when no segment is involved.
    pub shmid: i32,
    pub check_crc: bool,
    /// CRC32 of the segment bytes observed during the transfer, when
    /// computed.
    pub crc32: Option<u32>,
}

impl IoDescriptor {
    fn perform(&mut self) -> Result<(), TransferError> {
        match self.direction {
            Direction::Write => {
                self.crc32 = if self.compressed {
                    Some(transfer::write_compressed(
                        &mut self.file,
                        self.region.as_slice(),
                    )?)
                } else {
                    transfer::write_raw(&self.file, self.region.as_slice(), self.check_crc)?
                };
                let _ = self.file.sync_all();
                transfer::apply_file_identity(&self.file, self.uid, self.gid, self.mode)?;
            }
            Direction::Read => {
                self.crc32 = if self.compressed {
                    transfer::read_compressed(
                        &mut self.file,
                        self.region.as_mut_slice(),
                        self.check_crc,
                    )?
                } else {
                    transfer::read_raw(&self.file, self.region.as_mut_slice(), self.check_crc)?
                };
                if self.shmid >= 0 {
                    shm::set_identity(self.shmid, self.uid, self.gid, self.mode)
                        .map_err(|err| TransferError::Io(control_error(err)))?;
                }
            }
        }
        Ok(())
    }
}

fn control_error(err: shm::ShmError) -> std::io::Error {
    std::io::Error::other(err)
}

/// First failure observed by the pool.
#[derive(Debug, Error)]
#[error("transfer failed for key {key:#010x}: {source}")]
pub struct PoolFailure {
    pub key: u32,
    pub source: TransferError,
}

struct Progress {
    next: usize,
    ok: bool,
    transferred: u64,
    decile: u32,
    failure: Option<PoolFailure>,
}

/// Runs every descriptor to completion on at most `max_threads` workers.
///
/// The descriptors are returned in submission order so the caller can read
/// back per-transfer CRC values; the result is `Err` if any transfer failed.
pub fn run_pool(
    descriptors: Vec<IoDescriptor>,
    max_threads: usize,
) -> (Vec<IoDescriptor>, Result<(), PoolFailure>) {
    if descriptors.is_empty() {
        return (descriptors, Ok(()));
    }
    let workers = descriptors.len().min(max_threads).max(1);
    let total: u64 = descriptors.iter().map(|io| io.segment_size).sum();
    let slots: Vec<Mutex<IoDescriptor>> = descriptors.into_iter().map(Mutex::new).collect();
    let progress = Mutex::new(Progress {
        next: 0,
        ok: true,
        transferred: 0,
        decile: 0,
        failure: None,
    });
    let started = Instant::now();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| run_worker(&slots, &progress, total, started));
        }
    });

    let progress = progress.into_inner();
    info!(
        "event=transfer_pass segments={} bytes={} elapsed={:.1}s ok={}",
        slots.len(),
        progress.transferred,
        started.elapsed().as_secs_f64(),
        progress.ok
    );
    let descriptors = slots.into_iter().map(Mutex::into_inner).collect();
    match progress.failure {
        Some(failure) => (descriptors, Err(failure)),
        None => (descriptors, Ok(())),
    }
}

fn run_worker(
    slots: &[Mutex<IoDescriptor>],
    progress: &Mutex<Progress>,
    total: u64,
    started: Instant,
) {
    loop {
        let index = {
            let mut progress = progress.lock();
            if !progress.ok {
                return;
            }
            let index = progress.next;
            progress.next += 1;
            index
        };
        if index >= slots.len() {
            return;
        }

        // Uncontended: claim order guarantees each slot is taken once.
        let mut descriptor = slots[index].lock();
        match descriptor.perform() {
            Ok(()) => {
                let mut progress = progress.lock();
                progress.transferred += descriptor.segment_size;
                if total > 0 {
                    let decile = (progress.transferred * 10 / total) as u32;
                    if decile != progress.decile {
                        progress.decile = decile;
                        info!(
                            "event=transfer_progress percent={} elapsed={:.1}s",
                            decile * 10,
                            started.elapsed().as_secs_f64()
                        );
                    }
                }
            }
            Err(source) => {
                let mut progress = progress.lock();
                progress.ok = false;
                if progress.failure.is_none() {
                    progress.failure = Some(PoolFailure {
                        key: descriptor.key,
                        source,
                    });
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn descriptor_for(file: File, buf: &mut [u8], direction: Direction) -> IoDescriptor {
        IoDescriptor {
            key: 0xAE00_1100,
            direction,
            compressed: false,
            file,
            region: unsafe { MemRegion::from_raw_parts(buf.as_mut_ptr(), buf.len()) },
            segment_size: buf.len() as u64,
            uid: unsafe { libc::getuid() } as u32,
            gid: unsafe { libc::getgid() } as u32,
            mode: 0o644,
            shmid: -1,
            check_crc: true,
            crc32: None,
        }
    }

    #[test]
    fn pool_writes_every_descriptor() {
        let dir = tempdir().unwrap();
        let mut buffers: Vec<Vec<u8>> = (0..8u8)
            .map(|seed| vec![seed.wrapping_mul(37); 16 * 1024])
            .collect();
        let mut descriptors = Vec::new();
        for (index, buf) in buffers.iter_mut().enumerate() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(dir.path().join(format!("{index}.dat")))
                .unwrap();
            descriptors.push(descriptor_for(file, buf, Direction::Write));
        }

        let (descriptors, result) = run_pool(descriptors, 3);
        result.unwrap();
        for (descriptor, buf) in descriptors.iter().zip(&buffers) {
            assert_eq!(descriptor.crc32, Some(crate::transfer::crc32_of(buf)));
        }
        for index in 0..buffers.len() {
            let written = std::fs::read(dir.path().join(format!("{index}.dat"))).unwrap();
            assert_eq!(written, buffers[index]);
        }
    }

    #[test]
    fn pool_reports_the_failing_key() {
        let dir = tempdir().unwrap();
        // A read from an empty file fails with UnexpectedEof.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.path().join("short.dat"))
            .unwrap();
        file.write_all(b"tiny").unwrap();

        let mut buf = vec![0u8; 4096];
        let mut descriptor = descriptor_for(file, &mut buf, Direction::Read);
        descriptor.key = 0xAE00_1001;

        let (_descriptors, result) = run_pool(vec![descriptor], 4);
        let failure = result.unwrap_err();
        assert_eq!(failure.key, 0xAE00_1001);
    }
}
