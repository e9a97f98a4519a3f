//! End-to-end backup and restore against real System V segments.
//!
//! Uses high instance numbers, high namespace ids, and improbable namespace
//! names so a developer machine's real segments are never touched. Each test
//! owns a distinct instance because the scan's instance filter runs before
//! any attachment, which keeps parallel tests from observing each other's
//! transient attach counts. Every created segment is registered with a guard
//! that destroys leftovers even when an assertion fails.

use std::fs;
use std::path::PathBuf;

use shmvault::group::VersionWindow;
use shmvault::shm::{self, ShmAttachment};
use shmvault::{driver, Config, Mode};
use tempfile::TempDir;

const NS: &str = "vault-selftest";
const BASE_KEY: u32 = 0xAEF2_0000;
const TREE_KEY: u32 = 0xAEF2_0001;
const STAGE_KEY: u32 = 0xAEF2_0100;
const BASE_SIZE: u64 = 4096;
const STAGE_SIZE: u64 = 64 * 1024;

const BASE_NAMESPACE_OFFSET: usize = 1024;
const BASE_ARENA_COUNT_OFFSET: usize = 2152;

/// Destroys whatever test segments still exist when dropped.
struct KeyGuard(&'static [u32]);

impl Drop for KeyGuard {
    fn drop(&mut self) {
        for key in self.0 {
            if let Ok(shmid) = shm::lookup(*key) {
                let _ = shm::remove(shmid);
            }
        }
    }
}

fn fill_segment(key: u32, size: u64, body: &[u8]) -> i32 {
    let shmid = shm::create_exclusive(key, size, 0o640).unwrap();
    let attachment = ShmAttachment::read_write(shmid, size).unwrap();
    let mut region = attachment.region();
    region.as_mut_slice()[..body.len()].copy_from_slice(body);
    shmid
}

fn base_body() -> Vec<u8> {
    let mut body = vec![0u8; BASE_SIZE as usize];
    body[0..4].copy_from_slice(&10u32.to_le_bytes());
    body[4..8].copy_from_slice(&1u32.to_le_bytes());
    body[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + NS.len()].copy_from_slice(NS.as_bytes());
    body[BASE_ARENA_COUNT_OFFSET..BASE_ARENA_COUNT_OFFSET + 4]
        .copy_from_slice(&1u32.to_le_bytes());
    body
}

fn stage_body() -> Vec<u8> {
    (0..STAGE_SIZE as usize).map(|i| (i % 249) as u8).collect()
}

fn config(mode: Mode, instance: u8, dir: PathBuf) -> Config {
    Config {
        mode,
        analyze: false,
        check_crc: true,
        compress: false,
        verbose: false,
        instance,
        namespaces: vec![NS.to_string()],
        dir,
        threads: 2,
        version_window: VersionWindow::default(),
    }
}

fn read_segment(key: u32, size: u64) -> Vec<u8> {
    let shmid = shm::lookup(key).unwrap();
    let attachment = ShmAttachment::read_only(shmid, size).unwrap();
    attachment.bytes().to_vec()
}

fn segment_mode(key: u32) -> u32 {
    let shmid = shm::lookup(key).unwrap();
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) };
    assert_eq!(rc, 0);
    ds.shm_perm.mode as u32 & 0o777
}

#[test]
fn backup_then_restore_reconstitutes_segments_bit_for_bit() {
    let _guard = KeyGuard(&[BASE_KEY, TREE_KEY, STAGE_KEY]);
    let dir = TempDir::new().unwrap();

    let base = base_body();
    let tree: Vec<u8> = vec![0xA5u8; BASE_SIZE as usize];
    let stage = stage_body();
    fill_segment(BASE_KEY, BASE_SIZE, &base);
    fill_segment(TREE_KEY, BASE_SIZE, &tree);
    fill_segment(STAGE_KEY, STAGE_SIZE, &stage);

    // Backup: three raw files, byte-identical to the segments.
    let backup = config(Mode::Backup, 15, dir.path().to_path_buf());
    assert!(driver::run(&backup).unwrap());
    for (name, expected) in [
        ("aef20000.dat", &base),
        ("aef20001.dat", &tree),
        ("aef20100.dat", &stage),
    ] {
        let written = fs::read(dir.path().join(name)).unwrap();
        assert_eq!(&written, expected, "{name} differs from its segment");
    }

    // A second backup into the same directory must collide and change
    // nothing.
    assert!(!driver::run(&backup).unwrap());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);

    // Drop the live segments, then reconstitute them from the files.
    for key in [BASE_KEY, TREE_KEY, STAGE_KEY] {
        shm::remove(shm::lookup(key).unwrap()).unwrap();
    }
    let restore = config(Mode::Restore, 15, dir.path().to_path_buf());
    assert!(driver::run(&restore).unwrap());

    assert_eq!(read_segment(BASE_KEY, BASE_SIZE), base);
    assert_eq!(read_segment(TREE_KEY, BASE_SIZE), tree);
    assert_eq!(read_segment(STAGE_KEY, STAGE_SIZE), stage);
    // Ownership and mode follow the segment files, which inherited them
    // from the original segments.
    assert_eq!(segment_mode(STAGE_KEY), 0o640);

    // Restoring again must refuse: the keys are live now.
    assert!(!driver::run(&restore).unwrap());
}

#[test]
fn compressed_backup_restores_identically() {
    const NS_Z: &str = "vault-gz-selftest";
    const BASE_Z: u32 = 0xAEE1_F000; // instance 14, namespace id 31
    const TREE_Z: u32 = 0xAEE1_F001;
    const STAGE_Z: u32 = 0xAEE1_F100;
    let _guard = KeyGuard(&[BASE_Z, TREE_Z, STAGE_Z]);
    let dir = TempDir::new().unwrap();

    let mut base = base_body();
    base[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + 32].fill(0);
    base[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + NS_Z.len()]
        .copy_from_slice(NS_Z.as_bytes());
    let tree: Vec<u8> = vec![0x3Cu8; BASE_SIZE as usize];
    let stage = stage_body();
    fill_segment(BASE_Z, BASE_SIZE, &base);
    fill_segment(TREE_Z, BASE_SIZE, &tree);
    fill_segment(STAGE_Z, STAGE_SIZE, &stage);

    let mut backup = config(Mode::Backup, 14, dir.path().to_path_buf());
    backup.namespaces = vec![NS_Z.to_string()];
    backup.compress = true;
    assert!(driver::run(&backup).unwrap());

    // Only the stage is compressed; base and tree-index stay raw.
    assert!(dir.path().join("aee1f000.dat").exists());
    assert!(dir.path().join("aee1f001.dat").exists());
    assert!(dir.path().join("aee1f100.dat.gz").exists());

    for key in [BASE_Z, TREE_Z, STAGE_Z] {
        shm::remove(shm::lookup(key).unwrap()).unwrap();
    }

    let mut restore = config(Mode::Restore, 14, dir.path().to_path_buf());
    restore.namespaces = vec![NS_Z.to_string()];
    // -z is meaningless on restore; compressed files are auto-detected.
    restore.compress = true;
    assert!(driver::run(&restore).unwrap());

    assert_eq!(read_segment(STAGE_Z, STAGE_SIZE), stage);
    assert_eq!(read_segment(BASE_Z, BASE_SIZE), base);
}

#[test]
fn backup_collision_and_attach_filter_leave_state_untouched() {
    const NS_C: &str = "vault-coll-selftest";
    const BASE_C: u32 = 0xAED1_E000; // instance 13, namespace id 30
    const TREE_C: u32 = 0xAED1_E001;
    const STAGE_C: u32 = 0xAED1_E100;
    let _guard = KeyGuard(&[BASE_C, TREE_C, STAGE_C]);
    let dir = TempDir::new().unwrap();

    let mut base = base_body();
    base[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + 32].fill(0);
    base[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + NS_C.len()]
        .copy_from_slice(NS_C.as_bytes());
    fill_segment(BASE_C, BASE_SIZE, &base);
    fill_segment(TREE_C, BASE_SIZE, &[0u8; 16]);
    fill_segment(STAGE_C, STAGE_SIZE, &[1u8; 16]);

    let mut backup = config(Mode::Backup, 13, dir.path().to_path_buf());
    backup.namespaces = vec![NS_C.to_string()];

    // Pre-existing destination file: the whole group is refused and the
    // directory keeps exactly its prior contents.
    let blocker = dir.path().join("aed1e000.dat");
    fs::write(&blocker, b"already here").unwrap();
    assert!(!driver::run(&backup).unwrap());
    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["aed1e000.dat".to_string()]);
    assert_eq!(fs::read(&blocker).unwrap(), b"already here");
    fs::remove_file(&blocker).unwrap();

    // A held attachment makes the base segment invisible to the scan.
    let shmid = shm::lookup(BASE_C).unwrap();
    let held = ShmAttachment::read_only(shmid, BASE_SIZE).unwrap();
    assert!(!driver::run(&backup).unwrap());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    drop(held);

    // Released again, the backup goes through.
    assert!(driver::run(&backup).unwrap());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
}
