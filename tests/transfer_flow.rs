//! Pool-driven transfers over heap-backed regions: the same descriptors the
//! driver builds, minus the shared memory.

use std::fs::OpenOptions;

use shmvault::sched::{run_pool, Direction, IoDescriptor, MemRegion};
use shmvault::transfer::crc32_of;
use tempfile::TempDir;

fn open_new(dir: &TempDir, name: &str) -> std::fs::File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(dir.path().join(name))
        .unwrap()
}

fn open_existing(dir: &TempDir, name: &str) -> std::fs::File {
    OpenOptions::new()
        .read(true)
        .open(dir.path().join(name))
        .unwrap()
}

fn descriptor(
    file: std::fs::File,
    buf: &mut [u8],
    direction: Direction,
    compressed: bool,
    key: u32,
) -> IoDescriptor {
    IoDescriptor {
        key,
        direction,
        compressed,
        file,
        region: unsafe { MemRegion::from_raw_parts(buf.as_mut_ptr(), buf.len()) },
        segment_size: buf.len() as u64,
        uid: unsafe { libc::getuid() } as u32,
        gid: unsafe { libc::getgid() } as u32,
        mode: 0o640,
        shmid: -1,
        check_crc: true,
        crc32: None,
    }
}

#[test]
fn mixed_raw_and_compressed_round_trip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let mut sources: Vec<Vec<u8>> = vec![
        (0..512 * 1024).map(|i| (i % 7) as u8).collect(),
        (0..3 * 1024 * 1024).map(|i| (i % 253) as u8).collect(),
        vec![0u8; 256 * 1024], // highly compressible
    ];
    let names = ["ae001100.dat", "ae001101.dat.gz", "ad001000.dat.gz"];
    let compressed = [false, true, true];
    let keys = [0xAE00_1100u32, 0xAE00_1101, 0xAD00_1000];

    // Backup pass: memory to file.
    let mut writes = Vec::new();
    for index in 0..sources.len() {
        let file = open_new(&dir, names[index]);
        let buf = &mut sources[index];
        writes.push(descriptor(
            file,
            buf,
            Direction::Write,
            compressed[index],
            keys[index],
        ));
    }
    let (writes, result) = run_pool(writes, 2);
    result.unwrap();

    // Restore pass: file to fresh memory.
    let mut targets: Vec<Vec<u8>> = sources.iter().map(|s| vec![0u8; s.len()]).collect();
    let mut reads = Vec::new();
    for index in 0..targets.len() {
        let file = open_existing(&dir, names[index]);
        let buf = &mut targets[index];
        reads.push(descriptor(
            file,
            buf,
            Direction::Read,
            compressed[index],
            keys[index],
        ));
    }
    let (reads, result) = run_pool(reads, 3);
    result.unwrap();

    for index in 0..sources.len() {
        assert_eq!(targets[index], sources[index], "segment {index} differs");
        let expected = Some(crc32_of(&sources[index]));
        assert_eq!(writes[index].crc32, expected);
        assert_eq!(reads[index].crc32, expected);
    }

    // Raw files match the segment size exactly; compressed ones carry the
    // header plus a gzip stream.
    let raw_len = std::fs::metadata(dir.path().join(names[0])).unwrap().len();
    assert_eq!(raw_len, sources[0].len() as u64);
    let gz_len = std::fs::metadata(dir.path().join(names[2])).unwrap().len();
    assert!(gz_len < sources[2].len() as u64);
}

#[test]
fn restore_direction_fails_fast_on_a_corrupt_member() {
    let dir = TempDir::new().unwrap();
    let source: Vec<u8> = (0..64 * 1024).map(|i| (i % 11) as u8).collect();

    let mut buf = source.clone();
    let file = open_new(&dir, "ae001100.dat.gz");
    let (mut descriptors, result) = run_pool(
        vec![descriptor(file, &mut buf, Direction::Write, true, 0xAE00_1100)],
        1,
    );
    result.unwrap();
    drop(descriptors.pop());

    // Truncate the gzip stream: the declared size can no longer be filled.
    let path = dir.path().join("ae001100.dat.gz");
    let full = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full - 8).unwrap();

    let mut target = vec![0u8; source.len()];
    let file = open_existing(&dir, "ae001100.dat.gz");
    let (_reads, result) = run_pool(
        vec![descriptor(
            file,
            &mut target,
            Direction::Read,
            true,
            0xAE00_1100,
        )],
        1,
    );
    let failure = result.unwrap_err();
    assert_eq!(failure.key, 0xAE00_1100);
}
