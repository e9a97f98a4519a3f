//! Analyze mode validates candidates and prints the equivalent command, but
//! never creates files or segments.

use std::fs;
use std::path::PathBuf;

use shmvault::group::VersionWindow;
use shmvault::{driver, shm, Config, Mode};
use tempfile::TempDir;

const NS: &str = "vault-an-selftest";
const BASE_KEY: u32 = 0xAEC1_D000; // instance 12, namespace id 29
const TREE_KEY: u32 = 0xAEC1_D001;
const STAGE_KEY: u32 = 0xAEC1_D100;

const BASE_NAMESPACE_OFFSET: usize = 1024;
const BASE_ARENA_COUNT_OFFSET: usize = 2152;

fn base_file() -> Vec<u8> {
    let mut body = vec![0u8; 4096];
    body[0..4].copy_from_slice(&11u32.to_le_bytes());
    body[4..8].copy_from_slice(&1u32.to_le_bytes());
    body[BASE_NAMESPACE_OFFSET..BASE_NAMESPACE_OFFSET + NS.len()].copy_from_slice(NS.as_bytes());
    body[BASE_ARENA_COUNT_OFFSET..BASE_ARENA_COUNT_OFFSET + 4]
        .copy_from_slice(&1u32.to_le_bytes());
    body
}

fn analyze_config(mode: Mode, dir: PathBuf) -> Config {
    Config {
        mode,
        analyze: true,
        check_crc: false,
        compress: false,
        verbose: false,
        instance: 12,
        namespaces: vec![NS.to_string()],
        dir,
        threads: 1,
        version_window: VersionWindow::default(),
    }
}

#[test]
fn restore_analyze_validates_files_but_creates_no_segments() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("aec1d000.dat"), base_file()).unwrap();
    fs::write(dir.path().join("aec1d001.dat"), vec![1u8; 512]).unwrap();
    fs::write(dir.path().join("aec1d100.dat"), vec![2u8; 512]).unwrap();

    let config = analyze_config(Mode::Restore, dir.path().to_path_buf());
    assert!(driver::run(&config).unwrap());

    for key in [BASE_KEY, TREE_KEY, STAGE_KEY] {
        assert!(!shm::key_exists(key), "{key:#010x} must not exist");
    }
    // The file set is untouched.
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
}

#[test]
fn restore_analyze_still_rejects_malformed_groups() {
    let dir = TempDir::new().unwrap();
    // Base and stage, but no tree-index.
    fs::write(dir.path().join("aec1d000.dat"), base_file()).unwrap();
    fs::write(dir.path().join("aec1d100.dat"), vec![2u8; 512]).unwrap();

    let config = analyze_config(Mode::Restore, dir.path().to_path_buf());
    assert!(!driver::run(&config).unwrap());
}

#[test]
fn backup_analyze_does_not_create_the_missing_directory() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("not-yet");

    let config = analyze_config(Mode::Backup, missing.clone());
    assert!(driver::run(&config).is_err());
    assert!(!missing.exists());
}

#[test]
fn empty_namespace_list_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    let mut config = analyze_config(Mode::Restore, dir.path().to_path_buf());
    config.namespaces = vec![String::new()];
    assert!(driver::run(&config).is_err());
}
