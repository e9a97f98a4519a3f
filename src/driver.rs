//! Operation driver: turns validated namespace groups into transfer passes.
//!
//! Every resource the driver acquires is released on all paths: attachments
//! and files through their own guards, and anything this invocation created
//! through a cleanup guard that is disarmed only by an explicit commit on
//! whole-group success. A failed backup leaves the destination directory
//! exactly as it was; a failed restore leaves the segment table exactly as
//! it was.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use thiserror::Error;

use crate::config::{Config, Mode};
use crate::display;
use crate::group::{self, GroupError, GroupRecord, NamespaceGroup, Side};
use crate::inventory::{
    self, segment_file_name, FileRecord, InventoryError, ScanFilter, SegmentRecord,
};
use crate::sched::{self, Direction, IoDescriptor};
use crate::shm::{self, ShmAttachment, ShmError};
use crate::transfer::{self, TransferError};

const DEFAULT_FILE_MODE: u32 = 0o666;
const DEFAULT_SEGMENT_MODE: u32 = 0o666;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no usable namespace names were supplied")]
    NoNamespaces,
    #[error("cannot access directory {path}: {reason}")]
    Directory { path: PathBuf, reason: String },
    #[error(
        "did not find any suitable {what} for instance {instance}, namespace '{namespace}'"
    )]
    NothingFound {
        what: &'static str,
        instance: u8,
        namespace: String,
    },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("could not create segment file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },
    #[error("could not open segment file {path}: {source}")]
    OpenFile { path: PathBuf, source: io::Error },
    #[error("could not preallocate {bytes} bytes for {path}: {source}")]
    Preallocate {
        path: PathBuf,
        bytes: u64,
        source: io::Error,
    },
    #[error("transfer failed for key {key:#010x}: {source}")]
    Transfer { key: u32, source: TransferError },
    #[error(
        "crc32 mismatch for key {key:#010x}: recorded {recorded:#010x}, \
         recomputed {recomputed:#010x}"
    )]
    CrcMismatch {
        key: u32,
        recorded: u32,
        recomputed: u32,
    },
}

impl DriverError {
    /// Environment failures abort the whole run; everything else fails only
    /// the current namespace.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Directory { .. } | DriverError::Inventory(InventoryError::Shm(_))
        )
    }
}

/// Runs the configured operation over every requested namespace.
///
/// Returns `Ok(true)` only if every namespace succeeded; an `Err` means the
/// environment was unusable and nothing further was attempted.
pub fn run(config: &Config) -> Result<bool, DriverError> {
    let names = config.unique_namespaces();
    if names.is_empty() {
        return Err(DriverError::NoNamespaces);
    }
    match config.mode {
        Mode::Backup => ensure_directory(&config.dir, true, !config.analyze)?,
        Mode::Restore => ensure_directory(&config.dir, false, false)?,
    }

    let mut all_ok = true;
    for name in names {
        let outcome = match config.mode {
            Mode::Backup => backup_namespace(config, name),
            Mode::Restore => restore_namespace(config, name),
        };
        if let Err(err) = outcome {
            if err.is_fatal() {
                return Err(err);
            }
            error!("event=namespace_failed namespace={} error={}", name, err);
            all_ok = false;
        }
    }
    Ok(all_ok)
}

fn backup_namespace(config: &Config, namespace: &str) -> Result<(), DriverError> {
    let filter = ScanFilter {
        instance: config.instance,
        namespace: Some(namespace.to_string()),
        compute_crc: config.check_crc && !config.analyze,
    };
    let scan = inventory::list_segments(&filter)?;
    if scan.records.is_empty() {
        if let Some(err) = scan.last_error {
            warn!("event=segment_scan namespace={} last_error={}", namespace, err);
        }
        return Err(DriverError::NothingFound {
            what: "unattached database segments",
            instance: config.instance,
            namespace: namespace.to_string(),
        });
    }

    let groups = group::build_groups(&scan.records, namespace)?;
    if groups.is_empty() {
        return Err(DriverError::NothingFound {
            what: "unattached database segments",
            instance: config.instance,
            namespace: namespace.to_string(),
        });
    }

    // One look at the destination covers every candidate group.
    let existing = inventory::list_files(
        &config.dir,
        &ScanFilter {
            instance: config.instance,
            namespace: None,
            compute_crc: false,
        },
    )?
    .records;

    for candidate in groups {
        group::check_group(&candidate, config.version_window, Side::Backup)?;
        group::check_destination_clear(&candidate, &existing)?;
        if config.verbose {
            println!(
                "\n{}",
                display::segment_table(candidate.members(), config.check_crc).render()
            );
        }
        if config.analyze {
            println!("{}", planned_command(config, &candidate.namespace));
            continue;
        }
        backup_group(config, &candidate)?;
        info!(
            "event=backup_complete namespace={} instance={} segments={}",
            candidate.namespace,
            candidate.instance,
            candidate.len()
        );
    }
    Ok(())
}

fn backup_group(
    config: &Config,
    candidate: &NamespaceGroup<SegmentRecord>,
) -> Result<(), DriverError> {
    let members = candidate.members();
    let mut created = FileCleanup::new();
    let mut attachments = Vec::with_capacity(members.len());
    let mut descriptors = Vec::with_capacity(members.len());

    for member in &members {
        // The -z flag covers stage segments only; base, tree-index, and
        // meta always go raw.
        let compressed = config.compress && member.key.role.is_stage();
        let path = config.dir.join(segment_file_name(member.raw_key, compressed));

        let attachment = ShmAttachment::read_only(member.shmid, member.byte_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(DEFAULT_FILE_MODE)
            .open(&path)
            .map_err(|source| DriverError::CreateFile {
                path: path.clone(),
                source,
            })?;
        created.register(path.clone());
        if !compressed {
            preallocate(&file, &path, member.byte_size)?;
        }

        descriptors.push(IoDescriptor {
            key: member.raw_key,
            direction: Direction::Write,
            compressed,
            file,
            region: attachment.region(),
            segment_size: member.byte_size,
            uid: member.uid,
            gid: member.gid,
            mode: member.mode,
            shmid: -1,
            check_crc: config.check_crc,
            crc32: None,
        });
        attachments.push(attachment);
    }

    let (descriptors, result) = sched::run_pool(descriptors, config.threads);
    result.map_err(|failure| DriverError::Transfer {
        key: failure.key,
        source: failure.source,
    })?;

    if config.check_crc {
        for (member, descriptor) in members.iter().zip(&descriptors) {
            let recorded = member.crc32.unwrap_or_default();
            let recomputed = descriptor.crc32.unwrap_or_default();
            if recorded != recomputed {
                return Err(DriverError::CrcMismatch {
                    key: member.raw_key,
                    recorded,
                    recomputed,
                });
            }
        }
    }

    created.commit();
    Ok(())
}

fn restore_namespace(config: &Config, namespace: &str) -> Result<(), DriverError> {
    let filter = ScanFilter {
        instance: config.instance,
        namespace: Some(namespace.to_string()),
        compute_crc: false,
    };
    let scan = inventory::list_files(&config.dir, &filter)?;
    if scan.records.is_empty() {
        if let Some(err) = scan.last_error {
            warn!("event=file_scan namespace={} last_error={}", namespace, err);
        }
        return Err(DriverError::NothingFound {
            what: "database segment files",
            instance: config.instance,
            namespace: namespace.to_string(),
        });
    }

    let groups = group::build_groups(&scan.records, namespace)?;
    if groups.is_empty() {
        return Err(DriverError::NothingFound {
            what: "database segment files",
            instance: config.instance,
            namespace: namespace.to_string(),
        });
    }

    for candidate in groups {
        group::check_group(&candidate, config.version_window, Side::Restore)?;
        check_segments_clear(&candidate)?;
        if config.verbose {
            println!("\n{}", display::file_table(candidate.members()).render());
        }
        if config.analyze {
            println!("{}", planned_command(config, &candidate.namespace));
            continue;
        }
        restore_group(config, &candidate)?;
        info!(
            "event=restore_complete namespace={} instance={} segments={}",
            candidate.namespace,
            candidate.instance,
            candidate.len()
        );
    }
    Ok(())
}

/// No member key may exist as a live segment before restore.
fn check_segments_clear(candidate: &NamespaceGroup<FileRecord>) -> Result<(), DriverError> {
    for member in candidate.members() {
        if shm::key_exists(member.raw_key()) {
            return Err(GroupError::SegmentCollision {
                key: member.raw_key(),
            }
            .into());
        }
    }
    Ok(())
}

fn restore_group(config: &Config, candidate: &NamespaceGroup<FileRecord>) -> Result<(), DriverError> {
    let members = candidate.members();
    let mut created = SegmentCleanup::new();
    let mut attachments = Vec::with_capacity(members.len());
    let mut descriptors = Vec::with_capacity(members.len());

    for member in &members {
        let shmid = shm::create_exclusive(member.raw_key, member.segment_size, DEFAULT_SEGMENT_MODE)?;
        created.register(member.raw_key, shmid);
        let attachment = ShmAttachment::read_write(shmid, member.segment_size)?;
        let file = OpenOptions::new()
            .read(true)
            .open(&member.path)
            .map_err(|source| DriverError::OpenFile {
                path: member.path.clone(),
                source,
            })?;

        descriptors.push(IoDescriptor {
            key: member.raw_key,
            direction: Direction::Read,
            compressed: member.compressed,
            file,
            region: attachment.region(),
            segment_size: member.segment_size,
            uid: member.uid,
            gid: member.gid,
            mode: member.mode,
            shmid,
            check_crc: config.check_crc,
            crc32: None,
        });
        attachments.push(attachment);
    }

    let (descriptors, result) = sched::run_pool(descriptors, config.threads);
    result.map_err(|failure| DriverError::Transfer {
        key: failure.key,
        source: failure.source,
    })?;

    if config.check_crc {
        // Detach the write mappings before measuring the fresh segments.
        drop(attachments);
        for descriptor in &descriptors {
            let recorded = descriptor.crc32.unwrap_or_default();
            let recomputed = segment_crc32(descriptor.shmid, descriptor.segment_size)?;
            if recorded != recomputed {
                return Err(DriverError::CrcMismatch {
                    key: descriptor.key,
                    recorded,
                    recomputed,
                });
            }
        }
    }

    created.commit();
    Ok(())
}

fn segment_crc32(shmid: i32, len: u64) -> Result<u32, DriverError> {
    let attachment = ShmAttachment::read_only(shmid, len)?;
    Ok(transfer::crc32_of(attachment.bytes()))
}

/// The shell command equivalent to the real operation, for analyze mode.
pub fn planned_command(config: &Config, namespace: &str) -> String {
    let mut command = format!(
        "shmvault -{}",
        match config.mode {
            Mode::Backup => 'b',
            Mode::Restore => 'r',
        }
    );
    if config.instance != 0 {
        let _ = write!(command, " -i{}", config.instance);
    }
    let _ = write!(command, " -n {namespace}");
    if config.compress && config.mode == Mode::Backup {
        command.push_str(" -z");
    }
    let _ = write!(command, " -p {}", config.dir.display());
    command
}

fn preallocate(file: &std::fs::File, path: &Path, bytes: u64) -> Result<(), DriverError> {
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, bytes as libc::off_t) };
    if rc != 0 {
        return Err(DriverError::Preallocate {
            path: path.to_path_buf(),
            bytes,
            source: io::Error::from_raw_os_error(rc),
        });
    }
    Ok(())
}

/// Checks directory existence and the classic owner/group/other access bits,
/// creating the directory first when asked to.
fn ensure_directory(path: &Path, for_write: bool, create: bool) -> Result<(), DriverError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound && create => {
            fs::create_dir_all(path).map_err(|err| DriverError::Directory {
                path: path.to_path_buf(),
                reason: format!("could not create: {err}"),
            })?;
            info!("event=directory_created path={}", path.display());
            fs::metadata(path).map_err(|err| DriverError::Directory {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?
        }
        Err(err) => {
            return Err(DriverError::Directory {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
        }
    };
    if !metadata.is_dir() {
        return Err(DriverError::Directory {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mode = metadata.mode();
    let uid = unsafe { libc::getuid() } as u32;
    let gid = unsafe { libc::getgid() } as u32;
    let accessible = if for_write {
        (metadata.uid() == uid && mode & 0o200 != 0)
            || (metadata.gid() == gid && mode & 0o020 != 0)
            || mode & 0o002 != 0
    } else {
        (metadata.uid() == uid && mode & 0o400 != 0)
            || (metadata.gid() == gid && mode & 0o040 != 0)
            || mode & 0o004 != 0
    };
    if !accessible {
        return Err(DriverError::Directory {
            path: path.to_path_buf(),
            reason: format!(
                "no {} permission",
                if for_write { "write" } else { "read" }
            ),
        });
    }
    Ok(())
}

/// Removes the files this invocation created unless committed.
#[derive(Debug, Default)]
pub struct FileCleanup {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl FileCleanup {
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    pub fn register(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Disarms the guard; created files are kept.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for FileCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            if let Err(err) = fs::remove_file(path) {
                warn!(
                    "event=cleanup_unlink_failed path={} error={}",
                    path.display(),
                    err
                );
            }
        }
    }
}

/// Destroys the segments this invocation created unless committed.
#[derive(Debug, Default)]
pub struct SegmentCleanup {
    segments: Vec<(u32, i32)>,
    armed: bool,
}

impl SegmentCleanup {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            armed: true,
        }
    }

    pub fn register(&mut self, key: u32, shmid: i32) {
        self.segments.push((key, shmid));
    }

    /// Disarms the guard; created segments are kept for the server to adopt.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SegmentCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (key, shmid) in &self.segments {
            if let Err(err) = shm::remove(*shmid) {
                warn!(
                    "event=cleanup_rmid_failed key={:08x} shmid={} error={}",
                    key, shmid, err
                );
            }
        }
    }
}
